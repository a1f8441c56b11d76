//! Engine configuration
//!
//! Loaded from JSON; every section and field is optional and falls back to
//! its default.

use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use sysvm_cranelift::CodegenConfig;
use sysvm_runtime::{CacheConfig, SandboxConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub codegen: CodegenConfig,
    pub sandbox: SandboxConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("failed to read {}: {source}", path.display())]
    #[from(ignore)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[display("invalid engine configuration: {_0}")]
    Parse(serde_json::Error),
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Identity of everything that shapes generated code, part of every cache key
    pub fn fingerprint(&self) -> String {
        self.codegen.fingerprint(self.sandbox.max_memory_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "codegen": { "cost": { "loop_iteration": 25 }, "max_functions": 10 },
                "sandbox": { "max_memory_pages": 16 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.codegen.cost.loop_iteration, 25);
        assert_eq!(config.codegen.cost.function_entry, 10);
        assert_eq!(config.codegen.limits.max_functions, 10);
        assert_eq!(config.codegen.limits.max_function_locals, 50_000);
        assert_eq!(config.sandbox.max_memory_pages, 16);
        assert_eq!(config.sandbox.max_call_depth, 250);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_fingerprint_tracks_cost_schedule() {
        let base = EngineConfig::default();
        let mut cheaper = base;
        cheaper.codegen.cost.per_instruction = 0;
        assert_ne!(base.fingerprint(), cheaper.fingerprint());

        let mut bigger_cache = base;
        bigger_cache.cache.max_entries += 1;
        assert_eq!(base.fingerprint(), bigger_cache.fingerprint());
    }

    #[test]
    fn test_malformed_config() {
        let err = EngineConfig::from_json(r#"{ "sandbox": { "max_call_depth": "deep" } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
