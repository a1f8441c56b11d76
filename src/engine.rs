//! Engine facade
//!
//! Wires the compiler, the artifact cache and the host intrinsic table
//! together. The cache and the intrinsic table are injected so several engines
//! (for tests, or different engine versions side by side) can share or
//! isolate them as needed.

use std::sync::Arc;

use sysvm_core::ValidatedModule;
use sysvm_cranelift::ModuleCompiler;
use sysvm_runtime::{
    ArtifactCache, CacheKey, ExecutionContext, HostIntrinsicTable, LoadedArtifact, instantiate,
};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::errors::EngineError;

pub struct Engine<T> {
    config: EngineConfig,
    compiler: ModuleCompiler,
    fingerprint: String,
    cache: Arc<ArtifactCache>,
    intrinsics: Arc<HostIntrinsicTable<T>>,
}

impl<T> Engine<T> {
    pub fn new(
        config: EngineConfig,
        cache: Arc<ArtifactCache>,
        intrinsics: Arc<HostIntrinsicTable<T>>,
    ) -> Result<Self, EngineError> {
        let compiler = ModuleCompiler::new(config.codegen, config.sandbox.max_memory_pages)?;
        Ok(Self {
            fingerprint: config.fingerprint(),
            config,
            compiler,
            cache,
            intrinsics,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn intrinsics(&self) -> &Arc<HostIntrinsicTable<T>> {
        &self.intrinsics
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn cache_key(&self, bytecode: &[u8]) -> CacheKey {
        CacheKey::new(bytecode, &self.fingerprint)
    }

    /// Compile WebAssembly bytecode, reusing a cached artifact when one exists
    pub fn compile(&self, bytecode: &[u8]) -> Result<Arc<LoadedArtifact>, EngineError> {
        let key = self.cache_key(bytecode);
        if let Some(artifact) = self.cache.lookup(&key) {
            return Ok(artifact);
        }
        let module = ValidatedModule::from_wasm(bytecode)?;
        self.compile_and_store(key, &module)
    }

    /// Compile an already decoded module under `key`.
    ///
    /// Failed compilations are never cached.
    pub fn compile_module(
        &self,
        key: CacheKey,
        module: &ValidatedModule,
    ) -> Result<Arc<LoadedArtifact>, EngineError> {
        if let Some(artifact) = self.cache.lookup(&key) {
            return Ok(artifact);
        }
        self.compile_and_store(key, module)
    }

    fn compile_and_store(
        &self,
        key: CacheKey,
        module: &ValidatedModule,
    ) -> Result<Arc<LoadedArtifact>, EngineError> {
        let compiled = self.compiler.compile(module)?;
        let loaded = Arc::new(LoadedArtifact::new(compiled)?);
        info!(%key, size = loaded.size_bytes(), "caching compiled artifact");
        Ok(self.cache.store(key, loaded))
    }

    /// Create a fresh execution context for `artifact` with `budget` to spend
    pub fn instantiate(
        &self,
        artifact: Arc<LoadedArtifact>,
        data: T,
        budget: u64,
    ) -> Result<ExecutionContext<T>, EngineError> {
        debug!(budget, "instantiating artifact");
        Ok(instantiate(
            artifact,
            &self.intrinsics,
            data,
            budget,
            self.config.sandbox,
        )?)
    }
}
