//! Compiled artifacts mapped into executable memory

use std::ops::Deref;

use sysvm_cranelift::CompiledArtifact;
use tracing::debug;

use crate::code::ExecutableMemory;
use crate::errors::EngineResourceError;

/// A compiled artifact whose code is mapped and ready to run.
///
/// Shared behind an `Arc` by the artifact cache and every execution context
/// created from it; the mapping lives until the last holder drops it.
#[derive(Debug)]
pub struct LoadedArtifact {
    artifact: CompiledArtifact,
    code: ExecutableMemory,
}

impl LoadedArtifact {
    pub fn new(artifact: CompiledArtifact) -> Result<Self, EngineResourceError> {
        let code = ExecutableMemory::new(&artifact.code)?;
        debug!(code_size = code.len(), "mapped artifact code");
        Ok(Self { artifact, code })
    }

    pub fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    pub fn code(&self) -> &ExecutableMemory {
        &self.code
    }

    /// Cache accounting size: the artifact plus its mapped copy
    pub fn size_bytes(&self) -> usize {
        self.artifact.size_bytes() + self.code.len()
    }
}

impl Deref for LoadedArtifact {
    type Target = CompiledArtifact;

    fn deref(&self) -> &CompiledArtifact {
        &self.artifact
    }
}
