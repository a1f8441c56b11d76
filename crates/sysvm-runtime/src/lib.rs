//! Sandboxed execution of compiled sysvm artifacts
//!
//! This crate maps [`sysvm_cranelift::CompiledArtifact`]s into executable
//! memory, caches them by content, binds their imports to a
//! [`HostIntrinsicTable`] and runs them inside an [`ExecutionContext`] that owns
//! its linear memory and resource budget.

pub mod artifact;
pub mod cache;
pub mod code;
pub mod config;
pub mod errors;
pub mod executor;
mod instance;
pub mod intrinsics;
pub mod memory;
pub mod meter;
mod stack;


pub use artifact::LoadedArtifact;
pub use cache::{ArtifactCache, CacheConfig, CacheKey, CacheStats};
pub use config::SandboxConfig;
pub use errors::{EngineResourceError, ExecutionError, InstantiationError, UnresolvedReason};
pub use executor::{CallReport, ExecutionContext, ExecutionOutcome, ExecutionState, instantiate};
pub use intrinsics::{AbortReason, Caller, HostError, HostFn, HostIntrinsic, HostIntrinsicTable};
pub use memory::{GrowError, MemoryGrowFailed, SandboxMemory};
