//! sysvm: an optimizing compile-and-sandbox engine for WebAssembly contracts
//!
//! Validated modules are compiled to native code with Cranelift, cached by
//! content hash, and executed inside a sandbox with bounds-checked linear
//! memory and a deterministic resource meter.

pub mod config;
pub mod engine;
pub mod errors;
pub mod intrinsics;

pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use errors::EngineError;
pub use intrinsics::{ContractHost, register_contract_api};

pub use sysvm_core::{FuncType, ValType, ValidatedModule, Value};
pub use sysvm_cranelift::{CodegenConfig, CodegenLimits, CompiledArtifact, CostSchedule, TrapCode};
pub use sysvm_runtime::{
    AbortReason, ArtifactCache, CacheConfig, CacheKey, CacheStats, CallReport, Caller,
    EngineResourceError, ExecutionContext, ExecutionError, ExecutionOutcome, ExecutionState,
    HostError, HostIntrinsicTable, InstantiationError, LoadedArtifact, SandboxConfig,
};
