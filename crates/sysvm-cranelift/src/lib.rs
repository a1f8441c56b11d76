//! Cranelift-based native code generator for sysvm
//!
//! This crate translates a [`ValidatedModule`] into a [`CompiledArtifact`]:
//! relocation-free machine code for every function, a dispatch table
//! description used to resolve direct, indirect and imported calls at
//! instantiation time, and the metadata the runtime needs to build a sandbox.
//!
//! Generated code enforces memory safety with explicit bounds checks and
//! charges a statically computed cost at every function entry and loop header.

pub mod artifact;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod meter;
mod stubs;
mod translate;
pub mod trap;
pub mod types;
pub mod vmctx;


pub use artifact::{CompiledArtifact, DispatchEntry, DispatchTarget};
pub use compiler::ModuleCompiler;
pub use config::{CODEGEN_VERSION, CodegenConfig, CodegenLimits, CostSchedule};
pub use errors::{CodegenError, CodegenErrorKind, CodegenResult};
pub use trap::TrapCode;

use sysvm_core::ValidatedModule;

/// Compile a module for the host target
pub fn compile_module(
    module: &ValidatedModule,
    config: CodegenConfig,
    max_memory_pages: u32,
) -> CodegenResult<CompiledArtifact> {
    ModuleCompiler::new(config, max_memory_pages)?.compile(module)
}
