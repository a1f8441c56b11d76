//! Error types for instantiation and execution
//!
//! Contract-level outcomes (traps, budget exhaustion, host aborts) are not
//! errors; they are reported through [`crate::ExecutionOutcome`]. The types
//! here cover failures of the engine or of the caller's request.

use derive_more::{Display, Error, From};
use sysvm_core::{FuncType, ValType};

use crate::executor::ExecutionState;

/// The host process ran out of a resource the engine needs.
///
/// This indicates the node is out of capacity, not that the contract
/// misbehaved.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum EngineResourceError {
    #[display("failed to allocate {bytes} bytes of sandbox memory")]
    SandboxMemory { bytes: u64 },

    #[display("failed to map {bytes} bytes of executable memory: {reason}")]
    CodeMemory { bytes: usize, reason: String },
}

/// Why an import could not be bound to a host intrinsic
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum UnresolvedReason {
    #[display("no host intrinsic is registered")]
    Missing,

    #[display("host intrinsic has signature {actual}, module expects {expected}")]
    SignatureMismatch { expected: FuncType, actual: FuncType },
}

#[derive(Debug, Display, Error, From)]
pub enum InstantiationError {
    #[display("unresolved import {module}.{name}: {reason}")]
    #[from(ignore)]
    UnresolvedImport {
        module: String,
        name: String,
        reason: UnresolvedReason,
    },

    #[display("{_0}")]
    EngineResource(EngineResourceError),
}

#[derive(Debug, Display, Error, From)]
pub enum ExecutionError {
    #[display("{_0}")]
    EngineResource(EngineResourceError),

    #[display("cannot call into a context in state {_0}")]
    #[from(ignore)]
    InvalidState(#[error(not(source))] ExecutionState),

    #[display("no function {_0}")]
    #[from(ignore)]
    FunctionNotFound(#[error(not(source))] String),

    #[display("function {_0} is an import and cannot be called directly")]
    #[from(ignore)]
    NotCallable(#[error(not(source))] u32),

    #[display("function expects {expected}, got arguments of type {actual:?}")]
    #[from(ignore)]
    ArgumentMismatch {
        expected: FuncType,
        actual: Vec<ValType>,
    },
}
