//! Sandboxed executor
//!
//! An [`ExecutionContext`] is created from a loaded artifact, the host
//! intrinsic table and an initial budget. Each `call` runs one function
//! synchronously on the calling thread, to completion or to the first trap,
//! and reports the outcome together with the budget it consumed.

use std::sync::Arc;

use derive_more::Display;
use sysvm_core::Value;
use sysvm_cranelift::TrapCode;
use tracing::{debug, warn};

use crate::artifact::LoadedArtifact;
use crate::config::SandboxConfig;
use crate::errors::{ExecutionError, InstantiationError};
use crate::instance::{Exit, Instance};
use crate::intrinsics::{AbortReason, HostIntrinsicTable};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum ExecutionState {
    Created,
    Running,
    Completed,
    Trapped,
    BudgetExhausted,
    HostAborted,
}

impl ExecutionState {
    /// Whether another call may be made in this state
    pub fn is_callable(self) -> bool {
        matches!(self, ExecutionState::Created | ExecutionState::Completed)
    }
}

/// Contract-level result of a call
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Vec<Value>),
    Trapped(TrapCode),
    BudgetExhausted,
    HostAborted(AbortReason),
}

impl ExecutionOutcome {
    pub fn state(&self) -> ExecutionState {
        match self {
            ExecutionOutcome::Completed(_) => ExecutionState::Completed,
            ExecutionOutcome::Trapped(_) => ExecutionState::Trapped,
            ExecutionOutcome::BudgetExhausted => ExecutionState::BudgetExhausted,
            ExecutionOutcome::HostAborted(_) => ExecutionState::HostAborted,
        }
    }
}

/// What a call reports back for billing
#[derive(Clone, Debug, PartialEq)]
pub struct CallReport {
    pub outcome: ExecutionOutcome,
    /// Budget consumed by this call, including the start function if it ran
    pub consumed: u64,
}

impl CallReport {
    pub fn results(&self) -> Option<&[Value]> {
        match &self.outcome {
            ExecutionOutcome::Completed(values) => Some(values),
            _ => None,
        }
    }
}

/// Bind `artifact` to the host intrinsics and allocate its sandbox.
///
/// Fails with `UnresolvedImport` before any code runs if an import has no
/// binding with a matching signature.
pub fn instantiate<T>(
    artifact: Arc<LoadedArtifact>,
    intrinsics: &HostIntrinsicTable<T>,
    data: T,
    initial_budget: u64,
    config: SandboxConfig,
) -> Result<ExecutionContext<T>, InstantiationError> {
    let imports = intrinsics.resolve_imports(&artifact.imports, &artifact.types)?;
    let start = artifact.start;
    let instance = Instance::new(artifact, imports, data, initial_budget, &config)?;
    debug!(initial_budget, "instantiated execution context");
    Ok(ExecutionContext {
        instance,
        state: ExecutionState::Created,
        start,
        initial_budget,
        config,
    })
}

/// Per-execution state: sandbox memory, remaining budget, the artifact being
/// executed and the bound host intrinsics.
///
/// Never shared between threads while running; each context owns its sandbox
/// memory exclusively.
pub struct ExecutionContext<T> {
    instance: Box<Instance<T>>,
    state: ExecutionState,
    /// Start function still to run before the first call
    start: Option<u32>,
    initial_budget: u64,
    config: SandboxConfig,
}

// The raw pointers inside the instance only refer to memory the context owns
// (or to the shared, immutable artifact code).
unsafe impl<T: Send> Send for ExecutionContext<T> {}

impl<T> ExecutionContext<T> {
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn artifact(&self) -> &Arc<LoadedArtifact> {
        self.instance.artifact()
    }

    pub fn remaining_budget(&self) -> u64 {
        self.instance.remaining_budget()
    }

    /// Total budget consumed since instantiation
    pub fn consumed(&self) -> u64 {
        self.initial_budget - self.instance.remaining_budget()
    }

    /// Deduct `amount` from the remaining budget.
    ///
    /// Returns false, draining the budget, if the balance would go negative.
    pub fn charge(&mut self, amount: u64) -> bool {
        self.instance.charge(amount)
    }

    pub fn memory(&self) -> &[u8] {
        self.instance.memory().as_slice()
    }

    pub fn memory_size_pages(&self) -> u32 {
        self.instance.memory().size_pages()
    }

    /// Current value of global `index`, typed per its declaration
    pub fn global(&self, index: u32) -> Option<Value> {
        let decl = self.instance.artifact().globals.get(index as usize)?;
        let bits = *self.instance.globals().get(index as usize)?;
        Some(Value::from_bits(decl.ty, bits))
    }

    pub fn data(&self) -> &T {
        self.instance.data()
    }

    pub fn data_mut(&mut self) -> &mut T {
        self.instance.data_mut()
    }

    pub fn into_data(self) -> T {
        (*self.instance).into_data()
    }

    /// Call an exported function by name
    pub fn call_export(&mut self, name: &str, args: &[Value]) -> Result<CallReport, ExecutionError> {
        let index = self
            .instance
            .artifact()
            .export(name)
            .ok_or_else(|| ExecutionError::FunctionNotFound(format!("export {name:?}")))?;
        self.call(index, args)
    }

    /// Call a defined function by index.
    ///
    /// Only allowed from `Created` or `Completed`. Traps, budget exhaustion
    /// and host aborts are reported in the returned outcome and leave the
    /// context in the matching terminal state.
    pub fn call(&mut self, function_index: u32, args: &[Value]) -> Result<CallReport, ExecutionError> {
        if !self.state.is_callable() {
            return Err(ExecutionError::InvalidState(self.state));
        }

        let artifact = Arc::clone(self.instance.artifact());
        if function_index < artifact.num_imported_functions() {
            return Err(ExecutionError::NotCallable(function_index));
        }
        let ty = artifact
            .function_type(function_index)
            .ok_or_else(|| ExecutionError::FunctionNotFound(format!("index {function_index}")))?;
        let actual: Vec<_> = args.iter().map(Value::ty).collect();
        if actual != ty.params {
            return Err(ExecutionError::ArgumentMismatch {
                expected: ty.clone(),
                actual,
            });
        }

        self.state = ExecutionState::Running;
        let fuel_before = self.instance.remaining_budget();

        let mut exit = Exit::Returned(Vec::new());
        if let Some(start) = self.start.take() {
            let start_ty = artifact.function_type(start).cloned().unwrap_or_default();
            exit = match self.instance.invoke(start, &start_ty, &[], &self.config) {
                Ok(exit) => exit,
                Err(err) => {
                    self.state = ExecutionState::Trapped;
                    return Err(err.into());
                }
            };
        }
        if matches!(exit, Exit::Returned(_)) {
            exit = match self.instance.invoke(function_index, ty, args, &self.config) {
                Ok(exit) => exit,
                Err(err) => {
                    self.state = ExecutionState::Trapped;
                    return Err(err.into());
                }
            };
        }

        let outcome = match exit {
            Exit::Returned(values) => ExecutionOutcome::Completed(values),
            Exit::Trap(code) => ExecutionOutcome::Trapped(code),
            Exit::BudgetExhausted => ExecutionOutcome::BudgetExhausted,
            Exit::Aborted(reason) => ExecutionOutcome::HostAborted(reason),
        };
        let consumed = fuel_before - self.instance.remaining_budget();
        self.state = outcome.state();

        match &outcome {
            ExecutionOutcome::HostAborted(reason) => {
                warn!(function_index, consumed, %reason, "execution aborted by host");
            }
            ExecutionOutcome::Trapped(code) => {
                debug!(function_index, consumed, trap = %code, "execution trapped");
            }
            _ => debug!(function_index, consumed, state = %self.state, "call finished"),
        }
        Ok(CallReport { outcome, consumed })
    }
}
