//! Host intrinsic table
//!
//! The host registers native callbacks under the `(module, name)` pair a
//! contract imports them by. Instantiation resolves every import against the
//! table once and stores the bindings in the execution context, so generated
//! code never looks anything up by name.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use derive_more::{Display, Error};
use sysvm_core::{FuncType, FunctionImport, Value};

use crate::errors::{InstantiationError, UnresolvedReason};
use crate::memory::SandboxMemory;
use crate::meter;

/// Application-level reason supplied by a host intrinsic that ended execution
#[derive(Clone, Debug, Display, PartialEq, Eq)]
#[display("{message} (code {code})")]
pub struct AbortReason {
    pub code: u64,
    pub message: String,
}

impl AbortReason {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::message(format!("host intrinsic panicked: {detail}"))
    }
}

/// Failure returned by a host intrinsic
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum HostError {
    /// End the execution as `HostAborted`
    #[display("aborted: {_0}")]
    Abort(#[error(not(source))] AbortReason),

    /// The contract handed the host a pointer outside its memory; ends the
    /// execution as trapped
    #[display("out of bounds sandbox memory access")]
    MemoryOutOfBounds,

    #[display("budget exhausted")]
    BudgetExhausted,
}

impl From<AbortReason> for HostError {
    fn from(reason: AbortReason) -> Self {
        HostError::Abort(reason)
    }
}

/// View of the running execution handed to a host intrinsic.
///
/// Borrows the execution's memory, host data and meter separately, so the
/// intrinsic being called stays borrowed from the same execution context.
pub struct Caller<'a, T> {
    memory: &'a mut SandboxMemory,
    data: &'a mut T,
    fuel_remaining: &'a mut u64,
}

impl<'a, T> Caller<'a, T> {
    pub(crate) fn new(
        memory: &'a mut SandboxMemory,
        data: &'a mut T,
        fuel_remaining: &'a mut u64,
    ) -> Self {
        Self {
            memory,
            data,
            fuel_remaining,
        }
    }

    pub fn data(&self) -> &T {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut *self.data
    }

    pub fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }

    /// Borrow `len` bytes of sandbox memory at `ptr`
    pub fn read(&self, ptr: u32, len: u32) -> Result<&[u8], HostError> {
        self.memory
            .read(ptr, len)
            .ok_or(HostError::MemoryOutOfBounds)
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, HostError> {
        let bytes = self.read(ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Copy `bytes` into sandbox memory at `ptr`; nothing is written on failure
    pub fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), HostError> {
        self.memory
            .write(ptr, bytes)
            .ok_or(HostError::MemoryOutOfBounds)
    }

    /// Charge the execution's meter on behalf of the host
    pub fn charge(&mut self, amount: u64) -> Result<(), HostError> {
        if meter::charge(self.fuel_remaining, amount) {
            Ok(())
        } else {
            Err(HostError::BudgetExhausted)
        }
    }

    pub fn remaining_budget(&self) -> u64 {
        *self.fuel_remaining
    }
}

pub type HostFn<T> =
    dyn Fn(&mut Caller<'_, T>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync;

/// A registered callback and the signature it was registered with
pub struct HostIntrinsic<T> {
    signature: FuncType,
    callback: Arc<HostFn<T>>,
}

impl<T> HostIntrinsic<T> {
    pub fn signature(&self) -> &FuncType {
        &self.signature
    }

    pub(crate) fn invoke(
        &self,
        caller: &mut Caller<'_, T>,
        args: &[Value],
    ) -> Result<Vec<Value>, HostError> {
        (self.callback)(caller, args)
    }
}

impl<T> Clone for HostIntrinsic<T> {
    fn clone(&self) -> Self {
        Self {
            signature: self.signature.clone(),
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> fmt::Debug for HostIntrinsic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostIntrinsic")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Registry of host callbacks, shared by every execution of an engine.
///
/// Registration happens at start-up; lookups during instantiation never block
/// each other.
pub struct HostIntrinsicTable<T> {
    bindings: DashMap<(String, String), HostIntrinsic<T>>,
}

impl<T> HostIntrinsicTable<T> {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
        }
    }

    /// Register `callback` as `module.name`, replacing any previous binding
    pub fn register<F>(
        &self,
        module: impl Into<String>,
        name: impl Into<String>,
        signature: FuncType,
        callback: F,
    ) -> Option<HostIntrinsic<T>>
    where
        F: Fn(&mut Caller<'_, T>, &[Value]) -> Result<Vec<Value>, HostError>
            + Send
            + Sync
            + 'static,
    {
        self.bindings.insert(
            (module.into(), name.into()),
            HostIntrinsic {
                signature,
                callback: Arc::new(callback),
            },
        )
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.bindings
            .contains_key(&(module.to_string(), name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Find the binding for `module.name` with exactly the `expected` signature
    pub fn resolve(
        &self,
        module: &str,
        name: &str,
        expected: &FuncType,
    ) -> Result<HostIntrinsic<T>, UnresolvedReason> {
        let key = (module.to_string(), name.to_string());
        let binding = self.bindings.get(&key).ok_or(UnresolvedReason::Missing)?;
        if binding.signature != *expected {
            return Err(UnresolvedReason::SignatureMismatch {
                expected: expected.clone(),
                actual: binding.signature.clone(),
            });
        }
        Ok(binding.clone())
    }

    /// Bind every import of a module, in import order
    pub(crate) fn resolve_imports(
        &self,
        imports: &[FunctionImport],
        types: &[FuncType],
    ) -> Result<Vec<HostIntrinsic<T>>, InstantiationError> {
        imports
            .iter()
            .map(|import| {
                let unresolved = |reason| InstantiationError::UnresolvedImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                    reason,
                };
                let expected = types
                    .get(import.type_index as usize)
                    .ok_or_else(|| unresolved(UnresolvedReason::Missing))?;
                self.resolve(&import.module, &import.name, expected)
                    .map_err(unresolved)
            })
            .collect()
    }
}

impl<T> Default for HostIntrinsicTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use sysvm_core::ValType;

    use super::*;

    fn table() -> HostIntrinsicTable<()> {
        let table = HostIntrinsicTable::<()>::new();
        table.register(
            "env",
            "printi",
            FuncType::new([ValType::I64], []),
            |_, _| Ok(vec![]),
        );
        table
    }

    #[test]
    fn test_resolve_by_name_and_signature() {
        let table = table();
        let ty = FuncType::new([ValType::I64], []);
        assert!(table.resolve("env", "printi", &ty).is_ok());
        assert_eq!(
            table.resolve("env", "prints", &ty).unwrap_err(),
            UnresolvedReason::Missing
        );
    }

    #[test]
    fn test_signature_mismatch_is_unresolved() {
        let err = table()
            .resolve_imports(
                &[FunctionImport {
                    module: "env".into(),
                    name: "printi".into(),
                    type_index: 0,
                }],
                &[FuncType::new([ValType::I32], [])],
            )
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"unresolved import env.printi: host intrinsic has signature (i64) -> (), module expects (i32) -> ()");
    }

    #[test]
    fn test_reregistration_replaces_binding() {
        let table = table();
        let previous = table.register(
            "env",
            "printi",
            FuncType::new([ValType::I32], []),
            |_, _| Ok(vec![]),
        );
        assert!(previous.is_some());
        assert_eq!(table.len(), 1);
        assert!(table.contains("env", "printi"));
    }

    #[test]
    fn test_panic_payload_becomes_abort_reason() {
        let reason = AbortReason::from_panic(Box::new("boom"));
        insta::assert_snapshot!(reason.to_string(), @"host intrinsic panicked: boom (code 0)");
    }
}
