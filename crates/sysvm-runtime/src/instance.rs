//! Per-execution sandbox state and the builtins generated code calls into
//!
//! An `Instance` owns everything one execution context touches: the VM
//! context handed to generated code, the linear memory, globals, table and
//! dispatch table, and the resolved host intrinsic bindings. It is always
//! boxed so the pointers published in the VM context stay valid.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use sysvm_core::{FuncType, Value};
use sysvm_cranelift::TrapCode;
use sysvm_cranelift::vmctx::{VMBuiltins, VMContext, VMFuncRef};
use tracing::debug;

use crate::artifact::LoadedArtifact;
use crate::config::SandboxConfig;
use crate::errors::EngineResourceError;
use crate::intrinsics::{AbortReason, Caller, HostError, HostIntrinsic};
use crate::memory::{GrowError, SandboxMemory};
use crate::meter;
use crate::stack;

/// Signature of the array-call trampolines compiled for every defined function
type ArrayCallTrampoline = unsafe extern "C" fn(vmctx: *mut VMContext, values: *mut u64);

/// How one invocation of generated code ended
#[derive(Debug)]
pub(crate) enum Exit {
    Returned(Vec<Value>),
    Trap(TrapCode),
    BudgetExhausted,
    Aborted(AbortReason),
}

pub(crate) struct Instance<T> {
    vmctx: VMContext,
    builtins: VMBuiltins,
    artifact: Arc<LoadedArtifact>,
    memory: SandboxMemory,
    globals: Vec<u64>,
    table: Vec<u32>,
    dispatch: Vec<VMFuncRef>,
    imports: Vec<HostIntrinsic<T>>,
    /// Argument buffer reused across host calls
    host_args: Vec<Value>,
    data: T,
    pending_abort: Option<AbortReason>,
    pending_resource_error: Option<EngineResourceError>,
}

impl<T> Instance<T> {
    pub(crate) fn new(
        artifact: Arc<LoadedArtifact>,
        imports: Vec<HostIntrinsic<T>>,
        data: T,
        fuel: u64,
        config: &SandboxConfig,
    ) -> Result<Box<Self>, EngineResourceError> {
        let mut memory = SandboxMemory::new(artifact.memory, config.max_memory_pages)?;
        for segment in &artifact.data {
            // Segment bounds were checked against the initial size at compile time
            let written = memory.write(segment.offset, &segment.bytes);
            debug_assert!(written.is_some(), "data segment outside initial memory");
        }

        let globals = artifact
            .globals
            .iter()
            .map(|global| global.init.to_bits())
            .collect();
        let dispatch = artifact
            .dispatch
            .iter()
            .map(|entry| VMFuncRef {
                code: artifact
                    .code()
                    .address(entry.code_offset())
                    .unwrap_or(ptr::null()),
                type_id: entry.type_id,
                _pad: 0,
            })
            .collect();

        let mut instance = Box::new(Self {
            vmctx: VMContext {
                memory_base: ptr::null_mut(),
                memory_len: 0,
                globals: ptr::null_mut(),
                dispatch: ptr::null(),
                table_base: ptr::null(),
                table_len: 0,
                fuel_remaining: fuel,
                call_depth_remaining: 0,
                stack_limit: 0,
                builtins: ptr::null(),
                host_state: ptr::null_mut(),
                trap_code: TrapCode::NONE,
                _pad: 0,
            },
            builtins: VMBuiltins {
                host_call: host_call::<T>,
                memory_grow: memory_grow::<T>,
            },
            table: artifact.table_init.clone(),
            artifact,
            memory,
            globals,
            dispatch,
            imports,
            host_args: Vec::new(),
            data,
            pending_abort: None,
            pending_resource_error: None,
        });
        instance.link();
        Ok(instance)
    }

    /// Publish the addresses of everything generated code reaches through the VM context
    fn link(&mut self) {
        self.vmctx.memory_base = self.memory.base_ptr();
        self.vmctx.memory_len = self.memory.len() as u64;
        self.vmctx.globals = self.globals.as_mut_ptr();
        self.vmctx.dispatch = self.dispatch.as_ptr();
        self.vmctx.table_base = self.table.as_ptr();
        self.vmctx.table_len = self.table.len() as u64;
        self.vmctx.builtins = &self.builtins;
        self.vmctx.host_state = self as *mut Self as *mut c_void;
    }

    /// Recover the instance behind a VM context pointer.
    ///
    /// # Safety
    /// `vmctx` must be the context of a live `Instance<T>` that is currently
    /// running generated code, with no other reference to it in use.
    unsafe fn from_vmctx<'a>(vmctx: *mut VMContext) -> &'a mut Self {
        unsafe { &mut *((*vmctx).host_state as *mut Self) }
    }

    pub(crate) fn artifact(&self) -> &Arc<LoadedArtifact> {
        &self.artifact
    }

    pub(crate) fn data(&self) -> &T {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub(crate) fn into_data(self) -> T {
        self.data
    }

    pub(crate) fn memory(&self) -> &SandboxMemory {
        &self.memory
    }

    pub(crate) fn globals(&self) -> &[u64] {
        &self.globals
    }

    pub(crate) fn remaining_budget(&self) -> u64 {
        self.vmctx.fuel_remaining
    }

    pub(crate) fn charge(&mut self, amount: u64) -> bool {
        meter::charge(&mut self.vmctx.fuel_remaining, amount)
    }

    /// Run `function_index` to completion or to its first trap.
    ///
    /// Defined functions enter generated code through their array-call
    /// trampoline; an imported function (only reachable as a start function)
    /// is dispatched to its host binding directly.
    pub(crate) fn invoke(
        &mut self,
        function_index: u32,
        ty: &FuncType,
        args: &[Value],
        config: &SandboxConfig,
    ) -> Result<Exit, EngineResourceError> {
        let mut values = vec![0u64; ty.params.len().max(ty.results.len()).max(1)];
        for (slot, arg) in values.iter_mut().zip(args) {
            *slot = arg.to_bits();
        }

        self.link();
        self.vmctx.trap_code = TrapCode::NONE;
        self.vmctx.call_depth_remaining = u64::from(config.max_call_depth);
        let marker = 0u8;
        let stack_top = ptr::addr_of!(marker) as usize;
        self.vmctx.stack_limit = stack::stack_limit(
            stack_top,
            config.max_native_stack,
            self.artifact.max_frame_size,
        ) as u64;

        let artifact = Arc::clone(&self.artifact);
        let entry = artifact
            .trampoline_offset(function_index)
            .and_then(|offset| artifact.code().address(offset));
        match entry {
            Some(entry) => {
                let trampoline: ArrayCallTrampoline = unsafe { std::mem::transmute(entry) };
                let vmctx: *mut VMContext = &mut self.vmctx;
                unsafe { trampoline(vmctx, values.as_mut_ptr()) };
            }
            None => self.call_host_guarded(function_index, values.as_mut_ptr()),
        }

        let raw = std::mem::replace(&mut self.vmctx.trap_code, TrapCode::NONE);
        let exit = match TrapCode::from_raw(raw) {
            None => Exit::Returned(
                ty.results
                    .iter()
                    .zip(&values)
                    .map(|(&result, &bits)| Value::from_bits(result, bits))
                    .collect(),
            ),
            Some(TrapCode::BudgetExhausted) => Exit::BudgetExhausted,
            Some(TrapCode::HostAbort) => Exit::Aborted(
                self.pending_abort
                    .take()
                    .unwrap_or_else(|| AbortReason::message("aborted by host")),
            ),
            Some(TrapCode::EngineResource) => {
                return Err(self.pending_resource_error.take().unwrap_or(
                    EngineResourceError::SandboxMemory {
                        bytes: self.memory.len() as u64,
                    },
                ));
            }
            Some(trap) => Exit::Trap(trap),
        };
        Ok(exit)
    }

    /// Call host import `index`, converting every failure (panics included)
    /// into a trap code for generated code to unwind on
    fn call_host_guarded(&mut self, index: u32, values: *mut u64) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.call_host(index, values)));
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => HostError::Abort(AbortReason::from_panic(payload)),
        };
        let code = match err {
            HostError::Abort(reason) => {
                self.pending_abort = Some(reason);
                TrapCode::HostAbort
            }
            HostError::MemoryOutOfBounds => TrapCode::HeapOutOfBounds,
            HostError::BudgetExhausted => {
                self.vmctx.fuel_remaining = 0;
                TrapCode::BudgetExhausted
            }
        };
        self.vmctx.trap_code = code.as_raw();
    }

    fn call_host(&mut self, index: u32, values: *mut u64) -> Result<(), HostError> {
        let Self {
            vmctx,
            memory,
            imports,
            host_args,
            data,
            ..
        } = self;
        let intrinsic = imports
            .get(index as usize)
            .ok_or_else(|| AbortReason::message(format!("no host binding for import {index}")))?;
        let ty = intrinsic.signature();
        host_args.clear();
        host_args.extend(
            ty.params
                .iter()
                .enumerate()
                .map(|(i, &param)| Value::from_bits(param, unsafe { *values.add(i) })),
        );

        let mut caller = Caller::new(memory, data, &mut vmctx.fuel_remaining);
        let results = intrinsic.invoke(&mut caller, host_args)?;

        let matches = results.len() == ty.results.len()
            && results.iter().zip(&ty.results).all(|(v, &t)| v.ty() == t);
        if !matches {
            return Err(AbortReason::message(format!(
                "host intrinsic returned values not matching {ty}"
            ))
            .into());
        }
        for (i, value) in results.iter().enumerate() {
            unsafe { *values.add(i) = value.to_bits() };
        }
        Ok(())
    }

    /// `memory.grow` on behalf of generated code.
    ///
    /// A request past the maximum is refused before anything is charged; only
    /// pages that will actually be granted cost budget.
    fn grow_memory(&mut self, delta: u32) -> u32 {
        if let Err(err) = self.memory.check_grow(delta) {
            debug!(%err, "memory.grow refused");
            return u32::MAX;
        }
        let cost = self
            .artifact
            .memory_grow_page_cost
            .saturating_mul(u64::from(delta));
        if !self.charge(cost) {
            self.vmctx.trap_code = TrapCode::BudgetExhausted.as_raw();
            return u32::MAX;
        }
        match self.memory.grow(delta) {
            Ok(previous) => {
                self.vmctx.memory_base = self.memory.base_ptr();
                self.vmctx.memory_len = self.memory.len() as u64;
                previous
            }
            Err(GrowError::Refused(err)) => {
                debug!(%err, "memory.grow refused");
                u32::MAX
            }
            Err(GrowError::Resource(err)) => {
                self.pending_resource_error = Some(err);
                self.vmctx.trap_code = TrapCode::EngineResource.as_raw();
                u32::MAX
            }
        }
    }
}

unsafe extern "C" fn host_call<T>(vmctx: *mut VMContext, index: u32, values: *mut u64) {
    let instance = unsafe { Instance::<T>::from_vmctx(vmctx) };
    instance.call_host_guarded(index, values);
}

unsafe extern "C" fn memory_grow<T>(vmctx: *mut VMContext, delta: u32) -> u32 {
    let instance = unsafe { Instance::<T>::from_vmctx(vmctx) };
    match panic::catch_unwind(AssertUnwindSafe(|| instance.grow_memory(delta))) {
        Ok(previous) => previous,
        Err(payload) => {
            instance.pending_abort = Some(AbortReason::from_panic(payload));
            instance.vmctx.trap_code = TrapCode::HostAbort.as_raw();
            u32::MAX
        }
    }
}
