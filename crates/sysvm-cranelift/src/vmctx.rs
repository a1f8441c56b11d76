//! Layout of the VM context shared between generated code and the runtime
//!
//! Generated code receives a `*mut VMContext` as its first argument and reads
//! every piece of per-execution state through it. Field offsets are baked into
//! the machine code, so the layout below is part of the artifact format and is
//! covered by the codegen version fingerprint.

use std::ffi::c_void;
use std::mem::offset_of;

/// Entry of the dispatch table.
///
/// Indexed by function index (imports first). `code` points either into the
/// artifact's own code or at the import's host stub.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct VMFuncRef {
    pub code: *const u8,
    /// Canonical signature id checked by `call_indirect`
    pub type_id: u32,
    pub _pad: u32,
}

/// Host function pointers reachable from generated code.
///
/// These use the platform's C calling convention.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VMBuiltins {
    /// Invoke host import `index` with arguments (and, on return, results)
    /// in 64-bit slots at `values`.
    pub host_call: unsafe extern "C" fn(vmctx: *mut VMContext, index: u32, values: *mut u64),
    /// Grow linear memory by `delta` pages, returning the old size or `u32::MAX`.
    pub memory_grow: unsafe extern "C" fn(vmctx: *mut VMContext, delta: u32) -> u32,
}

/// Per-execution state read and written by generated code.
#[derive(Debug)]
#[repr(C)]
pub struct VMContext {
    pub memory_base: *mut u8,
    /// Current linear memory size in bytes
    pub memory_len: u64,
    pub globals: *mut u64,
    pub dispatch: *const VMFuncRef,
    /// Table slots hold function indices, `NULL_FUNC` for empty slots
    pub table_base: *const u32,
    pub table_len: u64,
    pub fuel_remaining: u64,
    pub call_depth_remaining: u64,
    /// Lowest native stack address generated code may run at
    pub stack_limit: u64,
    pub builtins: *const VMBuiltins,
    /// Opaque pointer back to the owning instance
    pub host_state: *mut c_void,
    pub trap_code: u32,
    pub _pad: u32,
}

/// Table slot value of an uninitialized element
pub const NULL_FUNC: u32 = u32::MAX;

pub const VM_FUNC_REF_SIZE: i64 = size_of::<VMFuncRef>() as i64;

pub mod offsets {
    use super::*;

    pub const MEMORY_BASE: i32 = offset_of!(VMContext, memory_base) as i32;
    pub const MEMORY_LEN: i32 = offset_of!(VMContext, memory_len) as i32;
    pub const GLOBALS: i32 = offset_of!(VMContext, globals) as i32;
    pub const DISPATCH: i32 = offset_of!(VMContext, dispatch) as i32;
    pub const TABLE_BASE: i32 = offset_of!(VMContext, table_base) as i32;
    pub const TABLE_LEN: i32 = offset_of!(VMContext, table_len) as i32;
    pub const FUEL_REMAINING: i32 = offset_of!(VMContext, fuel_remaining) as i32;
    pub const CALL_DEPTH_REMAINING: i32 = offset_of!(VMContext, call_depth_remaining) as i32;
    pub const STACK_LIMIT: i32 = offset_of!(VMContext, stack_limit) as i32;
    pub const BUILTINS: i32 = offset_of!(VMContext, builtins) as i32;
    pub const TRAP_CODE: i32 = offset_of!(VMContext, trap_code) as i32;

    pub const FUNC_REF_CODE: i32 = offset_of!(VMFuncRef, code) as i32;
    pub const FUNC_REF_TYPE_ID: i32 = offset_of!(VMFuncRef, type_id) as i32;

    pub const BUILTIN_HOST_CALL: i32 = offset_of!(VMBuiltins, host_call) as i32;
    pub const BUILTIN_MEMORY_GROW: i32 = offset_of!(VMBuiltins, memory_grow) as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_pointer_sized_slots() {
        assert_eq!(offsets::MEMORY_BASE, 0);
        assert_eq!(offsets::MEMORY_LEN, 8);
        assert_eq!(offsets::STACK_LIMIT, 64);
        assert_eq!(offsets::TRAP_CODE, 88);
        assert_eq!(size_of::<VMContext>(), 96);
        assert_eq!(VM_FUNC_REF_SIZE, 16);
        assert_eq!(offsets::FUNC_REF_TYPE_ID, 8);
        assert_eq!(offsets::BUILTIN_MEMORY_GROW, 8);
    }
}
