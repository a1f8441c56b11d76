//! Mapping from module value types to Cranelift types and signatures

use cranelift_codegen::ir::types as cl_types;
use cranelift_codegen::ir::{AbiParam, Endianness, MemFlags, Signature};
use cranelift_codegen::isa::CallConv;
use sysvm_core::{FuncType, ValType};

/// Pointer type of every supported host
pub const POINTER_TYPE: cl_types::Type = cl_types::I64;

/// Calling convention of compiled functions and import stubs.
///
/// `Tail` places no limit on the number of return values.
pub const WASM_CALL_CONV: CallConv = CallConv::Tail;

pub fn translate_type(ty: ValType) -> cl_types::Type {
    match ty {
        ValType::I32 => cl_types::I32,
        ValType::I64 => cl_types::I64,
        ValType::F32 => cl_types::F32,
        ValType::F64 => cl_types::F64,
    }
}

/// Signature of a compiled function: the VM context pointer followed by the
/// WebAssembly parameters.
pub fn wasm_signature(ty: &FuncType) -> Signature {
    let mut sig = Signature::new(WASM_CALL_CONV);
    sig.params.push(AbiParam::new(POINTER_TYPE));
    sig.params
        .extend(ty.params.iter().map(|&p| AbiParam::new(translate_type(p))));
    sig.returns
        .extend(ty.results.iter().map(|&r| AbiParam::new(translate_type(r))));
    sig
}

/// Signature of an array-call trampoline: `(vmctx, values)`.
pub fn trampoline_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(POINTER_TYPE));
    sig.params.push(AbiParam::new(POINTER_TYPE));
    sig
}

/// Signature of `VMBuiltins::host_call`
pub fn host_call_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(POINTER_TYPE));
    sig.params.push(AbiParam::new(cl_types::I32));
    sig.params.push(AbiParam::new(POINTER_TYPE));
    sig
}

/// Signature of `VMBuiltins::memory_grow`
pub fn memory_grow_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(POINTER_TYPE));
    sig.params.push(AbiParam::new(cl_types::I32));
    sig.returns.push(AbiParam::new(cl_types::I32));
    sig
}

/// Flags for linear memory accesses. Bounds are checked explicitly beforehand.
pub fn heap_flags() -> MemFlags {
    MemFlags::new()
        .with_notrap()
        .with_endianness(Endianness::Little)
}

/// Flags for VM context, global and value-slot accesses
pub fn vm_flags() -> MemFlags {
    MemFlags::trusted()
}
