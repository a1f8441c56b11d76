//! Import stubs and array-call trampolines
//!
//! An import stub has the wasm signature of its import and forwards into
//! `VMBuiltins::host_call`, passing arguments and results through 64-bit
//! slots on its own stack frame. A trampoline is the reverse: the host calls it
//! with the C calling convention and a pointer to 64-bit value slots, and it
//! calls the compiled function through the dispatch table.

use cranelift_codegen::ir::{
    Function, InstBuilder, StackSlotData, StackSlotKind, UserFuncName, Value,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use sysvm_core::FuncType;

use crate::types::{
    POINTER_TYPE, host_call_signature, trampoline_signature, translate_type, vm_flags,
    wasm_signature,
};
use crate::vmctx::{VM_FUNC_REF_SIZE, offsets};

/// Namespaces of `UserFuncName`s, only used to label functions in IR dumps
pub(crate) const FUNCTION_NAMESPACE: u32 = 0;
pub(crate) const STUB_NAMESPACE: u32 = 1;
pub(crate) const TRAMPOLINE_NAMESPACE: u32 = 2;

fn slot_offset(index: usize) -> i32 {
    (index * 8) as i32
}

/// Build the stub forwarding calls of import `import` to the host.
pub(crate) fn import_stub(
    fb_ctx: &mut FunctionBuilderContext,
    import: u32,
    ty: &FuncType,
    builtin_call_conv: CallConv,
) -> Function {
    let mut func = Function::with_name_signature(
        UserFuncName::user(STUB_NAMESPACE, import),
        wasm_signature(ty),
    );
    let mut builder = FunctionBuilder::new(&mut func, fb_ctx);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry).to_vec();
    let vmctx = params[0];

    let slots = ty.params.len().max(ty.results.len()).max(1);
    let slot = builder.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        (slots * 8) as u32,
        3,
    ));
    for (i, &arg) in params[1..].iter().enumerate() {
        builder.ins().stack_store(arg, slot, slot_offset(i));
    }
    let values = builder.ins().stack_addr(POINTER_TYPE, slot, 0);

    let builtins = builder
        .ins()
        .load(POINTER_TYPE, vm_flags(), vmctx, offsets::BUILTINS);
    let host_call = builder.ins().load(
        POINTER_TYPE,
        vm_flags(),
        builtins,
        offsets::BUILTIN_HOST_CALL,
    );
    let sig = builder.import_signature(host_call_signature(builtin_call_conv));
    let index = builder
        .ins()
        .iconst(cranelift_codegen::ir::types::I32, i64::from(import));
    builder
        .ins()
        .call_indirect(sig, host_call, &[vmctx, index, values]);

    // After a host trap these slots hold garbage; callers check the trap code
    let results: Vec<Value> = ty
        .results
        .iter()
        .enumerate()
        .map(|(i, &r)| {
            builder
                .ins()
                .stack_load(translate_type(r), slot, slot_offset(i))
        })
        .collect();
    builder.ins().return_(&results);

    builder.seal_all_blocks();
    builder.finalize();
    func
}

/// Build the host entry point of defined function `function_index`.
pub(crate) fn array_call_trampoline(
    fb_ctx: &mut FunctionBuilderContext,
    function_index: u32,
    ty: &FuncType,
    call_conv: CallConv,
) -> Function {
    let mut func = Function::with_name_signature(
        UserFuncName::user(TRAMPOLINE_NAMESPACE, function_index),
        trampoline_signature(call_conv),
    );
    let mut builder = FunctionBuilder::new(&mut func, fb_ctx);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry).to_vec();
    let (vmctx, values) = (params[0], params[1]);

    let mut args = vec![vmctx];
    for (i, &p) in ty.params.iter().enumerate() {
        let arg = builder
            .ins()
            .load(translate_type(p), vm_flags(), values, slot_offset(i));
        args.push(arg);
    }

    let dispatch = builder
        .ins()
        .load(POINTER_TYPE, vm_flags(), vmctx, offsets::DISPATCH);
    let entry_ref = builder
        .ins()
        .iadd_imm(dispatch, i64::from(function_index) * VM_FUNC_REF_SIZE);
    let code = builder.ins().load(
        POINTER_TYPE,
        vm_flags(),
        entry_ref,
        offsets::FUNC_REF_CODE,
    );
    let sig = builder.import_signature(wasm_signature(ty));
    let call = builder.ins().call_indirect(sig, code, &args);
    let results = builder.inst_results(call).to_vec();
    for (i, result) in results.into_iter().enumerate() {
        builder
            .ins()
            .store(vm_flags(), result, values, slot_offset(i));
    }
    builder.ins().return_(&[]);

    builder.seal_all_blocks();
    builder.finalize();
    func
}
