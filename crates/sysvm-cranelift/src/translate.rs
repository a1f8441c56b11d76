//! Function-level code generation
//!
//! Translates the flat instruction sequence of one function body into
//! Cranelift IR using `FunctionBuilder`. Operands live on a compile-time value
//! stack. Values crossing a control-flow edge (block results, loop parameters)
//! are carried in Cranelift variables, so every branch in the generated IR
//! takes no block arguments.
//!
//! Every trap condition is an explicit check. A failing check records its
//! trap code in the VM context and jumps to the function's trap-return block,
//! which returns zeroed results to the caller. Callers test the trap code after
//! every call and propagate the unwind in the same way.

use std::collections::{BTreeMap, HashMap};

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift_codegen::ir::types as cl_types;
use cranelift_codegen::ir::{Block, InstBuilder, SigRef, Value};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Switch, Variable};
use sysvm_core::{
    BlockType, Conversion, FloatOp, FloatWidth, FuncType, FunctionBody, Instruction, IntOp,
    IntWidth, MemArg, ValType, ValidatedModule,
};

use crate::errors::{CodegenError, CodegenResult};
use crate::meter::FunctionCosts;
use crate::trap::TrapCode;
use crate::types::{
    POINTER_TYPE, heap_flags, memory_grow_signature, translate_type, vm_flags, wasm_signature,
};
use crate::vmctx::{NULL_FUNC, VM_FUNC_REF_SIZE, offsets};

/// Module-wide information needed while translating a single function
pub(crate) struct ModuleEnv<'m> {
    pub module: &'m ValidatedModule,
    /// Canonical signature id of each type index
    pub type_ids: &'m [u32],
    /// Calling convention of the host builtins
    pub builtin_call_conv: CallConv,
}

impl ModuleEnv<'_> {
    fn func_type(&self, type_index: u32) -> CodegenResult<&FuncType> {
        self.module
            .types
            .get(type_index as usize)
            .ok_or_else(|| CodegenError::invalid_module(format!("unknown type {type_index}")))
    }

    fn block_signature(&self, ty: BlockType) -> CodegenResult<(Vec<ValType>, Vec<ValType>)> {
        Ok(match ty {
            BlockType::Empty => (vec![], vec![]),
            BlockType::Value(ty) => (vec![], vec![ty]),
            BlockType::Func(index) => {
                let ty = self.func_type(index)?;
                (ty.params.clone(), ty.results.clone())
            }
        })
    }
}

enum FrameKind {
    Function,
    Block,
    Loop,
    If {
        else_block: Block,
        /// Parameters are visible to both arms
        params: Vec<Value>,
        has_else: bool,
    },
}

struct Frame {
    kind: FrameKind,
    /// Target of branches to this frame: the header for loops, the
    /// continuation otherwise
    branch_block: Block,
    end_block: Block,
    /// Variables a branch to this frame assigns before jumping
    branch_vars: Vec<Variable>,
    result_vars: Vec<Variable>,
    /// Operand stack height below the frame's parameters
    stack_height: usize,
    /// Whether any edge reaches `end_block`
    end_reachable: bool,
}

impl Frame {
    fn is_loop(&self) -> bool {
        matches!(self.kind, FrameKind::Loop)
    }
}

pub(crate) struct FunctionTranslator<'a, 'm> {
    env: &'a ModuleEnv<'m>,
    builder: FunctionBuilder<'a>,
    entry: Block,
    vmctx: Value,
    locals: Vec<Variable>,
    next_var: u32,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    reachable: bool,
    /// Frames opened inside unreachable code that have not ended yet
    unreachable_depth: u32,
    results: Vec<ValType>,
    loop_costs: Vec<u64>,
    next_loop: usize,
    /// Trap blocks in creation order
    trap_blocks: Vec<(TrapCode, Block)>,
    trap_return: Option<Block>,
    signatures: HashMap<u32, SigRef>,
    memory_grow_sig: Option<SigRef>,
}

impl<'a, 'm> FunctionTranslator<'a, 'm> {
    /// Start translating into `builder`, whose function signature must be the
    /// wasm signature of the body about to be translated.
    pub(crate) fn new(env: &'a ModuleEnv<'m>, mut builder: FunctionBuilder<'a>) -> Self {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let vmctx = builder.block_params(entry)[0];
        Self {
            env,
            builder,
            entry,
            vmctx,
            locals: Vec::new(),
            next_var: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            reachable: true,
            unreachable_depth: 0,
            results: Vec::new(),
            loop_costs: Vec::new(),
            next_loop: 0,
            trap_blocks: Vec::new(),
            trap_return: None,
            signatures: HashMap::new(),
            memory_grow_sig: None,
        }
    }

    pub(crate) fn translate(
        mut self,
        body: &FunctionBody,
        costs: &FunctionCosts,
    ) -> CodegenResult<()> {
        let ty = self.env.func_type(body.type_index)?.clone();
        self.results = ty.results.clone();
        self.loop_costs = costs.loops.clone();

        let params = self.builder.block_params(self.entry).to_vec();
        for (&param_ty, &value) in ty.params.iter().zip(&params[1..]) {
            let var = self.new_var(param_ty);
            self.builder.def_var(var, value);
            self.locals.push(var);
        }
        for &local_ty in &body.locals {
            let var = self.new_var(local_ty);
            let zero = self.zero(local_ty);
            self.builder.def_var(var, zero);
            self.locals.push(var);
        }

        self.meter(costs.entry);
        self.enter_call();

        let exit = self.builder.create_block();
        let result_vars = self.new_vars(&ty.results);
        self.frames.push(Frame {
            kind: FrameKind::Function,
            branch_block: exit,
            end_block: exit,
            branch_vars: result_vars.clone(),
            result_vars,
            stack_height: 0,
            end_reachable: false,
        });

        for instr in &body.body {
            if self.frames.is_empty() {
                return Err(CodegenError::invalid_module(
                    "instructions after the end of the function body",
                ));
            }
            self.translate_instruction(instr)?;
        }
        if !self.frames.is_empty() {
            return Err(CodegenError::invalid_module(
                "function body is missing its final end",
            ));
        }

        self.emit_trap_blocks();
        self.builder.seal_all_blocks();
        self.builder.finalize();
        Ok(())
    }

    fn new_var(&mut self, ty: ValType) -> Variable {
        let var = Variable::from_u32(self.next_var);
        self.next_var += 1;
        self.builder.declare_var(var, translate_type(ty));
        var
    }

    fn new_vars(&mut self, types: &[ValType]) -> Vec<Variable> {
        types.iter().map(|&ty| self.new_var(ty)).collect()
    }

    fn pop(&mut self) -> CodegenResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| CodegenError::invalid_module("operand stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> CodegenResult<Vec<Value>> {
        let len = self.stack.len();
        if len < n {
            return Err(CodegenError::invalid_module("operand stack underflow"));
        }
        Ok(self.stack.split_off(len - n))
    }

    fn peek_n(&self, n: usize) -> CodegenResult<&[Value]> {
        let len = self.stack.len();
        if len < n {
            return Err(CodegenError::invalid_module("operand stack underflow"));
        }
        Ok(&self.stack[len - n..])
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn frame_index(&self, depth: u32) -> CodegenResult<usize> {
        self.frames
            .len()
            .checked_sub(depth as usize + 1)
            .ok_or_else(|| CodegenError::invalid_module(format!("branch depth {depth} out of range")))
    }

    fn int_const(&mut self, ty: cl_types::Type, value: i64) -> Value {
        // Narrow immediates must be zero-extended
        let bits = if ty == cl_types::I32 {
            i64::from(value as u32)
        } else {
            value
        };
        self.builder.ins().iconst(ty, bits)
    }

    fn zero(&mut self, ty: ValType) -> Value {
        match ty {
            ValType::I32 => self.builder.ins().iconst(cl_types::I32, 0),
            ValType::I64 => self.builder.ins().iconst(cl_types::I64, 0),
            ValType::F32 => self.builder.ins().f32const(Ieee32::with_bits(0)),
            ValType::F64 => self.builder.ins().f64const(Ieee64::with_bits(0)),
        }
    }

    fn bool_to_i32(&mut self, cond: Value) -> Value {
        self.builder.ins().uextend(cl_types::I32, cond)
    }

    fn load_vmctx(&mut self, ty: cl_types::Type, offset: i32) -> Value {
        self.builder.ins().load(ty, vm_flags(), self.vmctx, offset)
    }

    fn store_vmctx(&mut self, value: Value, offset: i32) {
        self.builder
            .ins()
            .store(vm_flags(), value, self.vmctx, offset);
    }

    // === Traps ===

    fn trap_block(&mut self, code: TrapCode) -> Block {
        if let Some(&(_, block)) = self.trap_blocks.iter().find(|(c, _)| *c == code) {
            return block;
        }
        let block = self.builder.create_block();
        self.builder.set_cold_block(block);
        self.trap_blocks.push((code, block));
        block
    }

    fn trap_return_block(&mut self) -> Block {
        if let Some(block) = self.trap_return {
            return block;
        }
        let block = self.builder.create_block();
        self.builder.set_cold_block(block);
        self.trap_return = Some(block);
        block
    }

    /// Trap with `code` when `cond` is non-zero
    fn trap_if(&mut self, cond: Value, code: TrapCode) {
        let trap = self.trap_block(code);
        let cont = self.builder.create_block();
        self.builder.ins().brif(cond, trap, &[], cont, &[]);
        self.builder.switch_to_block(cont);
    }

    fn trap(&mut self, code: TrapCode) {
        let trap = self.trap_block(code);
        self.builder.ins().jump(trap, &[]);
        self.reachable = false;
    }

    /// Unwind if the callee left a trap code behind
    fn check_trap_code(&mut self) {
        let code = self.load_vmctx(cl_types::I32, offsets::TRAP_CODE);
        let trap_return = self.trap_return_block();
        let cont = self.builder.create_block();
        self.builder.ins().brif(code, trap_return, &[], cont, &[]);
        self.builder.switch_to_block(cont);
    }

    fn emit_trap_blocks(&mut self) {
        for (code, block) in std::mem::take(&mut self.trap_blocks) {
            self.builder.switch_to_block(block);
            if code == TrapCode::BudgetExhausted {
                let zero = self.builder.ins().iconst(cl_types::I64, 0);
                self.store_vmctx(zero, offsets::FUEL_REMAINING);
            }
            let raw = self.int_const(cl_types::I32, i64::from(code.as_raw()));
            self.store_vmctx(raw, offsets::TRAP_CODE);
            let trap_return = self.trap_return_block();
            self.builder.ins().jump(trap_return, &[]);
        }
        if let Some(block) = self.trap_return {
            self.builder.switch_to_block(block);
            let results = self.results.clone();
            let zeros: Vec<Value> = results.iter().map(|&ty| self.zero(ty)).collect();
            self.builder.ins().return_(&zeros);
        }
    }

    // === Metering and call depth ===

    /// Charge a statically known amount against the remaining fuel
    fn meter(&mut self, cost: u64) {
        if cost == 0 {
            return;
        }
        let fuel = self.load_vmctx(cl_types::I64, offsets::FUEL_REMAINING);
        let cost = self.builder.ins().iconst(cl_types::I64, cost as i64);
        let short = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedLessThan, fuel, cost);
        self.trap_if(short, TrapCode::BudgetExhausted);
        let left = self.builder.ins().isub(fuel, cost);
        self.store_vmctx(left, offsets::FUEL_REMAINING);
    }

    fn enter_call(&mut self) {
        let depth = self.load_vmctx(cl_types::I64, offsets::CALL_DEPTH_REMAINING);
        let exhausted = self.builder.ins().icmp_imm(IntCC::Equal, depth, 0);
        self.trap_if(exhausted, TrapCode::CallStackExhausted);

        // Backstop for large frames: the native stack must stay above the limit
        let sp = self.builder.ins().get_stack_pointer(POINTER_TYPE);
        let limit = self.load_vmctx(POINTER_TYPE, offsets::STACK_LIMIT);
        let overflow = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedLessThan, sp, limit);
        self.trap_if(overflow, TrapCode::CallStackExhausted);

        let depth = self.builder.ins().iadd_imm(depth, -1);
        self.store_vmctx(depth, offsets::CALL_DEPTH_REMAINING);
    }

    fn leave_call(&mut self) {
        let depth = self.load_vmctx(cl_types::I64, offsets::CALL_DEPTH_REMAINING);
        let depth = self.builder.ins().iadd_imm(depth, 1);
        self.store_vmctx(depth, offsets::CALL_DEPTH_REMAINING);
    }

    // === Control flow ===

    fn translate_instruction(&mut self, instr: &Instruction) -> CodegenResult<()> {
        if !self.reachable {
            return self.skip_unreachable(instr);
        }

        match instr {
            Instruction::Unreachable => self.trap(TrapCode::Unreachable),
            Instruction::Nop => {}
            Instruction::Block(ty) => self.enter_block(*ty)?,
            Instruction::Loop(ty) => self.enter_loop(*ty)?,
            Instruction::If(ty) => self.enter_if(*ty)?,
            Instruction::Else => self.translate_else()?,
            Instruction::End => self.translate_end()?,
            Instruction::Br(depth) => {
                self.branch(*depth)?;
                self.reachable = false;
            }
            Instruction::BrIf(depth) => {
                let cond = self.pop()?;
                let target = self.assign_branch_vars(*depth)?;
                let cont = self.builder.create_block();
                self.builder.ins().brif(cond, target, &[], cont, &[]);
                self.builder.switch_to_block(cont);
            }
            Instruction::BrTable { targets, default } => self.br_table(targets, *default)?,
            Instruction::Return => {
                self.branch(self.frames.len() as u32 - 1)?;
                self.reachable = false;
            }
            Instruction::Call(function_index) => self.call(*function_index)?,
            Instruction::CallIndirect {
                type_index,
                table_index,
            } => {
                if *table_index != 0 {
                    return Err(CodegenError::unsupported("call_indirect on a table other than 0"));
                }
                self.call_indirect(*type_index)?;
            }
            Instruction::Drop => {
                self.pop()?;
            }
            Instruction::Select => {
                let cond = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                let v = self.builder.ins().select(cond, a, b);
                self.push(v);
            }
            Instruction::LocalGet(index) => {
                let var = self.local(*index)?;
                let v = self.builder.use_var(var);
                self.push(v);
            }
            Instruction::LocalSet(index) => {
                let var = self.local(*index)?;
                let v = self.pop()?;
                self.builder.def_var(var, v);
            }
            Instruction::LocalTee(index) => {
                let var = self.local(*index)?;
                let v = *self
                    .stack
                    .last()
                    .ok_or_else(|| CodegenError::invalid_module("operand stack underflow"))?;
                self.builder.def_var(var, v);
            }
            Instruction::GlobalGet(index) => {
                let (ptr, offset, ty) = self.global_slot(*index)?;
                let v = self
                    .builder
                    .ins()
                    .load(translate_type(ty), vm_flags(), ptr, offset);
                self.push(v);
            }
            Instruction::GlobalSet(index) => {
                let (ptr, offset, _) = self.global_slot(*index)?;
                let v = self.pop()?;
                self.builder.ins().store(vm_flags(), v, ptr, offset);
            }
            Instruction::Load {
                ty,
                bytes,
                signed,
                memarg,
            } => self.load(*ty, *bytes, *signed, *memarg)?,
            Instruction::Store { bytes, memarg, .. } => self.store(*bytes, *memarg)?,
            Instruction::MemorySize => {
                let len = self.load_vmctx(cl_types::I64, offsets::MEMORY_LEN);
                let pages = self.builder.ins().ushr_imm(len, 16);
                let pages = self.builder.ins().ireduce(cl_types::I32, pages);
                self.push(pages);
            }
            Instruction::MemoryGrow => self.memory_grow()?,
            Instruction::I32Const(value) => {
                let v = self.int_const(cl_types::I32, i64::from(*value));
                self.push(v);
            }
            Instruction::I64Const(value) => {
                let v = self.int_const(cl_types::I64, *value);
                self.push(v);
            }
            Instruction::F32Const(bits) => {
                let v = self.builder.ins().f32const(Ieee32::with_bits(*bits));
                self.push(v);
            }
            Instruction::F64Const(bits) => {
                let v = self.builder.ins().f64const(Ieee64::with_bits(*bits));
                self.push(v);
            }
            Instruction::Int(width, op) => self.int_op(*width, *op)?,
            Instruction::Float(width, op) => self.float_op(*width, *op)?,
            Instruction::Convert(conversion) => self.convert(*conversion)?,
        }
        Ok(())
    }

    fn skip_unreachable(&mut self, instr: &Instruction) -> CodegenResult<()> {
        match instr {
            Instruction::Loop(_) => {
                // Keep loop charges aligned with their position in the body
                self.next_loop += 1;
                self.unreachable_depth += 1;
            }
            Instruction::Block(_) | Instruction::If(_) => self.unreachable_depth += 1,
            Instruction::Else if self.unreachable_depth == 0 => self.translate_else()?,
            Instruction::End if self.unreachable_depth > 0 => self.unreachable_depth -= 1,
            Instruction::End => self.translate_end()?,
            _ => {}
        }
        Ok(())
    }

    fn local(&self, index: u32) -> CodegenResult<Variable> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| CodegenError::invalid_module(format!("unknown local {index}")))
    }

    fn enter_block(&mut self, ty: BlockType) -> CodegenResult<()> {
        let (params, results) = self.env.block_signature(ty)?;
        let end = self.builder.create_block();
        let result_vars = self.new_vars(&results);
        let stack_height = self.stack_height_below(params.len())?;
        self.frames.push(Frame {
            kind: FrameKind::Block,
            branch_block: end,
            end_block: end,
            branch_vars: result_vars.clone(),
            result_vars,
            stack_height,
            end_reachable: false,
        });
        Ok(())
    }

    fn enter_loop(&mut self, ty: BlockType) -> CodegenResult<()> {
        let (params, results) = self.env.block_signature(ty)?;
        let header = self.builder.create_block();
        let end = self.builder.create_block();
        let param_vars = self.new_vars(&params);
        let result_vars = self.new_vars(&results);

        let args = self.pop_n(params.len())?;
        for (&var, &arg) in param_vars.iter().zip(&args) {
            self.builder.def_var(var, arg);
        }
        self.builder.ins().jump(header, &[]);
        self.builder.switch_to_block(header);
        let stack_height = self.stack.len();
        for &var in &param_vars {
            let v = self.builder.use_var(var);
            self.push(v);
        }

        let cost = self.loop_costs.get(self.next_loop).copied().unwrap_or(0);
        self.next_loop += 1;
        self.meter(cost);

        self.frames.push(Frame {
            kind: FrameKind::Loop,
            branch_block: header,
            end_block: end,
            branch_vars: param_vars,
            result_vars,
            stack_height,
            end_reachable: false,
        });
        Ok(())
    }

    fn enter_if(&mut self, ty: BlockType) -> CodegenResult<()> {
        let (params, results) = self.env.block_signature(ty)?;
        let cond = self.pop()?;
        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let end = self.builder.create_block();
        let result_vars = self.new_vars(&results);
        let stack_height = self.stack_height_below(params.len())?;
        let params = self.stack[stack_height..].to_vec();

        self.builder
            .ins()
            .brif(cond, then_block, &[], else_block, &[]);
        self.builder.switch_to_block(then_block);

        self.frames.push(Frame {
            kind: FrameKind::If {
                else_block,
                params,
                has_else: false,
            },
            branch_block: end,
            end_block: end,
            branch_vars: result_vars.clone(),
            result_vars,
            stack_height,
            end_reachable: false,
        });
        Ok(())
    }

    fn stack_height_below(&self, params: usize) -> CodegenResult<usize> {
        self.stack
            .len()
            .checked_sub(params)
            .ok_or_else(|| CodegenError::invalid_module("operand stack underflow"))
    }

    fn translate_else(&mut self) -> CodegenResult<()> {
        if self.reachable {
            self.fall_through_to_end()?;
        }
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| CodegenError::invalid_module("else without if"))?;
        let FrameKind::If {
            else_block,
            params,
            has_else,
        } = &mut frame.kind
        else {
            return Err(CodegenError::invalid_module("else without if"));
        };
        *has_else = true;
        let else_block = *else_block;
        let params = params.clone();
        let height = frame.stack_height;

        self.stack.truncate(height);
        self.stack.extend(params);
        self.builder.switch_to_block(else_block);
        self.reachable = true;
        Ok(())
    }

    /// Assign the innermost frame's results and jump to its end
    fn fall_through_to_end(&mut self) -> CodegenResult<()> {
        let (vars, end) = {
            let frame = self
                .frames
                .last()
                .ok_or_else(|| CodegenError::invalid_module("unbalanced end"))?;
            (frame.result_vars.clone(), frame.end_block)
        };
        let values = self.pop_n(vars.len())?;
        for (&var, &value) in vars.iter().zip(&values) {
            self.builder.def_var(var, value);
        }
        self.builder.ins().jump(end, &[]);
        if let Some(frame) = self.frames.last_mut() {
            frame.end_reachable = true;
        }
        Ok(())
    }

    fn translate_end(&mut self) -> CodegenResult<()> {
        if self.reachable {
            self.fall_through_to_end()?;
        }
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| CodegenError::invalid_module("unbalanced end"))?;

        // An `if` without `else` passes its parameters through unchanged
        if let FrameKind::If {
            else_block,
            params,
            has_else: false,
        } = &frame.kind
        {
            self.builder.switch_to_block(*else_block);
            for (&var, &value) in frame.result_vars.iter().zip(params) {
                self.builder.def_var(var, value);
            }
            self.builder.ins().jump(frame.end_block, &[]);
            frame.end_reachable = true;
        }

        self.stack.truncate(frame.stack_height);
        if !frame.end_reachable {
            self.reachable = false;
            return Ok(());
        }

        self.builder.switch_to_block(frame.end_block);
        let values: Vec<Value> = frame
            .result_vars
            .iter()
            .map(|&var| self.builder.use_var(var))
            .collect();

        if matches!(frame.kind, FrameKind::Function) {
            self.leave_call();
            self.builder.ins().return_(&values);
            self.reachable = false;
        } else {
            self.stack.extend(values);
            self.reachable = true;
        }
        Ok(())
    }

    /// Assign a branch's values to the target frame's variables and return
    /// the block to jump to.
    fn assign_branch_vars(&mut self, depth: u32) -> CodegenResult<Block> {
        let index = self.frame_index(depth)?;
        let vars = self.frames[index].branch_vars.clone();
        let values = self.peek_n(vars.len())?.to_vec();
        for (&var, &value) in vars.iter().zip(&values) {
            self.builder.def_var(var, value);
        }
        let frame = &mut self.frames[index];
        if !frame.is_loop() {
            frame.end_reachable = true;
        }
        Ok(frame.branch_block)
    }

    fn branch(&mut self, depth: u32) -> CodegenResult<()> {
        let target = self.assign_branch_vars(depth)?;
        self.builder.ins().jump(target, &[]);
        Ok(())
    }

    fn br_table(&mut self, targets: &[u32], default: u32) -> CodegenResult<()> {
        let index = self.pop()?;

        // One edge block per distinct depth assigns that frame's variables
        let mut edges: BTreeMap<u32, Block> = BTreeMap::new();
        for &depth in targets.iter().chain(std::iter::once(&default)) {
            if !edges.contains_key(&depth) {
                let block = self.builder.create_block();
                edges.insert(depth, block);
            }
        }

        let mut switch = Switch::new();
        for (i, depth) in targets.iter().enumerate() {
            switch.set_entry(i as u128, edges[depth]);
        }
        switch.emit(&mut self.builder, index, edges[&default]);

        for (depth, block) in edges {
            self.builder.switch_to_block(block);
            self.branch(depth)?;
        }
        self.reachable = false;
        Ok(())
    }

    // === Calls ===

    fn signature(&mut self, type_index: u32) -> CodegenResult<SigRef> {
        if let Some(&sig) = self.signatures.get(&type_index) {
            return Ok(sig);
        }
        let sig = wasm_signature(self.env.func_type(type_index)?);
        let sig = self.builder.import_signature(sig);
        self.signatures.insert(type_index, sig);
        Ok(sig)
    }

    /// Address of the dispatch entry of a function index held in `index`
    fn dispatch_entry(&mut self, index: Value) -> Value {
        let dispatch = self.load_vmctx(POINTER_TYPE, offsets::DISPATCH);
        let scaled = self.builder.ins().imul_imm(index, VM_FUNC_REF_SIZE);
        self.builder.ins().iadd(dispatch, scaled)
    }

    fn emit_call(&mut self, type_index: u32, code: Value) -> CodegenResult<()> {
        let param_count = self.env.func_type(type_index)?.params.len();
        let sig = self.signature(type_index)?;
        let mut args = vec![self.vmctx];
        args.extend(self.pop_n(param_count)?);
        let call = self.builder.ins().call_indirect(sig, code, &args);
        let results = self.builder.inst_results(call).to_vec();
        self.check_trap_code();
        self.stack.extend(results);
        Ok(())
    }

    fn call(&mut self, function_index: u32) -> CodegenResult<()> {
        let type_index = self
            .env
            .module
            .function_type_index(function_index)
            .ok_or_else(|| {
                CodegenError::invalid_module(format!("call to unknown function {function_index}"))
            })?;
        let dispatch = self.load_vmctx(POINTER_TYPE, offsets::DISPATCH);
        let entry = self
            .builder
            .ins()
            .iadd_imm(dispatch, i64::from(function_index) * VM_FUNC_REF_SIZE);
        let code = self
            .builder
            .ins()
            .load(POINTER_TYPE, vm_flags(), entry, offsets::FUNC_REF_CODE);
        self.emit_call(type_index, code)
    }

    fn call_indirect(&mut self, type_index: u32) -> CodegenResult<()> {
        let expected = *self.env.type_ids.get(type_index as usize).ok_or_else(|| {
            CodegenError::invalid_module(format!("unknown type {type_index}"))
        })?;
        let elem = self.pop()?;
        let elem = self.builder.ins().uextend(cl_types::I64, elem);

        let table_len = self.load_vmctx(cl_types::I64, offsets::TABLE_LEN);
        let oob = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, elem, table_len);
        self.trap_if(oob, TrapCode::TableOutOfBounds);

        let table = self.load_vmctx(POINTER_TYPE, offsets::TABLE_BASE);
        let slot = self.builder.ins().imul_imm(elem, 4);
        let slot = self.builder.ins().iadd(table, slot);
        let function_index = self
            .builder
            .ins()
            .load(cl_types::I32, vm_flags(), slot, 0);
        let null = self.int_const(cl_types::I32, i64::from(NULL_FUNC));
        let is_null = self
            .builder
            .ins()
            .icmp(IntCC::Equal, function_index, null);
        self.trap_if(is_null, TrapCode::IndirectCallToNull);

        let function_index = self.builder.ins().uextend(cl_types::I64, function_index);
        let entry = self.dispatch_entry(function_index);
        let type_id = self.builder.ins().load(
            cl_types::I32,
            vm_flags(),
            entry,
            offsets::FUNC_REF_TYPE_ID,
        );
        let expected = self.int_const(cl_types::I32, i64::from(expected));
        let mismatch = self.builder.ins().icmp(IntCC::NotEqual, type_id, expected);
        self.trap_if(mismatch, TrapCode::BadSignature);

        let code = self
            .builder
            .ins()
            .load(POINTER_TYPE, vm_flags(), entry, offsets::FUNC_REF_CODE);
        self.emit_call(type_index, code)
    }

    fn builtin(&mut self, offset: i32) -> Value {
        let builtins = self.load_vmctx(POINTER_TYPE, offsets::BUILTINS);
        self.builder
            .ins()
            .load(POINTER_TYPE, vm_flags(), builtins, offset)
    }

    fn memory_grow(&mut self) -> CodegenResult<()> {
        let delta = self.pop()?;
        let sig = match self.memory_grow_sig {
            Some(sig) => sig,
            None => {
                let sig = self
                    .builder
                    .import_signature(memory_grow_signature(self.env.builtin_call_conv));
                self.memory_grow_sig = Some(sig);
                sig
            }
        };
        let callee = self.builtin(offsets::BUILTIN_MEMORY_GROW);
        let call = self
            .builder
            .ins()
            .call_indirect(sig, callee, &[self.vmctx, delta]);
        let old_pages = self.builder.inst_results(call)[0];
        self.check_trap_code();
        self.push(old_pages);
        Ok(())
    }

    // === Memory and globals ===

    fn global_slot(&mut self, index: u32) -> CodegenResult<(Value, i32, ValType)> {
        let global = self.env.module.globals.get(index as usize).ok_or_else(|| {
            CodegenError::invalid_module(format!("unknown global {index}"))
        })?;
        let ty = global.ty;
        let offset = i32::try_from(u64::from(index) * 8)
            .map_err(|_| CodegenError::limit_exceeded("globals", u64::from(index)))?;
        let ptr = self.load_vmctx(POINTER_TYPE, offsets::GLOBALS);
        Ok((ptr, offset, ty))
    }

    /// Bounds-check an access of `bytes` bytes and return its native address
    fn heap_address(&mut self, memarg: MemArg, bytes: u8) -> CodegenResult<Value> {
        let addr = self.pop()?;
        let addr = self.builder.ins().uextend(cl_types::I64, addr);
        let end = memarg
            .offset
            .checked_add(u64::from(bytes))
            .and_then(|end| i64::try_from(end).ok())
            .ok_or_else(|| CodegenError::unsupported("memory offset beyond 64-bit range"))?;
        let end = self.builder.ins().iadd_imm(addr, end);
        let len = self.load_vmctx(cl_types::I64, offsets::MEMORY_LEN);
        let oob = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThan, end, len);
        self.trap_if(oob, TrapCode::HeapOutOfBounds);

        let base = self.load_vmctx(POINTER_TYPE, offsets::MEMORY_BASE);
        let ptr = self.builder.ins().iadd(base, addr);
        Ok(if memarg.offset == 0 {
            ptr
        } else {
            self.builder.ins().iadd_imm(ptr, memarg.offset as i64)
        })
    }

    fn load(&mut self, ty: ValType, bytes: u8, signed: bool, memarg: MemArg) -> CodegenResult<()> {
        let ptr = self.heap_address(memarg, bytes)?;
        let cl_ty = translate_type(ty);
        let flags = heap_flags();
        let ins = self.builder.ins();
        let v = match (bytes, signed) {
            (1, true) => ins.sload8(cl_ty, flags, ptr, 0),
            (1, false) => ins.uload8(cl_ty, flags, ptr, 0),
            (2, true) => ins.sload16(cl_ty, flags, ptr, 0),
            (2, false) => ins.uload16(cl_ty, flags, ptr, 0),
            (4, true) if ty == ValType::I64 => ins.sload32(flags, ptr, 0),
            (4, false) if ty == ValType::I64 => ins.uload32(flags, ptr, 0),
            (4, _) | (8, _) => ins.load(cl_ty, flags, ptr, 0),
            _ => return Err(CodegenError::invalid_module(format!("{bytes}-byte load"))),
        };
        self.push(v);
        Ok(())
    }

    fn store(&mut self, bytes: u8, memarg: MemArg) -> CodegenResult<()> {
        let value = self.pop()?;
        let ptr = self.heap_address(memarg, bytes)?;
        let flags = heap_flags();
        let value_bytes = self.builder.func.dfg.value_type(value).bytes();
        let ins = self.builder.ins();
        match bytes {
            1 => ins.istore8(flags, value, ptr, 0),
            2 => ins.istore16(flags, value, ptr, 0),
            4 if value_bytes == 8 => ins.istore32(flags, value, ptr, 0),
            4 | 8 => ins.store(flags, value, ptr, 0),
            _ => return Err(CodegenError::invalid_module(format!("{bytes}-byte store"))),
        };
        Ok(())
    }

    // === Numeric operators ===

    fn int_op(&mut self, width: IntWidth, op: IntOp) -> CodegenResult<()> {
        let ty = translate_type(width.val_type());
        match op {
            IntOp::Eqz => {
                let v = self.pop()?;
                let c = self.builder.ins().icmp_imm(IntCC::Equal, v, 0);
                let c = self.bool_to_i32(c);
                self.push(c);
            }
            IntOp::Eq => self.int_compare(IntCC::Equal)?,
            IntOp::Ne => self.int_compare(IntCC::NotEqual)?,
            IntOp::LtS => self.int_compare(IntCC::SignedLessThan)?,
            IntOp::LtU => self.int_compare(IntCC::UnsignedLessThan)?,
            IntOp::GtS => self.int_compare(IntCC::SignedGreaterThan)?,
            IntOp::GtU => self.int_compare(IntCC::UnsignedGreaterThan)?,
            IntOp::LeS => self.int_compare(IntCC::SignedLessThanOrEqual)?,
            IntOp::LeU => self.int_compare(IntCC::UnsignedLessThanOrEqual)?,
            IntOp::GeS => self.int_compare(IntCC::SignedGreaterThanOrEqual)?,
            IntOp::GeU => self.int_compare(IntCC::UnsignedGreaterThanOrEqual)?,
            IntOp::Clz => self.unary(|b, v| b.ins().clz(v))?,
            IntOp::Ctz => self.unary(|b, v| b.ins().ctz(v))?,
            IntOp::Popcnt => self.unary(|b, v| b.ins().popcnt(v))?,
            IntOp::Extend8S => self.sign_extend_low(ty, cl_types::I8)?,
            IntOp::Extend16S => self.sign_extend_low(ty, cl_types::I16)?,
            IntOp::Extend32S => self.sign_extend_low(ty, cl_types::I32)?,
            IntOp::Add => self.binary(|b, x, y| b.ins().iadd(x, y))?,
            IntOp::Sub => self.binary(|b, x, y| b.ins().isub(x, y))?,
            IntOp::Mul => self.binary(|b, x, y| b.ins().imul(x, y))?,
            IntOp::And => self.binary(|b, x, y| b.ins().band(x, y))?,
            IntOp::Or => self.binary(|b, x, y| b.ins().bor(x, y))?,
            IntOp::Xor => self.binary(|b, x, y| b.ins().bxor(x, y))?,
            IntOp::Shl => self.binary(|b, x, y| b.ins().ishl(x, y))?,
            IntOp::ShrS => self.binary(|b, x, y| b.ins().sshr(x, y))?,
            IntOp::ShrU => self.binary(|b, x, y| b.ins().ushr(x, y))?,
            IntOp::Rotl => self.binary(|b, x, y| b.ins().rotl(x, y))?,
            IntOp::Rotr => self.binary(|b, x, y| b.ins().rotr(x, y))?,
            IntOp::DivS | IntOp::DivU | IntOp::RemS | IntOp::RemU => self.division(ty, op)?,
        }
        Ok(())
    }

    fn unary(&mut self, f: impl FnOnce(&mut FunctionBuilder<'a>, Value) -> Value) -> CodegenResult<()> {
        let v = self.pop()?;
        let r = f(&mut self.builder, v);
        self.push(r);
        Ok(())
    }

    fn binary(
        &mut self,
        f: impl FnOnce(&mut FunctionBuilder<'a>, Value, Value) -> Value,
    ) -> CodegenResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let r = f(&mut self.builder, lhs, rhs);
        self.push(r);
        Ok(())
    }

    fn int_compare(&mut self, cc: IntCC) -> CodegenResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let c = self.builder.ins().icmp(cc, lhs, rhs);
        let c = self.bool_to_i32(c);
        self.push(c);
        Ok(())
    }

    fn float_compare(&mut self, cc: FloatCC) -> CodegenResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let c = self.builder.ins().fcmp(cc, lhs, rhs);
        let c = self.bool_to_i32(c);
        self.push(c);
        Ok(())
    }

    fn sign_extend_low(&mut self, ty: cl_types::Type, from: cl_types::Type) -> CodegenResult<()> {
        if from == ty {
            return Err(CodegenError::invalid_module("extend32_s on a 32-bit operand"));
        }
        let v = self.pop()?;
        let low = self.builder.ins().ireduce(from, v);
        let r = self.builder.ins().sextend(ty, low);
        self.push(r);
        Ok(())
    }

    fn division(&mut self, ty: cl_types::Type, op: IntOp) -> CodegenResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, rhs, 0);
        self.trap_if(is_zero, TrapCode::IntegerDivisionByZero);

        let minus_one = self.int_const(ty, -1);
        let r = match op {
            IntOp::DivU => self.builder.ins().udiv(lhs, rhs),
            IntOp::RemU => self.builder.ins().urem(lhs, rhs),
            IntOp::DivS => {
                let min = if ty == cl_types::I32 {
                    i64::from(i32::MIN)
                } else {
                    i64::MIN
                };
                let min = self.int_const(ty, min);
                let lhs_min = self.builder.ins().icmp(IntCC::Equal, lhs, min);
                let rhs_neg = self.builder.ins().icmp(IntCC::Equal, rhs, minus_one);
                let overflow = self.builder.ins().band(lhs_min, rhs_neg);
                self.trap_if(overflow, TrapCode::IntegerOverflow);
                self.builder.ins().sdiv(lhs, rhs)
            }
            _ => {
                // x rem -1 is always 0, and so is x rem 1
                let rhs_neg = self.builder.ins().icmp(IntCC::Equal, rhs, minus_one);
                let one = self.int_const(ty, 1);
                let divisor = self.builder.ins().select(rhs_neg, one, rhs);
                self.builder.ins().srem(lhs, divisor)
            }
        };
        self.push(r);
        Ok(())
    }

    fn float_op(&mut self, _width: FloatWidth, op: FloatOp) -> CodegenResult<()> {
        match op {
            FloatOp::Eq => self.float_compare(FloatCC::Equal)?,
            FloatOp::Ne => self.float_compare(FloatCC::NotEqual)?,
            FloatOp::Lt => self.float_compare(FloatCC::LessThan)?,
            FloatOp::Gt => self.float_compare(FloatCC::GreaterThan)?,
            FloatOp::Le => self.float_compare(FloatCC::LessThanOrEqual)?,
            FloatOp::Ge => self.float_compare(FloatCC::GreaterThanOrEqual)?,
            FloatOp::Abs => self.unary(|b, v| b.ins().fabs(v))?,
            FloatOp::Neg => self.unary(|b, v| b.ins().fneg(v))?,
            FloatOp::Ceil => self.unary(|b, v| b.ins().ceil(v))?,
            FloatOp::Floor => self.unary(|b, v| b.ins().floor(v))?,
            FloatOp::Trunc => self.unary(|b, v| b.ins().trunc(v))?,
            FloatOp::Nearest => self.unary(|b, v| b.ins().nearest(v))?,
            FloatOp::Sqrt => self.unary(|b, v| b.ins().sqrt(v))?,
            FloatOp::Add => self.binary(|b, x, y| b.ins().fadd(x, y))?,
            FloatOp::Sub => self.binary(|b, x, y| b.ins().fsub(x, y))?,
            FloatOp::Mul => self.binary(|b, x, y| b.ins().fmul(x, y))?,
            FloatOp::Div => self.binary(|b, x, y| b.ins().fdiv(x, y))?,
            FloatOp::Min => self.binary(|b, x, y| b.ins().fmin(x, y))?,
            FloatOp::Max => self.binary(|b, x, y| b.ins().fmax(x, y))?,
            FloatOp::Copysign => self.binary(|b, x, y| b.ins().fcopysign(x, y))?,
        }
        Ok(())
    }

    fn float_const(&mut self, width: FloatWidth, value: f64) -> Value {
        match width {
            FloatWidth::W32 => self.builder.ins().f32const(value as f32),
            FloatWidth::W64 => self.builder.ins().f64const(value),
        }
    }

    fn convert(&mut self, conversion: Conversion) -> CodegenResult<()> {
        match conversion {
            Conversion::I32WrapI64 => {
                self.unary(|b, v| b.ins().ireduce(cl_types::I32, v))?
            }
            Conversion::I64ExtendI32 { signed: true } => {
                self.unary(|b, v| b.ins().sextend(cl_types::I64, v))?
            }
            Conversion::I64ExtendI32 { signed: false } => {
                self.unary(|b, v| b.ins().uextend(cl_types::I64, v))?
            }
            Conversion::Trunc {
                from,
                to,
                signed,
                saturating,
            } => self.truncate(from, to, signed, saturating)?,
            Conversion::Convert { to, signed, .. } => {
                let float_ty = translate_type(to.val_type());
                if signed {
                    self.unary(|b, v| b.ins().fcvt_from_sint(float_ty, v))?
                } else {
                    self.unary(|b, v| b.ins().fcvt_from_uint(float_ty, v))?
                }
            }
            Conversion::F32DemoteF64 => {
                self.unary(|b, v| b.ins().fdemote(cl_types::F32, v))?
            }
            Conversion::F64PromoteF32 => {
                self.unary(|b, v| b.ins().fpromote(cl_types::F64, v))?
            }
            Conversion::Reinterpret(ty) => {
                let cl_ty = translate_type(ty);
                self.unary(|b, v| {
                    b.ins()
                        .bitcast(cl_ty, cranelift_codegen::ir::MemFlags::new(), v)
                })?
            }
        }
        Ok(())
    }

    fn truncate(
        &mut self,
        from: FloatWidth,
        to: IntWidth,
        signed: bool,
        saturating: bool,
    ) -> CodegenResult<()> {
        let int_ty = translate_type(to.val_type());
        let v = self.pop()?;

        if !saturating {
            let is_nan = self.builder.ins().fcmp(FloatCC::Unordered, v, v);
            self.trap_if(is_nan, TrapCode::BadConversionToInteger);

            // Exclusive bounds of the representable range, exact in `from`
            let (lo, hi) = match (from, to, signed) {
                (FloatWidth::W32, IntWidth::W32, true) => (-2147483904.0, 2147483648.0),
                (FloatWidth::W64, IntWidth::W32, true) => (-2147483649.0, 2147483648.0),
                (FloatWidth::W32, IntWidth::W64, true) => {
                    (-9223373136366403584.0, 9223372036854775808.0)
                }
                (FloatWidth::W64, IntWidth::W64, true) => {
                    (-9223372036854777856.0, 9223372036854775808.0)
                }
                (_, IntWidth::W32, false) => (-1.0, 4294967296.0),
                (_, IntWidth::W64, false) => (-1.0, 18446744073709551616.0),
            };
            let lo = self.float_const(from, lo);
            let hi = self.float_const(from, hi);
            let too_low = self
                .builder
                .ins()
                .fcmp(FloatCC::LessThanOrEqual, v, lo);
            let too_high = self
                .builder
                .ins()
                .fcmp(FloatCC::GreaterThanOrEqual, v, hi);
            let overflow = self.builder.ins().bor(too_low, too_high);
            self.trap_if(overflow, TrapCode::IntegerOverflow);
        }

        let r = if signed {
            self.builder.ins().fcvt_to_sint_sat(int_ty, v)
        } else {
            self.builder.ins().fcvt_to_uint_sat(int_ty, v)
        };
        self.push(r);
        Ok(())
    }
}
