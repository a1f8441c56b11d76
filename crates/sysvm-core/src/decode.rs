//! Decoding adapter from WebAssembly binaries
//!
//! The validator upstream of the engine hands over binaries it has already
//! checked. This adapter only maps them into [`ValidatedModule`]; it does not
//! re-validate anything beyond what decoding itself requires.

use tracing::debug;
use wasmparser::{
    BlockType as WpBlockType, CompositeInnerType, ConstExpr, DataKind, ElementItems, ElementKind,
    Encoding, ExternalKind, FunctionBody as WpFunctionBody, Operator, Parser, Payload, TableInit,
    TypeRef, ValType as WpValType,
};

use crate::errors::{DecodeError, DecodeResult};
use crate::instruction::{
    BlockType, Conversion, FloatOp, FloatWidth, Instruction, IntOp, IntWidth, MemArg,
};
use crate::module::{
    DataSegment, ElementSegment, FunctionBody, FunctionImport, GlobalDecl, MemoryLimits,
    TableLimits, ValidatedModule,
};
use crate::types::{FuncType, ValType, Value};

/// Upper bound on declared locals per function accepted by the decoder
const MAX_DECODED_LOCALS: u64 = 50_000;

impl ValidatedModule {
    /// Decode an already validated WebAssembly binary.
    pub fn from_wasm(bytes: &[u8]) -> DecodeResult<Self> {
        decode_module(bytes)
    }
}

/// Decode an already validated WebAssembly binary.
pub fn decode_module(bytes: &[u8]) -> DecodeResult<ValidatedModule> {
    let mut module = ValidatedModule::default();
    let mut declared_types: Vec<u32> = Vec::new();

    for payload in Parser::new(0).parse_all(bytes) {
        match payload? {
            Payload::Version { encoding, .. } => {
                if encoding != Encoding::Module {
                    return Err(DecodeError::unsupported("component binaries"));
                }
            }
            Payload::TypeSection(reader) => {
                for rec_group in reader {
                    for sub_type in rec_group?.into_types() {
                        match &sub_type.composite_type.inner {
                            CompositeInnerType::Func(func) => {
                                let params = func
                                    .params()
                                    .iter()
                                    .map(|ty| val_type(*ty))
                                    .collect::<DecodeResult<Vec<_>>>()?;
                                let results = func
                                    .results()
                                    .iter()
                                    .map(|ty| val_type(*ty))
                                    .collect::<DecodeResult<Vec<_>>>()?;
                                module.types.push(FuncType { params, results });
                            }
                            _ => return Err(DecodeError::unsupported("non-function types")),
                        }
                    }
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import?;
                    match import.ty {
                        TypeRef::Func(type_index) => module.imports.push(FunctionImport {
                            module: import.module.to_string(),
                            name: import.name.to_string(),
                            type_index,
                        }),
                        _ => {
                            return Err(DecodeError::unsupported(format!(
                                "non-function import {}.{}",
                                import.module, import.name
                            )));
                        }
                    }
                }
            }
            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    declared_types.push(type_index?);
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table?;
                    if module.table.is_some() {
                        return Err(DecodeError::unsupported("multiple tables"));
                    }
                    if !table.ty.element_type.is_func_ref() {
                        return Err(DecodeError::unsupported("non-funcref table"));
                    }
                    if !matches!(table.init, TableInit::RefNull) {
                        return Err(DecodeError::unsupported("table initializer expression"));
                    }
                    module.table = Some(TableLimits {
                        initial: limit(table.ty.initial, "table size")?,
                        maximum: table
                            .ty
                            .maximum
                            .map(|max| limit(max, "table maximum"))
                            .transpose()?,
                    });
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory?;
                    if module.memory.is_some() {
                        return Err(DecodeError::unsupported("multiple memories"));
                    }
                    if memory.memory64 || memory.shared || memory.page_size_log2.is_some() {
                        return Err(DecodeError::unsupported(
                            "64-bit, shared or custom-page memory",
                        ));
                    }
                    module.memory = Some(MemoryLimits {
                        initial: limit(memory.initial, "memory size")?,
                        maximum: memory
                            .maximum
                            .map(|max| limit(max, "memory maximum"))
                            .transpose()?,
                    });
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global?;
                    module.globals.push(GlobalDecl {
                        ty: val_type(global.ty.content_type)?,
                        mutable: global.ty.mutable,
                        init: const_value(&global.init_expr)?,
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export?;
                    if export.kind == ExternalKind::Func {
                        module.exports.insert(export.name.to_string(), export.index);
                    }
                }
            }
            Payload::StartSection { func, .. } => module.start = Some(func),
            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element?;
                    let offset = match element.kind {
                        ElementKind::Active {
                            table_index,
                            offset_expr,
                        } => {
                            if table_index.unwrap_or(0) != 0 {
                                return Err(DecodeError::unsupported("multiple tables"));
                            }
                            const_offset(&offset_expr)?
                        }
                        // Declarative segments only forward-declare `ref.func` targets.
                        ElementKind::Declared => continue,
                        ElementKind::Passive => {
                            return Err(DecodeError::unsupported("passive element segments"));
                        }
                    };
                    let mut functions = Vec::new();
                    match element.items {
                        ElementItems::Functions(items) => {
                            for index in items {
                                functions.push(index?);
                            }
                        }
                        ElementItems::Expressions(_, items) => {
                            for expr in items {
                                functions.push(ref_func(&expr?)?);
                            }
                        }
                    }
                    module.elements.push(ElementSegment { offset, functions });
                }
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data?;
                    match data.kind {
                        DataKind::Active {
                            memory_index,
                            offset_expr,
                        } => {
                            if memory_index != 0 {
                                return Err(DecodeError::unsupported("multiple memories"));
                            }
                            module.data.push(DataSegment {
                                offset: const_offset(&offset_expr)?,
                                bytes: data.data.to_vec(),
                            });
                        }
                        DataKind::Passive => {
                            return Err(DecodeError::unsupported("passive data segments"));
                        }
                    }
                }
            }
            Payload::CodeSectionEntry(body) => {
                let index = module.functions.len();
                let type_index = declared_types.get(index).copied().ok_or_else(|| {
                    DecodeError::unsupported("code entry without a function declaration")
                })?;
                module.functions.push(decode_body(type_index, &body)?);
            }
            Payload::TagSection(_) => {
                return Err(DecodeError::unsupported("exception tags"));
            }
            _ => {}
        }
    }

    debug!(
        types = module.types.len(),
        imports = module.imports.len(),
        functions = module.functions.len(),
        "decoded module"
    );
    Ok(module)
}

fn limit(value: u64, what: &str) -> DecodeResult<u32> {
    u32::try_from(value).map_err(|_| DecodeError::unsupported(format!("{what} {value}")))
}

fn val_type(ty: WpValType) -> DecodeResult<ValType> {
    match ty {
        WpValType::I32 => Ok(ValType::I32),
        WpValType::I64 => Ok(ValType::I64),
        WpValType::F32 => Ok(ValType::F32),
        WpValType::F64 => Ok(ValType::F64),
        WpValType::V128 => Err(DecodeError::unsupported("v128 values")),
        WpValType::Ref(_) => Err(DecodeError::unsupported("reference values")),
    }
}

fn const_value(expr: &ConstExpr<'_>) -> DecodeResult<Value> {
    let mut reader = expr.get_operators_reader();
    match reader.read()? {
        Operator::I32Const { value } => Ok(Value::I32(value)),
        Operator::I64Const { value } => Ok(Value::I64(value)),
        Operator::F32Const { value } => Ok(Value::F32(value.bits())),
        Operator::F64Const { value } => Ok(Value::F64(value.bits())),
        other => Err(DecodeError::unsupported(format!(
            "constant expression {other:?}"
        ))),
    }
}

fn const_offset(expr: &ConstExpr<'_>) -> DecodeResult<u32> {
    match const_value(expr)? {
        Value::I32(offset) => Ok(offset as u32),
        _ => Err(DecodeError::unsupported("non-i32 segment offset")),
    }
}

fn ref_func(expr: &ConstExpr<'_>) -> DecodeResult<u32> {
    let mut reader = expr.get_operators_reader();
    match reader.read()? {
        Operator::RefFunc { function_index } => Ok(function_index),
        other => Err(DecodeError::unsupported(format!(
            "element expression {other:?}"
        ))),
    }
}

fn decode_body(type_index: u32, body: &WpFunctionBody<'_>) -> DecodeResult<FunctionBody> {
    let mut locals = Vec::new();
    let mut declared: u64 = 0;
    let mut locals_reader = body.get_locals_reader()?;
    for _ in 0..locals_reader.get_count() {
        let (count, ty) = locals_reader.read()?;
        declared += u64::from(count);
        if declared > MAX_DECODED_LOCALS {
            return Err(DecodeError::unsupported(format!(
                "more than {MAX_DECODED_LOCALS} locals in one function"
            )));
        }
        let ty = val_type(ty)?;
        locals.extend(std::iter::repeat_n(ty, count as usize));
    }

    let mut instructions = Vec::new();
    let mut reader = body.get_operators_reader()?;
    while !reader.eof() {
        instructions.push(instruction(reader.read()?)?);
    }

    Ok(FunctionBody {
        type_index,
        locals,
        body: instructions,
    })
}

fn block_type(ty: WpBlockType) -> DecodeResult<BlockType> {
    Ok(match ty {
        WpBlockType::Empty => BlockType::Empty,
        WpBlockType::Type(ty) => BlockType::Value(val_type(ty)?),
        WpBlockType::FuncType(index) => BlockType::Func(index),
    })
}

fn memarg(arg: wasmparser::MemArg) -> DecodeResult<MemArg> {
    if arg.memory != 0 {
        return Err(DecodeError::unsupported("multiple memories"));
    }
    Ok(MemArg {
        offset: arg.offset,
        align: arg.align,
    })
}

fn load(ty: ValType, bytes: u8, signed: bool, arg: wasmparser::MemArg) -> DecodeResult<Instruction> {
    Ok(Instruction::Load {
        ty,
        bytes,
        signed,
        memarg: memarg(arg)?,
    })
}

fn store(ty: ValType, bytes: u8, arg: wasmparser::MemArg) -> DecodeResult<Instruction> {
    Ok(Instruction::Store {
        ty,
        bytes,
        memarg: memarg(arg)?,
    })
}

fn trunc(from: FloatWidth, to: IntWidth, signed: bool, saturating: bool) -> Instruction {
    Instruction::Convert(Conversion::Trunc {
        from,
        to,
        signed,
        saturating,
    })
}

fn convert(from: IntWidth, to: FloatWidth, signed: bool) -> Instruction {
    Instruction::Convert(Conversion::Convert { from, to, signed })
}

fn instruction(op: Operator<'_>) -> DecodeResult<Instruction> {
    use FloatWidth::{W32 as F32, W64 as F64};
    use Instruction as I;
    use IntWidth::{W32, W64};

    let i32op = |op| I::Int(W32, op);
    let i64op = |op| I::Int(W64, op);
    let f32op = |op| I::Float(F32, op);
    let f64op = |op| I::Float(F64, op);

    Ok(match op {
        Operator::Unreachable => I::Unreachable,
        Operator::Nop => I::Nop,
        Operator::Block { blockty } => I::Block(block_type(blockty)?),
        Operator::Loop { blockty } => I::Loop(block_type(blockty)?),
        Operator::If { blockty } => I::If(block_type(blockty)?),
        Operator::Else => I::Else,
        Operator::End => I::End,
        Operator::Br { relative_depth } => I::Br(relative_depth),
        Operator::BrIf { relative_depth } => I::BrIf(relative_depth),
        Operator::BrTable { targets } => I::BrTable {
            default: targets.default(),
            targets: targets.targets().collect::<Result<Vec<_>, _>>()?,
        },
        Operator::Return => I::Return,
        Operator::Call { function_index } => I::Call(function_index),
        Operator::CallIndirect {
            type_index,
            table_index,
        } => I::CallIndirect {
            type_index,
            table_index,
        },
        Operator::Drop => I::Drop,
        Operator::Select | Operator::TypedSelect { .. } => I::Select,
        Operator::LocalGet { local_index } => I::LocalGet(local_index),
        Operator::LocalSet { local_index } => I::LocalSet(local_index),
        Operator::LocalTee { local_index } => I::LocalTee(local_index),
        Operator::GlobalGet { global_index } => I::GlobalGet(global_index),
        Operator::GlobalSet { global_index } => I::GlobalSet(global_index),

        Operator::I32Load { memarg } => load(ValType::I32, 4, false, memarg)?,
        Operator::I64Load { memarg } => load(ValType::I64, 8, false, memarg)?,
        Operator::F32Load { memarg } => load(ValType::F32, 4, false, memarg)?,
        Operator::F64Load { memarg } => load(ValType::F64, 8, false, memarg)?,
        Operator::I32Load8S { memarg } => load(ValType::I32, 1, true, memarg)?,
        Operator::I32Load8U { memarg } => load(ValType::I32, 1, false, memarg)?,
        Operator::I32Load16S { memarg } => load(ValType::I32, 2, true, memarg)?,
        Operator::I32Load16U { memarg } => load(ValType::I32, 2, false, memarg)?,
        Operator::I64Load8S { memarg } => load(ValType::I64, 1, true, memarg)?,
        Operator::I64Load8U { memarg } => load(ValType::I64, 1, false, memarg)?,
        Operator::I64Load16S { memarg } => load(ValType::I64, 2, true, memarg)?,
        Operator::I64Load16U { memarg } => load(ValType::I64, 2, false, memarg)?,
        Operator::I64Load32S { memarg } => load(ValType::I64, 4, true, memarg)?,
        Operator::I64Load32U { memarg } => load(ValType::I64, 4, false, memarg)?,
        Operator::I32Store { memarg } => store(ValType::I32, 4, memarg)?,
        Operator::I64Store { memarg } => store(ValType::I64, 8, memarg)?,
        Operator::F32Store { memarg } => store(ValType::F32, 4, memarg)?,
        Operator::F64Store { memarg } => store(ValType::F64, 8, memarg)?,
        Operator::I32Store8 { memarg } => store(ValType::I32, 1, memarg)?,
        Operator::I32Store16 { memarg } => store(ValType::I32, 2, memarg)?,
        Operator::I64Store8 { memarg } => store(ValType::I64, 1, memarg)?,
        Operator::I64Store16 { memarg } => store(ValType::I64, 2, memarg)?,
        Operator::I64Store32 { memarg } => store(ValType::I64, 4, memarg)?,
        Operator::MemorySize { mem } | Operator::MemoryGrow { mem } if mem != 0 => {
            return Err(DecodeError::unsupported("multiple memories"));
        }
        Operator::MemorySize { .. } => I::MemorySize,
        Operator::MemoryGrow { .. } => I::MemoryGrow,

        Operator::I32Const { value } => I::I32Const(value),
        Operator::I64Const { value } => I::I64Const(value),
        Operator::F32Const { value } => I::F32Const(value.bits()),
        Operator::F64Const { value } => I::F64Const(value.bits()),

        Operator::I32Eqz => i32op(IntOp::Eqz),
        Operator::I32Eq => i32op(IntOp::Eq),
        Operator::I32Ne => i32op(IntOp::Ne),
        Operator::I32LtS => i32op(IntOp::LtS),
        Operator::I32LtU => i32op(IntOp::LtU),
        Operator::I32GtS => i32op(IntOp::GtS),
        Operator::I32GtU => i32op(IntOp::GtU),
        Operator::I32LeS => i32op(IntOp::LeS),
        Operator::I32LeU => i32op(IntOp::LeU),
        Operator::I32GeS => i32op(IntOp::GeS),
        Operator::I32GeU => i32op(IntOp::GeU),
        Operator::I64Eqz => i64op(IntOp::Eqz),
        Operator::I64Eq => i64op(IntOp::Eq),
        Operator::I64Ne => i64op(IntOp::Ne),
        Operator::I64LtS => i64op(IntOp::LtS),
        Operator::I64LtU => i64op(IntOp::LtU),
        Operator::I64GtS => i64op(IntOp::GtS),
        Operator::I64GtU => i64op(IntOp::GtU),
        Operator::I64LeS => i64op(IntOp::LeS),
        Operator::I64LeU => i64op(IntOp::LeU),
        Operator::I64GeS => i64op(IntOp::GeS),
        Operator::I64GeU => i64op(IntOp::GeU),

        Operator::F32Eq => f32op(FloatOp::Eq),
        Operator::F32Ne => f32op(FloatOp::Ne),
        Operator::F32Lt => f32op(FloatOp::Lt),
        Operator::F32Gt => f32op(FloatOp::Gt),
        Operator::F32Le => f32op(FloatOp::Le),
        Operator::F32Ge => f32op(FloatOp::Ge),
        Operator::F64Eq => f64op(FloatOp::Eq),
        Operator::F64Ne => f64op(FloatOp::Ne),
        Operator::F64Lt => f64op(FloatOp::Lt),
        Operator::F64Gt => f64op(FloatOp::Gt),
        Operator::F64Le => f64op(FloatOp::Le),
        Operator::F64Ge => f64op(FloatOp::Ge),

        Operator::I32Clz => i32op(IntOp::Clz),
        Operator::I32Ctz => i32op(IntOp::Ctz),
        Operator::I32Popcnt => i32op(IntOp::Popcnt),
        Operator::I32Add => i32op(IntOp::Add),
        Operator::I32Sub => i32op(IntOp::Sub),
        Operator::I32Mul => i32op(IntOp::Mul),
        Operator::I32DivS => i32op(IntOp::DivS),
        Operator::I32DivU => i32op(IntOp::DivU),
        Operator::I32RemS => i32op(IntOp::RemS),
        Operator::I32RemU => i32op(IntOp::RemU),
        Operator::I32And => i32op(IntOp::And),
        Operator::I32Or => i32op(IntOp::Or),
        Operator::I32Xor => i32op(IntOp::Xor),
        Operator::I32Shl => i32op(IntOp::Shl),
        Operator::I32ShrS => i32op(IntOp::ShrS),
        Operator::I32ShrU => i32op(IntOp::ShrU),
        Operator::I32Rotl => i32op(IntOp::Rotl),
        Operator::I32Rotr => i32op(IntOp::Rotr),
        Operator::I64Clz => i64op(IntOp::Clz),
        Operator::I64Ctz => i64op(IntOp::Ctz),
        Operator::I64Popcnt => i64op(IntOp::Popcnt),
        Operator::I64Add => i64op(IntOp::Add),
        Operator::I64Sub => i64op(IntOp::Sub),
        Operator::I64Mul => i64op(IntOp::Mul),
        Operator::I64DivS => i64op(IntOp::DivS),
        Operator::I64DivU => i64op(IntOp::DivU),
        Operator::I64RemS => i64op(IntOp::RemS),
        Operator::I64RemU => i64op(IntOp::RemU),
        Operator::I64And => i64op(IntOp::And),
        Operator::I64Or => i64op(IntOp::Or),
        Operator::I64Xor => i64op(IntOp::Xor),
        Operator::I64Shl => i64op(IntOp::Shl),
        Operator::I64ShrS => i64op(IntOp::ShrS),
        Operator::I64ShrU => i64op(IntOp::ShrU),
        Operator::I64Rotl => i64op(IntOp::Rotl),
        Operator::I64Rotr => i64op(IntOp::Rotr),
        Operator::I32Extend8S => i32op(IntOp::Extend8S),
        Operator::I32Extend16S => i32op(IntOp::Extend16S),
        Operator::I64Extend8S => i64op(IntOp::Extend8S),
        Operator::I64Extend16S => i64op(IntOp::Extend16S),
        Operator::I64Extend32S => i64op(IntOp::Extend32S),

        Operator::F32Abs => f32op(FloatOp::Abs),
        Operator::F32Neg => f32op(FloatOp::Neg),
        Operator::F32Ceil => f32op(FloatOp::Ceil),
        Operator::F32Floor => f32op(FloatOp::Floor),
        Operator::F32Trunc => f32op(FloatOp::Trunc),
        Operator::F32Nearest => f32op(FloatOp::Nearest),
        Operator::F32Sqrt => f32op(FloatOp::Sqrt),
        Operator::F32Add => f32op(FloatOp::Add),
        Operator::F32Sub => f32op(FloatOp::Sub),
        Operator::F32Mul => f32op(FloatOp::Mul),
        Operator::F32Div => f32op(FloatOp::Div),
        Operator::F32Min => f32op(FloatOp::Min),
        Operator::F32Max => f32op(FloatOp::Max),
        Operator::F32Copysign => f32op(FloatOp::Copysign),
        Operator::F64Abs => f64op(FloatOp::Abs),
        Operator::F64Neg => f64op(FloatOp::Neg),
        Operator::F64Ceil => f64op(FloatOp::Ceil),
        Operator::F64Floor => f64op(FloatOp::Floor),
        Operator::F64Trunc => f64op(FloatOp::Trunc),
        Operator::F64Nearest => f64op(FloatOp::Nearest),
        Operator::F64Sqrt => f64op(FloatOp::Sqrt),
        Operator::F64Add => f64op(FloatOp::Add),
        Operator::F64Sub => f64op(FloatOp::Sub),
        Operator::F64Mul => f64op(FloatOp::Mul),
        Operator::F64Div => f64op(FloatOp::Div),
        Operator::F64Min => f64op(FloatOp::Min),
        Operator::F64Max => f64op(FloatOp::Max),
        Operator::F64Copysign => f64op(FloatOp::Copysign),

        Operator::I32WrapI64 => I::Convert(Conversion::I32WrapI64),
        Operator::I64ExtendI32S => I::Convert(Conversion::I64ExtendI32 { signed: true }),
        Operator::I64ExtendI32U => I::Convert(Conversion::I64ExtendI32 { signed: false }),
        Operator::I32TruncF32S => trunc(F32, W32, true, false),
        Operator::I32TruncF32U => trunc(F32, W32, false, false),
        Operator::I32TruncF64S => trunc(F64, W32, true, false),
        Operator::I32TruncF64U => trunc(F64, W32, false, false),
        Operator::I64TruncF32S => trunc(F32, W64, true, false),
        Operator::I64TruncF32U => trunc(F32, W64, false, false),
        Operator::I64TruncF64S => trunc(F64, W64, true, false),
        Operator::I64TruncF64U => trunc(F64, W64, false, false),
        Operator::I32TruncSatF32S => trunc(F32, W32, true, true),
        Operator::I32TruncSatF32U => trunc(F32, W32, false, true),
        Operator::I32TruncSatF64S => trunc(F64, W32, true, true),
        Operator::I32TruncSatF64U => trunc(F64, W32, false, true),
        Operator::I64TruncSatF32S => trunc(F32, W64, true, true),
        Operator::I64TruncSatF32U => trunc(F32, W64, false, true),
        Operator::I64TruncSatF64S => trunc(F64, W64, true, true),
        Operator::I64TruncSatF64U => trunc(F64, W64, false, true),
        Operator::F32ConvertI32S => convert(W32, F32, true),
        Operator::F32ConvertI32U => convert(W32, F32, false),
        Operator::F32ConvertI64S => convert(W64, F32, true),
        Operator::F32ConvertI64U => convert(W64, F32, false),
        Operator::F64ConvertI32S => convert(W32, F64, true),
        Operator::F64ConvertI32U => convert(W32, F64, false),
        Operator::F64ConvertI64S => convert(W64, F64, true),
        Operator::F64ConvertI64U => convert(W64, F64, false),
        Operator::F32DemoteF64 => I::Convert(Conversion::F32DemoteF64),
        Operator::F64PromoteF32 => I::Convert(Conversion::F64PromoteF32),
        Operator::I32ReinterpretF32 => I::Convert(Conversion::Reinterpret(ValType::I32)),
        Operator::I64ReinterpretF64 => I::Convert(Conversion::Reinterpret(ValType::I64)),
        Operator::F32ReinterpretI32 => I::Convert(Conversion::Reinterpret(ValType::F32)),
        Operator::F64ReinterpretI64 => I::Convert(Conversion::Reinterpret(ValType::F64)),

        other => {
            return Err(DecodeError::unsupported(format!("operator {other:?}")));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> DecodeResult<ValidatedModule> {
        let bytes = wat::parse_str(text).expect("valid wat");
        decode_module(&bytes)
    }

    #[test]
    fn test_decode_sections() {
        let module = decode(
            r#"
            (module
              (import "env" "printi" (func $printi (param i64)))
              (memory 1 4)
              (table 2 funcref)
              (global $counter (mut i32) (i32.const 5))
              (func $answer (result i32) i32.const 42)
              (func (export "run") (param i64)
                local.get 0
                call $printi)
              (elem (i32.const 1) $answer)
              (data (i32.const 16) "hi")
              (export "answer" (func $answer)))
            "#,
        )
        .unwrap();

        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.imports[0].module, "env");
        assert_eq!(module.imports[0].name, "printi");
        assert_eq!(module.functions.len(), 2);
        assert_eq!(
            module.memory,
            Some(MemoryLimits {
                initial: 1,
                maximum: Some(4)
            })
        );
        assert_eq!(module.table.map(|t| t.initial), Some(2));
        assert_eq!(module.globals[0].init, Value::I32(5));
        assert!(module.globals[0].mutable);
        assert_eq!(module.export("answer"), Some(1));
        assert_eq!(module.export("run"), Some(2));
        assert_eq!(
            module.elements,
            vec![ElementSegment {
                offset: 1,
                functions: vec![1]
            }]
        );
        assert_eq!(module.data[0].offset, 16);
        assert_eq!(module.data[0].bytes, b"hi");
        assert_eq!(
            module.functions[0].body,
            vec![Instruction::I32Const(42), Instruction::End]
        );
    }

    #[test]
    fn test_decode_locals_and_memory_ops() {
        let module = decode(
            r#"
            (module
              (memory 1)
              (func (param i32) (local i64 i64 f32)
                local.get 0
                i64.load16_s offset=8
                drop))
            "#,
        )
        .unwrap();
        let body = &module.functions[0];
        assert_eq!(body.locals, vec![ValType::I64, ValType::I64, ValType::F32]);
        assert_eq!(
            body.body[1],
            Instruction::Load {
                ty: ValType::I64,
                bytes: 2,
                signed: true,
                memarg: MemArg {
                    offset: 8,
                    align: 1
                },
            }
        );
    }

    #[test]
    fn test_imported_memory_is_unsupported() {
        let err = decode(r#"(module (import "env" "memory" (memory 1)))"#).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"unsupported module feature: non-function import env.memory");
    }
}
