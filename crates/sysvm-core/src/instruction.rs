//! Instruction set of a validated function body
//!
//! Numeric operators are grouped by operand width so the code generator can
//! translate an operator family once for both widths.

use crate::types::ValType;

/// Result/parameter shape of a structured control instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    /// Index into the module's type section (multi-value blocks)
    Func(u32),
}

/// Immediate of a memory access
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemArg {
    pub offset: u64,
    pub align: u8,
}

/// Integer width of an `I32`/`I64` operator family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntWidth {
    W32,
    W64,
}

impl IntWidth {
    pub fn val_type(self) -> ValType {
        match self {
            IntWidth::W32 => ValType::I32,
            IntWidth::W64 => ValType::I64,
        }
    }
}

/// Float width of an `F32`/`F64` operator family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    W32,
    W64,
}

impl FloatWidth {
    pub fn val_type(self) -> ValType {
        match self {
            FloatWidth::W32 => ValType::F32,
            FloatWidth::W64 => ValType::F64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntOp {
    // Tests and comparisons
    Eqz,
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
    // Unary
    Clz,
    Ctz,
    Popcnt,
    Extend8S,
    Extend16S,
    /// Only valid for the 64-bit family
    Extend32S,
    // Binary
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Copysign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversion {
    I32WrapI64,
    I64ExtendI32 {
        signed: bool,
    },
    /// Float to integer truncation. Traps on NaN and overflow unless `saturating`.
    Trunc {
        from: FloatWidth,
        to: IntWidth,
        signed: bool,
        saturating: bool,
    },
    /// Integer to float conversion
    Convert {
        from: IntWidth,
        to: FloatWidth,
        signed: bool,
    },
    F32DemoteF64,
    F64PromoteF32,
    /// Bit-preserving reinterpretation into the given type
    Reinterpret(ValType),
}

/// A single instruction of a function body.
///
/// Structured control uses the flat WebAssembly encoding: `Block`, `Loop` and
/// `If` are matched by a later `End`, and `Else` separates the arms of an `If`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    Call(u32),
    CallIndirect { type_index: u32, table_index: u32 },
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    /// Load `bytes` bytes and extend (with `signed`) to `ty`
    Load {
        ty: ValType,
        bytes: u8,
        signed: bool,
        memarg: MemArg,
    },
    /// Store the low `bytes` bytes of a `ty` value
    Store {
        ty: ValType,
        bytes: u8,
        memarg: MemArg,
    },
    MemorySize,
    MemoryGrow,
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    Int(IntWidth, IntOp),
    Float(FloatWidth, FloatOp),
    Convert(Conversion),
}

impl Instruction {
    /// Whether this instruction opens a structured control frame
    pub fn opens_frame(&self) -> bool {
        matches!(
            self,
            Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_)
        )
    }
}
