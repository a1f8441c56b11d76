//! Core module model shared by the sysvm compiler and runtime
//!
//! A [`ValidatedModule`] is the engine's input: a WebAssembly module already
//! checked by an upstream validator. It can be built directly or decoded from
//! a binary with [`ValidatedModule::from_wasm`].

pub mod decode;
pub mod errors;
pub mod instruction;
pub mod module;
pub mod types;

pub use decode::decode_module;
pub use errors::{DecodeError, DecodeResult};
pub use instruction::{
    BlockType, Conversion, FloatOp, FloatWidth, Instruction, IntOp, IntWidth, MemArg,
};
pub use module::{
    DataSegment, ElementSegment, FunctionBody, FunctionImport, GlobalDecl, MAX_WASM_PAGES,
    MemoryLimits, TableLimits, ValidatedModule, WASM_PAGE_SIZE,
};
pub use types::{FuncType, ValType, Value};
