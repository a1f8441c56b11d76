//! Validated module representation
//!
//! This is the structure the validator hands to the engine. The engine
//! trusts it to be well-formed: operand stacks balance, indices are in range,
//! and control instructions are properly nested.

use std::collections::BTreeMap;

use crate::instruction::Instruction;
use crate::types::{FuncType, ValType, Value};

/// WebAssembly page size in bytes
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Largest page count a 32-bit memory can address
pub const MAX_WASM_PAGES: u32 = 65_536;

/// An imported host function
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionImport {
    pub module: String,
    pub name: String,
    pub type_index: u32,
}

/// A function defined by the module
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionBody {
    pub type_index: u32,
    /// Declared locals, not including parameters
    pub locals: Vec<ValType>,
    /// Flat instruction sequence, terminated by the function's final `End`
    pub body: Vec<Instruction>,
}

/// Page limits of the (single) linear memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLimits {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// Size limits of the (single) funcref table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableLimits {
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalDecl {
    pub ty: ValType,
    pub mutable: bool,
    pub init: Value,
}

/// Active element segment placing function indices into the table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementSegment {
    pub offset: u32,
    pub functions: Vec<u32>,
}

/// Active data segment copied into linear memory at instantiation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// A module already verified for structural and type correctness.
///
/// Function indices follow the WebAssembly index space: imported functions
/// come first, then defined functions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatedModule {
    pub types: Vec<FuncType>,
    pub imports: Vec<FunctionImport>,
    pub functions: Vec<FunctionBody>,
    pub memory: Option<MemoryLimits>,
    pub table: Option<TableLimits>,
    pub globals: Vec<GlobalDecl>,
    pub exports: BTreeMap<String, u32>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
}

impl ValidatedModule {
    pub fn num_imported_functions(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Size of the whole function index space
    pub fn num_functions(&self) -> u32 {
        (self.imports.len() + self.functions.len()) as u32
    }

    pub fn is_imported(&self, function_index: u32) -> bool {
        function_index < self.num_imported_functions()
    }

    /// Type index of any function in the index space
    pub fn function_type_index(&self, function_index: u32) -> Option<u32> {
        let imported = self.num_imported_functions();
        if function_index < imported {
            self.imports
                .get(function_index as usize)
                .map(|import| import.type_index)
        } else {
            self.functions
                .get((function_index - imported) as usize)
                .map(|body| body.type_index)
        }
    }

    /// Signature of any function in the index space
    pub fn function_type(&self, function_index: u32) -> Option<&FuncType> {
        self.function_type_index(function_index)
            .and_then(|idx| self.types.get(idx as usize))
    }

    /// Body of a defined function, by index space position
    pub fn defined_function(&self, function_index: u32) -> Option<&FunctionBody> {
        function_index
            .checked_sub(self.num_imported_functions())
            .and_then(|idx| self.functions.get(idx as usize))
    }

    pub fn export(&self, name: &str) -> Option<u32> {
        self.exports.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_with_one_import() -> ValidatedModule {
        ValidatedModule {
            types: vec![
                FuncType::new([ValType::I32], []),
                FuncType::new([], [ValType::I64]),
            ],
            imports: vec![FunctionImport {
                module: "env".into(),
                name: "log".into(),
                type_index: 0,
            }],
            functions: vec![FunctionBody {
                type_index: 1,
                locals: vec![],
                body: vec![Instruction::I64Const(7), Instruction::End],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_modules_have_total_equality() {
        fn total_eq<T: Eq>(a: &T, b: &T) -> bool {
            a == b
        }
        let mut module = module_with_one_import();
        module.globals.push(GlobalDecl {
            ty: ValType::F64,
            mutable: false,
            init: Value::from_f64(f64::NAN),
        });
        assert!(total_eq(&module, &module.clone()));
    }

    #[test]
    fn test_index_space_puts_imports_first() {
        let module = module_with_one_import();
        assert_eq!(module.num_functions(), 2);
        assert!(module.is_imported(0));
        assert!(!module.is_imported(1));
        assert_eq!(module.function_type(0), Some(&module.types[0]));
        assert_eq!(module.function_type(1), Some(&module.types[1]));
        assert!(module.defined_function(0).is_none());
        assert_eq!(module.defined_function(1), Some(&module.functions[0]));
        assert!(module.function_type(2).is_none());
    }
}
