//! Compiled artifact produced by the code generator

use std::collections::BTreeMap;

use sysvm_core::{
    DataSegment, FuncType, FunctionImport, GlobalDecl, MemoryLimits, TableLimits,
};

/// Compile-time resolution of one dispatch table slot.
///
/// Local functions resolve to an offset in the artifact's code; imports
/// resolve to the compiled stub that forwards into the host intrinsic bound
/// at instantiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchTarget {
    Local { offset: u32 },
    Host { import: u32, stub_offset: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchEntry {
    pub target: DispatchTarget,
    /// Canonical signature id
    pub type_id: u32,
}

impl DispatchEntry {
    pub fn code_offset(&self) -> u32 {
        match self.target {
            DispatchTarget::Local { offset } => offset,
            DispatchTarget::Host { stub_offset, .. } => stub_offset,
        }
    }
}

/// A module translated to native code.
///
/// Immutable once produced. All code is position independent: calls go through
/// the dispatch table in the VM context, so the code bytes can be mapped at any
/// address without patching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledArtifact {
    /// Machine code of every function, stub and trampoline
    pub code: Vec<u8>,
    /// Largest native stack frame of any compiled function, in bytes
    pub max_frame_size: u32,
    /// Entry offset of each defined function, by defined-function position
    pub function_offsets: Vec<u32>,
    /// Offset of the array-call trampoline of each defined function
    pub trampoline_offsets: Vec<u32>,
    /// One slot per function index, imports first.
    ///
    /// The dispatch table lives beside the code rather than at an offset inside
    /// it: each instance turns it into an array of code pointers and publishes
    /// that array through the VM context, so the code bytes stay free of
    /// absolute addresses.
    pub dispatch: Vec<DispatchEntry>,
    pub types: Vec<FuncType>,
    /// Type index of each function index
    pub function_types: Vec<u32>,
    pub imports: Vec<FunctionImport>,
    pub exports: BTreeMap<String, u32>,
    pub start: Option<u32>,
    pub memory: Option<MemoryLimits>,
    pub table: Option<TableLimits>,
    /// Initial table contents after applying element segments
    pub table_init: Vec<u32>,
    /// One 64-bit slot per global, in declaration order
    pub globals: Vec<GlobalDecl>,
    pub data: Vec<DataSegment>,
    /// Meter charge per page requested by `memory.grow`
    pub memory_grow_page_cost: u64,
}

impl CompiledArtifact {
    pub fn num_imported_functions(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Entry offset of any defined function by function index
    pub fn entry_offset(&self, function_index: u32) -> Option<u32> {
        function_index
            .checked_sub(self.num_imported_functions())
            .and_then(|idx| self.function_offsets.get(idx as usize).copied())
    }

    /// Trampoline offset of a defined function by function index
    pub fn trampoline_offset(&self, function_index: u32) -> Option<u32> {
        function_index
            .checked_sub(self.num_imported_functions())
            .and_then(|idx| self.trampoline_offsets.get(idx as usize).copied())
    }

    pub fn function_type(&self, function_index: u32) -> Option<&FuncType> {
        self.function_types
            .get(function_index as usize)
            .and_then(|&ty| self.types.get(ty as usize))
    }

    pub fn import_type(&self, import: u32) -> Option<&FuncType> {
        self.imports
            .get(import as usize)
            .and_then(|import| self.types.get(import.type_index as usize))
    }

    pub fn export(&self, name: &str) -> Option<u32> {
        self.exports.get(name).copied()
    }

    /// Approximate heap footprint, used for cache capacity accounting
    pub fn size_bytes(&self) -> usize {
        self.code.len()
            + self.dispatch.len() * size_of::<DispatchEntry>()
            + self.table_init.len() * size_of::<u32>()
            + self.data.iter().map(|seg| seg.bytes.len()).sum::<usize>()
            + self.globals.len() * size_of::<GlobalDecl>()
    }
}
