//! Main compiler interface
//!
//! Compiles every function of a validated module with Cranelift, together
//! with one stub per import and one trampoline per defined function, and lays
//! the machine code out in a single relocation-free blob.

use std::collections::HashMap;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::{Function, UserFuncName};
use cranelift_codegen::isa::{self, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use sysvm_core::{FuncType, ValidatedModule, WASM_PAGE_SIZE};
use target_lexicon::{Architecture, Endianness, Triple};
use tracing::{debug, info};

use crate::artifact::{CompiledArtifact, DispatchEntry, DispatchTarget};
use crate::config::CodegenConfig;
use crate::errors::{CodegenError, CodegenErrorKind, CodegenResult};
use crate::meter::function_costs;
use crate::stubs::{FUNCTION_NAMESPACE, array_call_trampoline, import_stub};
use crate::translate::{FunctionTranslator, ModuleEnv};
use crate::types::wasm_signature;
use crate::vmctx::NULL_FUNC;

/// Minimum alignment of every function in the code blob
const FUNCTION_ALIGNMENT: usize = 16;

/// Code blob of the module being compiled
#[derive(Default)]
struct CodeSink {
    bytes: Vec<u8>,
    /// Largest native stack frame of any emitted function
    max_frame_size: u32,
}

/// Cranelift-based module compiler
pub struct ModuleCompiler {
    isa: OwnedTargetIsa,
    config: CodegenConfig,
    max_memory_pages: u32,
}

impl ModuleCompiler {
    /// Create a compiler for the host target.
    ///
    /// `max_memory_pages` is the engine-wide memory cap; modules whose initial
    /// memory exceeds it are rejected.
    pub fn new(config: CodegenConfig, max_memory_pages: u32) -> CodegenResult<Self> {
        Self::for_target(Triple::host(), config, max_memory_pages)
    }

    pub fn for_target(
        target: Triple,
        config: CodegenConfig,
        max_memory_pages: u32,
    ) -> CodegenResult<Self> {
        // Settings are fixed rather than detected so every node generates the
        // same code for the same target.
        let mut flag_builder = settings::builder();
        flag_builder.set("opt_level", "speed")?;
        flag_builder.set("enable_nan_canonicalization", "true")?;
        flag_builder.set("use_colocated_libcalls", "false")?;
        flag_builder.set("is_pic", "false")?;
        flag_builder.set("unwind_info", "false")?;
        // Large frames touch every page on the way down instead of skipping
        // over the guard page
        flag_builder.set("enable_probestack", "true")?;
        flag_builder.set("probestack_strategy", "inline")?;

        let mut isa_builder = isa::lookup(target.clone())?;
        if target.architecture == Architecture::X86_64 {
            // Rounding instructions otherwise lower to libcalls
            for feature in ["has_sse3", "has_ssse3", "has_sse41"] {
                isa_builder.enable(feature)?;
            }
        }
        let isa = isa_builder.finish(settings::Flags::new(flag_builder))?;

        if isa.pointer_bits() != 64 {
            return Err(CodegenError::target(format!(
                "{target} is not a 64-bit target"
            )));
        }
        if target.endianness() != Ok(Endianness::Little) {
            return Err(CodegenError::target(format!(
                "{target} is not a little-endian target"
            )));
        }

        Ok(ModuleCompiler {
            isa,
            config,
            max_memory_pages,
        })
    }

    pub fn config(&self) -> &CodegenConfig {
        &self.config
    }

    /// Compile a validated module into a native artifact
    pub fn compile(&self, module: &ValidatedModule) -> CodegenResult<CompiledArtifact> {
        self.check_limits(module)?;
        let type_ids = canonical_type_ids(&module.types);
        let table_init = self.table_image(module)?;
        self.check_data_segments(module)?;
        self.check_entry_points(module)?;

        let env = ModuleEnv {
            module,
            type_ids: &type_ids,
            builtin_call_conv: self.isa.default_call_conv(),
        };
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut ctx = Context::new();
        let mut sink = CodeSink::default();
        let num_imports = module.num_imported_functions();

        let mut function_offsets = Vec::with_capacity(module.functions.len());
        for (i, body) in module.functions.iter().enumerate() {
            let function_index = num_imports + i as u32;
            let ty = self.func_type(module, body.type_index)?;
            let locals = ty.params.len() + body.locals.len();
            if locals > self.config.limits.max_function_locals as usize {
                return Err(CodegenError::limit_exceeded(
                    "locals in one function",
                    u64::from(self.config.limits.max_function_locals),
                ));
            }

            let mut func = Function::with_name_signature(
                UserFuncName::user(FUNCTION_NAMESPACE, function_index),
                wasm_signature(ty),
            );
            let costs = function_costs(&body.body, &self.config.cost);
            FunctionTranslator::new(&env, FunctionBuilder::new(&mut func, &mut fb_ctx))
                .translate(body, &costs)?;
            let offset = self.emit(&mut ctx, func, &mut sink)?;
            debug!(
                function_index,
                offset,
                entry_cost = costs.entry,
                loops = costs.loops.len(),
                "compiled function"
            );
            function_offsets.push(offset);
        }

        let mut stub_offsets = Vec::with_capacity(module.imports.len());
        for (i, import) in module.imports.iter().enumerate() {
            let ty = self.func_type(module, import.type_index)?;
            let func = import_stub(&mut fb_ctx, i as u32, ty, env.builtin_call_conv);
            stub_offsets.push(self.emit(&mut ctx, func, &mut sink)?);
        }

        let mut trampoline_offsets = Vec::with_capacity(module.functions.len());
        for (i, body) in module.functions.iter().enumerate() {
            let ty = self.func_type(module, body.type_index)?;
            let func = array_call_trampoline(
                &mut fb_ctx,
                num_imports + i as u32,
                ty,
                self.isa.default_call_conv(),
            );
            trampoline_offsets.push(self.emit(&mut ctx, func, &mut sink)?);
        }

        let function_types: Vec<u32> = module
            .imports
            .iter()
            .map(|import| import.type_index)
            .chain(module.functions.iter().map(|body| body.type_index))
            .collect();
        let dispatch = function_types
            .iter()
            .enumerate()
            .map(|(index, &type_index)| {
                let target = match stub_offsets.get(index) {
                    Some(&stub_offset) => DispatchTarget::Host {
                        import: index as u32,
                        stub_offset,
                    },
                    None => DispatchTarget::Local {
                        offset: function_offsets[index - stub_offsets.len()],
                    },
                };
                DispatchEntry {
                    target,
                    type_id: type_ids[type_index as usize],
                }
            })
            .collect();

        info!(
            functions = module.functions.len(),
            imports = module.imports.len(),
            code_size = sink.bytes.len(),
            max_frame_size = sink.max_frame_size,
            "compiled module"
        );

        Ok(CompiledArtifact {
            code: sink.bytes,
            max_frame_size: sink.max_frame_size,
            function_offsets,
            trampoline_offsets,
            dispatch,
            types: module.types.clone(),
            function_types,
            imports: module.imports.clone(),
            exports: module.exports.clone(),
            start: module.start,
            memory: module.memory,
            table: module.table,
            table_init,
            globals: module.globals.clone(),
            data: module.data.clone(),
            memory_grow_page_cost: self.config.cost.memory_grow_page,
        })
    }

    fn func_type<'m>(&self, module: &'m ValidatedModule, index: u32) -> CodegenResult<&'m FuncType> {
        module
            .types
            .get(index as usize)
            .ok_or_else(|| CodegenError::invalid_module(format!("unknown type {index}")))
    }

    /// Compile `func` and append its machine code to `sink`, returning its offset
    fn emit(&self, ctx: &mut Context, func: Function, sink: &mut CodeSink) -> CodegenResult<u32> {
        ctx.clear();
        ctx.func = func;
        let compiled = ctx
            .compile(self.isa.as_ref(), &mut ControlPlane::default())
            .map_err(|e| CodegenError::from(e.inner))?;
        let reloc = compiled.buffer.relocs().first().map(|reloc| reloc.kind);
        sink.max_frame_size = sink.max_frame_size.max(compiled.frame_size);

        let code = &mut sink.bytes;
        let padding = code.len().next_multiple_of(FUNCTION_ALIGNMENT) - code.len();
        code.resize(code.len() + padding, 0);
        let offset = u32::try_from(code.len())
            .map_err(|_| CodegenError::limit_exceeded("bytes of code", u64::from(u32::MAX)))?;
        code.extend_from_slice(compiled.code_buffer());

        if let Some(kind) = reloc {
            return Err(
                CodegenErrorKind::Relocation(format!("{kind} in {}", ctx.func.name)).into(),
            );
        }
        Ok(offset)
    }

    fn check_limits(&self, module: &ValidatedModule) -> CodegenResult<()> {
        let limits = &self.config.limits;
        if module.num_functions() > limits.max_functions {
            return Err(CodegenError::limit_exceeded(
                "functions",
                u64::from(limits.max_functions),
            ));
        }
        if module
            .table
            .is_some_and(|table| table.initial > limits.max_table_elements)
        {
            return Err(CodegenError::limit_exceeded(
                "table elements",
                u64::from(limits.max_table_elements),
            ));
        }
        if module
            .memory
            .is_some_and(|memory| memory.initial > self.max_memory_pages)
        {
            return Err(CodegenError::limit_exceeded(
                "initial memory pages",
                u64::from(self.max_memory_pages),
            ));
        }
        Ok(())
    }

    /// Apply element segments to an empty table
    fn table_image(&self, module: &ValidatedModule) -> CodegenResult<Vec<u32>> {
        let size = module.table.map_or(0, |table| table.initial);
        let mut image = vec![NULL_FUNC; size as usize];
        for (i, segment) in module.elements.iter().enumerate() {
            let start = segment.offset as usize;
            let end = start + segment.functions.len();
            if end > image.len() {
                return Err(CodegenError::invalid_module(format!(
                    "element segment {i} does not fit the table"
                )));
            }
            for (slot, &function_index) in image[start..end].iter_mut().zip(&segment.functions) {
                if function_index >= module.num_functions() {
                    return Err(CodegenError::invalid_module(format!(
                        "element segment {i} refers to unknown function {function_index}"
                    )));
                }
                *slot = function_index;
            }
        }
        Ok(image)
    }

    fn check_data_segments(&self, module: &ValidatedModule) -> CodegenResult<()> {
        let size = module
            .memory
            .map_or(0, |memory| u64::from(memory.initial) * WASM_PAGE_SIZE);
        for (i, segment) in module.data.iter().enumerate() {
            let end = u64::from(segment.offset) + segment.bytes.len() as u64;
            if end > size {
                return Err(CodegenError::invalid_module(format!(
                    "data segment {i} does not fit the initial memory"
                )));
            }
        }
        Ok(())
    }

    fn check_entry_points(&self, module: &ValidatedModule) -> CodegenResult<()> {
        if let Some(start) = module.start {
            let ty = module.function_type(start).ok_or_else(|| {
                CodegenError::invalid_module(format!("unknown start function {start}"))
            })?;
            if !ty.params.is_empty() || !ty.results.is_empty() {
                return Err(CodegenError::invalid_module(
                    "start function must take and return nothing",
                ));
            }
        }
        for (name, &index) in &module.exports {
            if index >= module.num_functions() {
                return Err(CodegenError::invalid_module(format!(
                    "export {name:?} refers to unknown function {index}"
                )));
            }
        }
        Ok(())
    }
}

/// Map every type index to the first index with a structurally equal type
fn canonical_type_ids(types: &[FuncType]) -> Vec<u32> {
    let mut seen: HashMap<&FuncType, u32> = HashMap::new();
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| *seen.entry(ty).or_insert(i as u32))
        .collect()
}
