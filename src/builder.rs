//! JIT compilation of instruction batches using Cranelift.
//!
//! Every generated routine shares one argument tuple:
//! `(t, y, params, general_helper, aux, out)` where all but `t` are
//! pointers to f64 arrays. A routine consists of one or more chunks; each
//! chunk is compiled as its own function in a single JIT module and the
//! chunks are called in order. The module stays alive inside
//! [`CompiledRoutine`] so the function pointers remain valid, and its
//! memory is released when the routine is dropped.

use std::cell::RefCell;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::{ir::immediates::Offset32, Context};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;
use log::debug;

use crate::emit::{Instr, Target};
use crate::errors::BuilderError;
use crate::expr::EmitCtx;
use crate::types::ChunkFn;

extern "C" fn jit_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn jit_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn jit_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn jit_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn jit_cos(x: f64) -> f64 {
    x.cos()
}

/// Creates an ISA target for the host machine.
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    let target_triple = target_lexicon::Triple::host();
    let is_x86 = matches!(
        target_triple.architecture,
        target_lexicon::Architecture::X86_64
    );

    if is_x86 {
        flag_builder.set("use_colocated_libcalls", "true").unwrap();
    } else {
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
    }
    // cranelift-jit rejects position independent code
    flag_builder.set("is_pic", "false").unwrap();
    flag_builder.set("opt_level", "speed").unwrap();

    #[cfg(debug_assertions)]
    flag_builder.set("enable_verifier", "true").unwrap();
    #[cfg(not(debug_assertions))]
    flag_builder.set("enable_verifier", "false").unwrap();

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a JIT module with the external math functions registered.
pub(crate) fn create_module(isa: Arc<dyn TargetIsa>) -> JITModule {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    builder.symbol("exp", jit_exp as *const u8);
    builder.symbol("ln", jit_ln as *const u8);
    builder.symbol("pow", jit_pow as *const u8);
    builder.symbol("sin", jit_sin as *const u8);
    builder.symbol("cos", jit_cos as *const u8);

    JITModule::new(builder)
}

/// A batch of instructions compiled to native code.
///
/// Owns the JIT module whose memory backs the chunk function pointers, and
/// the per-routine CSE scratch array.
pub(crate) struct CompiledRoutine {
    module: Option<JITModule>,
    chunks: Vec<ChunkFn>,
    aux: RefCell<Vec<f64>>,
}

impl CompiledRoutine {
    /// Runs all chunks in order over the given arrays.
    ///
    /// `gh` is written by helper routines and read by the others; `out`
    /// receives derivative components or flattened Jacobian entries.
    pub fn call(&self, t: f64, y: &[f64], p: &[f64], gh: &mut [f64], out: &mut [f64]) {
        let mut aux = self.aux.borrow_mut();
        for chunk in &self.chunks {
            // SAFETY: the chunks were compiled against this exact argument
            // tuple and only access indices validated at generation time;
            // the module owning the code is kept alive by `self`.
            unsafe {
                chunk(
                    t,
                    y.as_ptr(),
                    p.as_ptr(),
                    gh.as_mut_ptr(),
                    aux.as_mut_ptr(),
                    out.as_mut_ptr(),
                );
            }
        }
    }
}

impl Drop for CompiledRoutine {
    fn drop(&mut self) {
        self.chunks.clear();
        if let Some(module) = self.module.take() {
            // SAFETY: all function pointers into the module were dropped
            // above and cannot outlive `self`.
            unsafe { module.free_memory() };
        }
    }
}

/// Compiles a chunked instruction batch into a [`CompiledRoutine`].
///
/// Each chunk becomes one exported function; the value cache of leaf loads
/// does not survive chunk boundaries.
pub(crate) fn compile_batch(
    name: &str,
    chunks: &[Vec<Instr>],
    n_aux: usize,
) -> Result<CompiledRoutine, BuilderError> {
    let isa = create_isa()?;
    let mut module = create_module(isa);
    let mut ctx = module.make_context();
    let mut builder_context = FunctionBuilderContext::new();

    let ptr_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::F64)); // t
    for _ in 0..5 {
        sig.params.push(AbiParam::new(ptr_type)); // y, p, gh, aux, out
    }

    let mut func_ids = Vec::with_capacity(chunks.len());
    for (chunk_index, chunk) in chunks.iter().enumerate() {
        ctx.func.signature = sig.clone();
        build_chunk_body(&mut ctx, &mut builder_context, &mut module, chunk)?;

        let func_id = module
            .declare_function(&format!("{name}_{chunk_index}"), Linkage::Export, &sig)
            .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
        module
            .define_function(func_id, &mut ctx)
            .map_err(|e| BuilderError::FunctionError(e.to_string()))?;
        module.clear_context(&mut ctx);
        func_ids.push(func_id);
    }

    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;

    let compiled = func_ids
        .into_iter()
        .map(|id| {
            let ptr = module.get_finalized_function(id);
            // SAFETY: every chunk was compiled with exactly this signature
            // and the module is stored alongside the pointers.
            unsafe { std::mem::transmute::<*const u8, ChunkFn>(ptr) }
        })
        .collect();

    debug!(
        "compiled routine {name:?}: {} chunk(s), {n_aux} cse slot(s)",
        chunks.len()
    );

    Ok(CompiledRoutine {
        module: Some(module),
        chunks: compiled,
        aux: RefCell::new(vec![0.0; n_aux]),
    })
}

/// Emits the body of a single chunk: evaluate each instruction's expression
/// and store it to the slot its target names.
fn build_chunk_body(
    ctx: &mut Context,
    builder_context: &mut FunctionBuilderContext,
    module: &mut JITModule,
    chunk: &[Instr],
) -> Result<(), BuilderError> {
    let mut builder = FunctionBuilder::new(&mut ctx.func, builder_context);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let params: Vec<Value> = builder.block_params(entry_block).to_vec();
    let mut emit_ctx = EmitCtx {
        t: params[0],
        y: params[1],
        p: params[2],
        gh: params[3],
        aux: params[4],
        cache: Default::default(),
    };
    let out = params[5];

    for instr in chunk {
        let value = instr.expr.codegen(&mut builder, module, &mut emit_ctx)?;
        let (base, index) = match instr.target {
            Target::Helper(i) => (emit_ctx.gh, i),
            Target::Aux(i) => (emit_ctx.aux, i),
            Target::Out(i) => (out, i),
        };
        builder.ins().store(
            MemFlags::new(),
            value,
            base,
            Offset32::new((index * 8) as i32),
        );
        // a freshly written slot must not be served from a stale load
        instr.target.invalidate(&mut emit_ctx.cache);
    }

    builder.ins().return_(&[]);
    builder.finalize();

    Ok(())
}
