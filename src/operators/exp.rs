//! Linking and calling the exponential function in JIT-compiled code.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

/// Declares the external exp function (f64 -> f64) to the module.
///
/// Declaring an already declared import returns the same id, so this can be
/// called once per use site.
pub(crate) fn link_exp(module: &mut JITModule) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));

    let func_id = module
        .declare_function("exp", Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;

    Ok(func_id)
}

/// Emits a call to the previously linked exp function.
pub(crate) fn call_exp(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    arg: Value,
) -> Result<Value, BuilderError> {
    let func_id = link_exp(module)?;
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[arg]);
    Ok(builder.inst_results(call)[0])
}
