//! Linking and calling the floating point power function in JIT-compiled
//! code. Integer exponents never reach this path; they are emitted inline
//! as multiplications.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

/// Declares the external pow function (f64, f64 -> f64) to the module.
pub(crate) fn link_pow(module: &mut JITModule) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));

    let func_id = module
        .declare_function("pow", Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;

    Ok(func_id)
}

/// Emits a call to the previously linked pow function.
pub(crate) fn call_pow(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    base: Value,
    exponent: Value,
) -> Result<Value, BuilderError> {
    let func_id = link_pow(module)?;
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[base, exponent]);
    Ok(builder.inst_results(call)[0])
}
