//! Linking and calling sine and cosine in JIT-compiled code.

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, InstBuilder, Value};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

fn link_unary(module: &mut JITModule, name: &str) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(name, Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))
}

fn call_unary(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    func_id: FuncId,
    arg: Value,
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, &[arg]);
    builder.inst_results(call)[0]
}

/// Emits a call to the external sin function.
pub(crate) fn call_sin(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    arg: Value,
) -> Result<Value, BuilderError> {
    let func_id = link_unary(module, "sin")?;
    Ok(call_unary(builder, module, func_id, arg))
}

/// Emits a call to the external cos function.
pub(crate) fn call_cos(
    builder: &mut FunctionBuilder,
    module: &mut JITModule,
    arg: Value,
) -> Result<Value, BuilderError> {
    let func_id = link_unary(module, "cos")?;
    Ok(call_unary(builder, module, func_id, arg))
}
