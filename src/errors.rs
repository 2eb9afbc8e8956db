//! Error types for the various failure modes.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur while converting a parsed equation string into an
/// expression tree.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The operator is not part of the supported vocabulary.
    #[error("unsupported operator: {0:?}")]
    UnsupportedOperator(String),

    /// A function call with a name the conversion does not know.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// A symbol that was never declared as state, parameter or helper.
    #[error("undeclared symbol: {0}")]
    UndeclaredSymbol(String),

    /// An exponent that is neither an integer nor a float constant.
    #[error("exponents must be constants, got: {0}")]
    NonConstantExponent(String),

    /// Malformed parse tree (wrong arity for an operator).
    #[error("malformed expression: {0}")]
    Malformed(String),

    /// The underlying parser rejected the input.
    #[error("parse error: {0}")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
}

/// Errors that can occur while building machine code with Cranelift.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// The host architecture is not supported.
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),

    /// Cranelift code generation failed.
    #[error("codegen error: {0}")]
    CodegenError(#[from] CodegenError),

    /// Error in the Cranelift JIT module.
    #[error("module error: {0}")]
    ModuleError(#[from] ModuleError),

    /// Failed to declare a function in the JIT module.
    #[error("declaration error: {0}")]
    DeclarationError(String),

    /// Failed to define or finalize a function body.
    #[error("function error: {0}")]
    FunctionError(String),
}

/// Errors from validating an equation system before generation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The system has no equations.
    #[error("the system contains no equations")]
    EmptySystem,

    /// A right-hand side references a state component outside `0..n`.
    #[error("state index {index} out of range for a system of dimension {n}")]
    StateIndexOutOfRange { index: usize, n: usize },

    /// A helper references a helper slot outside the declared set.
    #[error("helper index {index} out of range ({count} helpers declared)")]
    HelperIndexOutOfRange { index: usize, count: usize },

    /// A right-hand side references a parameter outside the declared set.
    #[error("parameter index {index} out of range ({count} parameters declared)")]
    ParamIndexOutOfRange { index: usize, count: usize },

    /// The helper dependency graph contains a cycle.
    #[error("helper definitions are cyclic (involving helper {0})")]
    HelperCycle(usize),

    /// A producer source yielded a different number of equations than its
    /// declared length.
    #[error("equation producer yielded {got} equations, declared {declared}")]
    LengthMismatch { declared: usize, got: usize },

    /// Two declared symbols share a name.
    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),

    /// The wrong number of parameter values was supplied.
    #[error("expected {expected} parameter values, got {got}")]
    ParameterCount { expected: usize, got: usize },

    /// An initial state of the wrong dimension was supplied.
    #[error("expected a state of dimension {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Top-level error type of the crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The backend failed to reach the requested time. Carries the last
    /// valid state and the time it belongs to.
    #[error("integration was unsuccessful at t = {time}")]
    UnsuccessfulIntegration { time: f64, state: Vec<f64> },

    /// `integrate` was asked for a time before the current one.
    #[error("requested time {requested} lies before the current time {current}")]
    InvalidTimeOrder { current: f64, requested: f64 },

    /// The integrator name is not in either backend family.
    #[error("no integrator named {0:?}")]
    NoSuchIntegrator(String),

    /// The operation exists but is not available for this configuration.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// `integrate` was called before an initial value was set.
    #[error("no initial value has been set")]
    NotReady,
}
