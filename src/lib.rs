//! JIT-compiled ordinary differential equations with symbolic Jacobians
//! and Lyapunov exponents.
//!
//! This crate turns a symbolically specified ODE system into native
//! machine code and integrates it. Equations are parsed with
//! [evalexpr](https://github.com/ISibboI/evalexpr) or built
//! programmatically, differentiated symbolically (with chain-rule support
//! for intermediate helper expressions), compiled with
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! and driven by one of several integrator backends. Tangent vectors can
//! be co-integrated and periodically renormalised to estimate Lyapunov
//! exponents.
//!
//! # Features
//!
//! - Helper-aware symbolic Jacobians, generated lazily and emitted
//!   sparsely
//! - Chunked code generation with optional common-subexpression
//!   extraction, so very large generated systems stay compilable
//! - Two integrator families behind one interface: in-crate stateful
//!   steppers and span solvers from `ode_solvers`
//! - Lyapunov exponent estimation, optionally restricted to the
//!   complement of a fixed subspace
//!
//! # Example
//!
//! ```rust
//! use jitode::{OdeSystem, Solver, SolverOptions};
//!
//! // a damped oscillator, with the restoring force as a helper
//! let mut system = OdeSystem::from_strings(
//!     &["v", "force - 0.1*v"],
//!     &["x", "v"],
//!     &["omega"],
//!     &[("force", "-omega^2 * x")],
//! )
//! .unwrap();
//!
//! let ode = system.compile(false).unwrap();
//! let mut solver = Solver::new(ode, "dopri5", SolverOptions::default()).unwrap();
//! solver.set_parameters(&[1.0]).unwrap();
//! solver.set_initial_value(&[1.0, 0.0], 0.0).unwrap();
//!
//! let state = solver.integrate(10.0).unwrap();
//! assert!(state[0].abs() < 1.0);
//! ```

pub use emit::EmitOptions;
pub use errors::Error;
pub use expr::{Expr, Wrt};
pub use integrator::{integrator_info, BackendKind, IntegratorInfo, Solver, SolverOptions};
pub use lyapunov::{LyapunovSolver, LyapunovStep, RestrictedLyapunovSolver};
pub use system::{CompiledOde, EquationSource, OdeSystem};

pub mod prelude {
    pub use crate::convert::{parse_expression, SymbolTable};
    pub use crate::errors::Error;
    pub use crate::expr::Expr;
    pub use crate::integrator::{Solver, SolverOptions};
    pub use crate::lyapunov::LyapunovSolver;
    pub use crate::system::OdeSystem;
}

/// JIT compilation of instruction batches using Cranelift
pub(crate) mod builder;
/// Conversion from parsed equation strings to expression trees
pub mod convert;
/// Instruction batches, CSE, chunking and the interpreted fallback
pub mod emit;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// The integrator backend adapter
pub mod integrator;
/// Helper-aware symbolic Jacobians
pub(crate) mod jacobian;
/// Lyapunov exponents by tangent-vector co-integration
pub mod lyapunov;
/// The stateful integrator family
pub(crate) mod stepper;
/// The equation model and its staged compilation
pub mod system;
/// Type aliases for JIT-compiled routines
pub(crate) mod types;
/// Functions for linking external functions into generated code
pub(crate) mod operators {
    pub(crate) mod exp;
    pub(crate) mod ln;
    pub(crate) mod pow;
    pub(crate) mod trigonometric;
}
