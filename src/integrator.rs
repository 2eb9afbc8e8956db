//! The integrator backend adapter.
//!
//! A [`Solver`] presents one integration interface over two backend
//! families, chosen once by name at construction:
//!
//! - the stateful family (`"dopri5"`, `"rosenbrock"`), in-crate steppers
//!   that keep their position and step size between calls;
//! - the span family (`"RK45"`, `"DOP853"`), backed by `ode_solvers`,
//!   where each `integrate` call solves the span from the current time to
//!   the target with a freshly constructed stepper.
//!
//! The families behave identically through this interface: `integrate`
//! to a target time, idempotent for the current time, strictly rejecting
//! backwards targets, and reporting the last valid state when a backend
//! gives up.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DVector;
use ode_solvers::dop_shared::OutputType;
use ode_solvers::{Dop853, Dopri5, System};

use crate::errors::{Error, ValidationError};
use crate::stepper::{Method, StatefulStepper};
use crate::system::CompiledOde;

/// Which family an integrator name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Stateful,
    Span,
}

/// What a named integrator needs from the compiled system.
#[derive(Debug, Clone, Copy)]
pub struct IntegratorInfo {
    pub kind: BackendKind,
    pub wants_jacobian: bool,
}

/// Resolves an integrator name against the two family tables.
///
/// `"zvode"` is recognized but rejected: it is a complex-valued backend
/// and this crate's systems are real.
pub fn integrator_info(name: &str) -> Result<IntegratorInfo, Error> {
    match name {
        "dopri5" => Ok(IntegratorInfo {
            kind: BackendKind::Stateful,
            wants_jacobian: false,
        }),
        "rosenbrock" => Ok(IntegratorInfo {
            kind: BackendKind::Stateful,
            wants_jacobian: true,
        }),
        "RK45" | "DOP853" => Ok(IntegratorInfo {
            kind: BackendKind::Span,
            wants_jacobian: false,
        }),
        "zvode" => Err(Error::NotSupported(
            "zvode integrates complex-valued systems".to_string(),
        )),
        other => Err(Error::NoSuchIntegrator(other.to_string())),
    }
}

/// Tolerances and span behavior of a solver.
#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    /// Initial step size proposal of the stateful family.
    pub first_step: f64,
    /// Span family only: when false, the reported state is the one the
    /// final accepted step computed at the target, not a value of the
    /// dense interpolant.
    pub interpolate: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-9,
            first_step: 1e-4,
            interpolate: true,
        }
    }
}

enum SpanMethod {
    Rk45,
    Dop853,
}

enum Backend {
    Stateful(StatefulStepper),
    Span(SpanMethod),
}

/// Right-hand side adapter handed to `ode_solvers`, with an optional
/// step-synchronous stop at the first boundary at or past `stop_at`.
///
/// While a stop is armed, every boundary the run reaches is recorded in
/// `boundary`, so the caller sees the last step position even when the
/// run fails before the stop.
struct SpanSystem {
    ode: Rc<CompiledOde>,
    params: Vec<f64>,
    stop_at: Option<f64>,
    boundary: Rc<RefCell<Option<(f64, DVector<f64>)>>>,
}

impl System<f64, DVector<f64>> for SpanSystem {
    fn system(&self, x: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        self.ode.eval_f(x, y.as_slice(), &self.params, dy.as_mut_slice());
    }

    fn solout(&mut self, x: f64, y: &DVector<f64>, _dy: &DVector<f64>) -> bool {
        match self.stop_at {
            Some(stop) => {
                *self.boundary.borrow_mut() = Some((x, y.clone()));
                x >= stop
            }
            None => false,
        }
    }
}

/// A compiled system bound to one integrator backend.
pub struct Solver {
    ode: Rc<CompiledOde>,
    backend: Backend,
    options: SolverOptions,
    params: Vec<f64>,
    t: f64,
    y: Option<DVector<f64>>,
    success: bool,
}

impl Solver {
    /// Binds a compiled system to the named integrator.
    ///
    /// Fails when the name is unknown, when `"zvode"` is requested, or
    /// when the integrator needs a Jacobian the system was compiled
    /// without.
    pub fn new(ode: Rc<CompiledOde>, name: &str, options: SolverOptions) -> Result<Self, Error> {
        let info = integrator_info(name)?;
        if info.wants_jacobian && !ode.has_jacobian() {
            return Err(Error::NotSupported(format!(
                "integrator {name:?} needs a Jacobian, but none was generated"
            )));
        }

        let backend = match (info.kind, name) {
            (BackendKind::Stateful, "rosenbrock") => Backend::Stateful(StatefulStepper::new(
                Rc::clone(&ode),
                Method::Rosenbrock,
                options.rtol,
                options.atol,
                options.first_step,
            )),
            (BackendKind::Stateful, _) => Backend::Stateful(StatefulStepper::new(
                Rc::clone(&ode),
                Method::Dopri5,
                options.rtol,
                options.atol,
                options.first_step,
            )),
            (BackendKind::Span, "DOP853") => Backend::Span(SpanMethod::Dop853),
            (BackendKind::Span, _) => Backend::Span(SpanMethod::Rk45),
        };

        Ok(Self {
            params: vec![0.0; ode.n_params()],
            ode,
            backend,
            options,
            t: 0.0,
            y: None,
            success: true,
        })
    }

    /// Sets the initial state and time. Any previous trajectory position
    /// is discarded and the span is set up anew from here.
    pub fn set_initial_value(&mut self, y0: &[f64], t0: f64) -> Result<&mut Self, Error> {
        if y0.len() != self.ode.n() {
            return Err(ValidationError::DimensionMismatch {
                expected: self.ode.n(),
                got: y0.len(),
            }
            .into());
        }
        let y = DVector::from_column_slice(y0);
        if let Backend::Stateful(stepper) = &mut self.backend {
            stepper.set_state(t0, y.clone());
        }
        self.t = t0;
        self.y = Some(y);
        self.success = true;
        Ok(self)
    }

    /// Sets the control parameter values, shared between the derivative
    /// and the Jacobian.
    pub fn set_parameters(&mut self, params: &[f64]) -> Result<&mut Self, Error> {
        if params.len() != self.ode.n_params() {
            return Err(ValidationError::ParameterCount {
                expected: self.ode.n_params(),
                got: params.len(),
            }
            .into());
        }
        self.params = params.to_vec();
        Ok(self)
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    /// The current state, if an initial value has been set.
    pub fn state(&self) -> Option<&[f64]> {
        self.y.as_ref().map(|y| y.as_slice())
    }

    /// False once a backend has failed to reach a requested time.
    pub fn is_successful(&self) -> bool {
        self.success
    }

    /// Advances the trajectory to time `t` and returns the state there.
    ///
    /// Asking for the current time returns the state unchanged without
    /// touching the backend; asking for an earlier time is an error that
    /// leaves the solver untouched.
    pub fn integrate(&mut self, t: f64) -> Result<&[f64], Error> {
        if self.y.is_none() {
            return Err(Error::NotReady);
        }
        if t == self.t {
            return Ok(self.y.as_ref().unwrap().as_slice());
        }
        if t < self.t {
            return Err(Error::InvalidTimeOrder {
                current: self.t,
                requested: t,
            });
        }

        match &mut self.backend {
            Backend::Stateful(stepper) => {
                let result = stepper.advance_to(t, &self.params);
                self.t = stepper.t();
                self.y = Some(stepper.state().clone());
                if let Err(e) = result {
                    self.success = false;
                    return Err(e);
                }
            }
            Backend::Span(method) => {
                let y0 = self.y.as_ref().unwrap().clone();
                let outcome = integrate_span(
                    Rc::clone(&self.ode),
                    method,
                    &self.options,
                    &self.params,
                    self.t,
                    t,
                    y0,
                );
                match outcome {
                    Ok((reached, y)) => {
                        self.t = reached;
                        self.y = Some(y);
                    }
                    Err(e) => {
                        if let Error::UnsuccessfulIntegration { time, state } = &e {
                            self.t = *time;
                            self.y = Some(DVector::from_column_slice(state));
                        }
                        self.success = false;
                        return Err(e);
                    }
                }
            }
        }
        Ok(self.y.as_ref().unwrap().as_slice())
    }

    /// Performs a single internal step toward `t` and returns the time
    /// reached. Only the stateful family exposes its step boundaries.
    pub fn step(&mut self, t: f64) -> Result<f64, Error> {
        if self.y.is_none() {
            return Err(Error::NotReady);
        }
        if t < self.t {
            return Err(Error::InvalidTimeOrder {
                current: self.t,
                requested: t,
            });
        }
        match &mut self.backend {
            Backend::Stateful(stepper) => {
                let result = stepper.step(t, &self.params);
                self.t = stepper.t();
                self.y = Some(stepper.state().clone());
                if result.is_err() {
                    self.success = false;
                }
                result
            }
            Backend::Span(_) => Err(Error::NotSupported(
                "single stepping is only available on the stateful family".to_string(),
            )),
        }
    }
}

/// Solves one span `[t0, target]` with a freshly built `ode_solvers`
/// stepper and returns the time and state reached.
///
/// Without interpolation the stepper records its accepted steps
/// (`OutputType::Sparse`, so the state `solout` observes belongs to the
/// boundary it is called at) and the run is stopped by `solout` at the
/// target, which the final step lands on exactly.
fn integrate_span(
    ode: Rc<CompiledOde>,
    method: &SpanMethod,
    options: &SolverOptions,
    params: &[f64],
    t0: f64,
    target: f64,
    y0: DVector<f64>,
) -> Result<(f64, DVector<f64>), Error> {
    let boundary = Rc::new(RefCell::new(None));
    let system = SpanSystem {
        ode,
        params: params.to_vec(),
        stop_at: (!options.interpolate).then_some(target),
        boundary: Rc::clone(&boundary),
    };

    let out_type = if options.interpolate {
        OutputType::Dense
    } else {
        OutputType::Sparse
    };
    let dx = target - t0;

    let outcome = match method {
        SpanMethod::Rk45 => {
            let mut stepper = Dopri5::from_param(
                system,
                t0,
                target,
                dx,
                y0,
                options.rtol,
                options.atol,
                0.9,
                0.04,
                0.2,
                10.0,
                dx,
                0.0,
                100_000,
                1000,
                out_type,
            );
            let result = stepper.integrate();
            collect_span(result, stepper.x_out(), stepper.y_out())
        }
        SpanMethod::Dop853 => {
            let mut stepper = Dop853::from_param(
                system,
                t0,
                target,
                dx,
                y0,
                options.rtol,
                options.atol,
                0.9,
                0.0,
                0.333,
                6.0,
                dx,
                0.0,
                100_000,
                1000,
                out_type,
            );
            let result = stepper.integrate();
            collect_span(result, stepper.x_out(), stepper.y_out())
        }
    };

    let (reached, y) = match outcome {
        Ok(point) => point,
        Err(err) => {
            // the recorded step position is more precise than the output
            // table when the run stops between recorded points
            if let Some((x, y_last)) = boundary.borrow_mut().take() {
                return Err(Error::UnsuccessfulIntegration {
                    time: x,
                    state: y_last.as_slice().to_vec(),
                });
            }
            return Err(err);
        }
    };
    if options.interpolate {
        Ok((reached, y))
    } else {
        match boundary.borrow_mut().take() {
            Some((x, y_boundary)) => Ok((x, y_boundary)),
            None => Ok((reached, y)),
        }
    }
}

/// Reduces an `ode_solvers` run to its final point. A failed run, or one
/// that recorded no output at all, becomes an `UnsuccessfulIntegration`
/// carrying whatever point is still valid.
fn collect_span<S, E>(
    result: Result<S, E>,
    x_out: &[f64],
    y_out: &[DVector<f64>],
) -> Result<(f64, DVector<f64>), Error> {
    let last = x_out.last().copied().zip(y_out.last());
    match (result, last) {
        (Ok(_), Some((x, y))) => Ok((x, y.clone())),
        (_, last) => {
            let time = last.map(|(x, _)| x).unwrap_or(f64::NAN);
            let state = last.map(|(_, y)| y.as_slice().to_vec()).unwrap_or_default();
            Err(Error::UnsuccessfulIntegration { time, state })
        }
    }
}
