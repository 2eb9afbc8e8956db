//! The stateful integrator family: steppers that hold the current
//! `(t, y)` and step size between calls, so successive `integrate`
//! requests continue where the previous one stopped.
//!
//! Two methods are provided. `Dopri5` is an adaptive Dormand–Prince 5(4)
//! pair for non-stiff problems. `Rosenbrock` is a linearly implicit Euler
//! scheme with step-doubling error control; it consumes the compiled
//! Jacobian and handles moderately stiff systems the explicit pair
//! rejects into vanishing steps.

use std::rc::Rc;

use nalgebra::{DMatrix, DVector};

use crate::errors::Error;
use crate::system::CompiledOde;

/// Relative floor under which a step size counts as vanished.
const MIN_STEP_FACTOR: f64 = 1e-14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Dopri5,
    Rosenbrock,
}

impl Method {
    pub fn wants_jacobian(&self) -> bool {
        matches!(self, Method::Rosenbrock)
    }
}

/// An adaptive stepper owning the current state of the integration.
pub(crate) struct StatefulStepper {
    ode: Rc<CompiledOde>,
    method: Method,
    rtol: f64,
    atol: f64,
    t: f64,
    y: DVector<f64>,
    /// Step size proposal carried across calls.
    h: f64,
}

impl StatefulStepper {
    pub fn new(
        ode: Rc<CompiledOde>,
        method: Method,
        rtol: f64,
        atol: f64,
        first_step: f64,
    ) -> Self {
        let n = ode.n();
        Self {
            ode,
            method,
            rtol,
            atol,
            t: 0.0,
            y: DVector::zeros(n),
            h: first_step,
        }
    }

    pub fn set_state(&mut self, t: f64, y: DVector<f64>) {
        self.t = t;
        self.y = y;
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.y
    }

    /// Advances to exactly `target`, adapting the step size on the way.
    pub fn advance_to(&mut self, target: f64, params: &[f64]) -> Result<(), Error> {
        while self.t < target {
            let remaining = target - self.t;
            // rounding can leave a sub-resolution residue
            if remaining <= MIN_STEP_FACTOR * target.abs().max(1.0) {
                self.t = target;
                break;
            }
            self.try_step(self.h.min(remaining), params)?;
        }
        Ok(())
    }

    /// Performs a single accepted internal step toward `target` and
    /// returns the time reached. Does not step past `target`.
    pub fn step(&mut self, target: f64, params: &[f64]) -> Result<f64, Error> {
        if self.t < target {
            let remaining = target - self.t;
            if remaining <= MIN_STEP_FACTOR * target.abs().max(1.0) {
                self.t = target;
            } else {
                self.try_step(self.h.min(remaining), params)?;
            }
        }
        Ok(self.t)
    }

    /// Attempts steps starting at size `h`, shrinking on rejection, until
    /// one is accepted or the step size vanishes.
    fn try_step(&mut self, mut h: f64, params: &[f64]) -> Result<(), Error> {
        loop {
            if h < MIN_STEP_FACTOR * self.t.abs().max(1.0) {
                return Err(Error::UnsuccessfulIntegration {
                    time: self.t,
                    state: self.y.as_slice().to_vec(),
                });
            }

            let (y_new, err, order) = match self.method {
                Method::Dopri5 => self.dopri5_step(h, params),
                Method::Rosenbrock => match self.rosenbrock_step(h, params) {
                    Some(result) => result,
                    // singular iteration matrix: retry with a smaller step
                    None => {
                        h *= 0.5;
                        continue;
                    }
                },
            };

            let factor = (0.9 * err.powf(-1.0 / order)).clamp(0.2, 5.0);
            if err <= 1.0 {
                self.t += h;
                self.y = y_new;
                self.h = h * factor;
                return Ok(());
            }
            h *= factor;
        }
    }

    /// Scaled RMS norm of the error estimate. A non-finite estimate (the
    /// solution overflowed within the attempt) counts as infinitely
    /// large, so the step is rejected rather than accepted on a NaN.
    fn error_norm(&self, err: &DVector<f64>, y_old: &DVector<f64>, y_new: &DVector<f64>) -> f64 {
        let n = err.len();
        let mut sum = 0.0;
        for i in 0..n {
            let scale = self.atol + self.rtol * y_old[i].abs().max(y_new[i].abs());
            let ratio = err[i] / scale;
            sum += ratio * ratio;
        }
        let norm = (sum / n as f64).sqrt();
        if norm.is_finite() {
            norm.max(1e-16)
        } else {
            f64::INFINITY
        }
    }

    fn eval_f(&self, t: f64, y: &DVector<f64>, params: &[f64]) -> DVector<f64> {
        let mut dy = DVector::zeros(y.len());
        self.ode.eval_f(t, y.as_slice(), params, dy.as_mut_slice());
        dy
    }

    /// One Dormand–Prince 5(4) attempt. Returns the candidate state, the
    /// scaled error and the adaptation order.
    fn dopri5_step(&self, h: f64, params: &[f64]) -> (DVector<f64>, f64, f64) {
        let (t, y) = (self.t, &self.y);

        let k1 = self.eval_f(t, y, params);
        let k2 = self.eval_f(t + h / 5.0, &(y + &k1 * (h / 5.0)), params);
        let k3 = self.eval_f(
            t + 3.0 / 10.0 * h,
            &(y + &k1 * (3.0 / 40.0 * h) + &k2 * (9.0 / 40.0 * h)),
            params,
        );
        let k4 = self.eval_f(
            t + 4.0 / 5.0 * h,
            &(y + &k1 * (44.0 / 45.0 * h) - &k2 * (56.0 / 15.0 * h) + &k3 * (32.0 / 9.0 * h)),
            params,
        );
        let k5 = self.eval_f(
            t + 8.0 / 9.0 * h,
            &(y + &k1 * (19372.0 / 6561.0 * h) - &k2 * (25360.0 / 2187.0 * h)
                + &k3 * (64448.0 / 6561.0 * h)
                - &k4 * (212.0 / 729.0 * h)),
            params,
        );
        let k6 = self.eval_f(
            t + h,
            &(y + &k1 * (9017.0 / 3168.0 * h) - &k2 * (355.0 / 33.0 * h)
                + &k3 * (46732.0 / 5247.0 * h)
                + &k4 * (49.0 / 176.0 * h)
                - &k5 * (5103.0 / 18656.0 * h)),
            params,
        );

        let y_new = y
            + &k1 * (35.0 / 384.0 * h)
            + &k3 * (500.0 / 1113.0 * h)
            + &k4 * (125.0 / 192.0 * h)
            - &k5 * (2187.0 / 6784.0 * h)
            + &k6 * (11.0 / 84.0 * h);

        let k7 = self.eval_f(t + h, &y_new, params);

        // difference between the 5th and embedded 4th order solutions
        let err_vec = (&k1 * (71.0 / 57600.0) - &k3 * (71.0 / 16695.0) + &k4 * (71.0 / 1920.0)
            - &k5 * (17253.0 / 339200.0)
            + &k6 * (22.0 / 525.0)
            - &k7 * (1.0 / 40.0))
            * h;

        let err = self.error_norm(&err_vec, y, &y_new);
        (y_new, err, 5.0)
    }

    /// One linearly implicit Euler attempt with step doubling: a full
    /// step is compared against two half steps, and the extrapolated
    /// combination `2 fine - coarse` cancels the leading error term, so
    /// the accepted state is second order. Returns `None` when the
    /// iteration matrix is singular at this step size.
    fn rosenbrock_step(&self, h: f64, params: &[f64]) -> Option<(DVector<f64>, f64, f64)> {
        let (t, y) = (self.t, &self.y);

        let coarse = self.implicit_euler(t, y, h, params)?;
        let half = self.implicit_euler(t, y, h / 2.0, params)?;
        let fine = self.implicit_euler(t + h / 2.0, &half, h / 2.0, params)?;

        let err_vec = &fine - &coarse;
        let extrapolated = &fine * 2.0 - coarse;
        let err = self.error_norm(&err_vec, y, &extrapolated);
        Some((extrapolated, err, 2.0))
    }

    /// Solves `(I - h J) dy = h f` and returns `y + dy`.
    fn implicit_euler(
        &self,
        t: f64,
        y: &DVector<f64>,
        h: f64,
        params: &[f64],
    ) -> Option<DVector<f64>> {
        let n = y.len();
        let f = self.eval_f(t, y, params);

        let mut jac_flat = vec![0.0; n * n];
        self.ode.eval_jac(t, y.as_slice(), params, &mut jac_flat);
        let jac = DMatrix::from_row_slice(n, n, &jac_flat);

        let lhs = DMatrix::identity(n, n) - jac * h;
        let dy = lhs.lu().solve(&(f * h))?;
        Some(y + dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::system::{EquationSource, OdeSystem};
    use approx::assert_relative_eq;

    fn decay_ode(wants_jacobian: bool) -> Rc<CompiledOde> {
        // dy/dt = -a * y with parameter a
        let source = EquationSource::Fixed(vec![Expr::mul(
            Expr::neg(Expr::Param(0)),
            Expr::State(0),
        )]);
        OdeSystem::new(source, Vec::new(), 1)
            .unwrap()
            .compile(wants_jacobian)
            .unwrap()
    }

    #[test]
    fn dopri5_matches_exponential_decay() {
        let mut stepper =
            StatefulStepper::new(decay_ode(false), Method::Dopri5, 1e-8, 1e-10, 0.01);
        stepper.set_state(0.0, DVector::from_element(1, 1.0));
        stepper.advance_to(2.0, &[0.7]).unwrap();

        assert_relative_eq!(stepper.t(), 2.0);
        assert_relative_eq!(stepper.state()[0], (-1.4f64).exp(), max_relative = 1e-6);
    }

    #[test]
    fn rosenbrock_matches_exponential_decay() {
        let mut stepper =
            StatefulStepper::new(decay_ode(true), Method::Rosenbrock, 1e-7, 1e-9, 0.01);
        stepper.set_state(0.0, DVector::from_element(1, 1.0));
        stepper.advance_to(1.0, &[2.0]).unwrap();

        assert_relative_eq!(stepper.t(), 1.0);
        assert_relative_eq!(stepper.state()[0], (-2.0f64).exp(), max_relative = 1e-4);
    }

    #[test]
    fn single_step_stops_at_internal_boundary() {
        let mut stepper =
            StatefulStepper::new(decay_ode(false), Method::Dopri5, 1e-8, 1e-10, 0.01);
        stepper.set_state(0.0, DVector::from_element(1, 1.0));

        let reached = stepper.step(10.0, &[0.5]).unwrap();
        assert!(reached > 0.0);
        assert!(reached < 10.0);
        assert_relative_eq!(stepper.t(), reached);
    }

    #[test]
    fn step_size_adapts_across_calls() {
        let mut stepper =
            StatefulStepper::new(decay_ode(false), Method::Dopri5, 1e-6, 1e-9, 1e-4);
        stepper.set_state(0.0, DVector::from_element(1, 1.0));
        stepper.advance_to(0.5, &[0.1]).unwrap();
        // a benign problem must have grown the step proposal
        assert!(stepper.h > 1e-4);
    }
}
