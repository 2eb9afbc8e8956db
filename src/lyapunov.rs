//! Lyapunov exponents by tangent-vector co-integration.
//!
//! The base system of dimension `n` is extended with `m` tangent vectors
//! evolving under the variational equation `dv/dt = J(t, y) v`, giving an
//! extended state of dimension `n (m + 1)` laid out as the base state
//! followed by the tangent blocks. A [`LyapunovSolver`] integrates the
//! extended system, orthonormalises the tangent blocks after every call
//! and reports the local exponents `ln(growth) / Δt`; averaging those
//! over a long trajectory estimates the Lyapunov spectrum.
//!
//! [`RestrictedLyapunovSolver`] measures the largest exponent within the
//! complement of a fixed subspace by projecting its single tangent vector
//! against a pre-normalized basis at every renormalization.

use std::rc::Rc;

use log::warn;
use nalgebra::DVector;
use rand_distr::{Distribution, StandardNormal};

use crate::errors::{Error, ValidationError};
use crate::expr::Expr;
use crate::integrator::{integrator_info, Solver, SolverOptions};
use crate::jacobian::Jacobian;
use crate::system::{EquationSource, OdeSystem};

/// Extends a system with `n_lyap` tangent vectors.
///
/// A negative or too large `n_lyap` is clamped to the system dimension.
/// The extension is an equation producer: the tangent equations are
/// derived from one Jacobian pass per invocation instead of being stored,
/// which keeps large extended systems out of memory between the
/// generation stages. Returns the extended system and the clamped number
/// of tangent vectors.
pub fn extend_for_lyapunov(
    system: &OdeSystem,
    n_lyap: isize,
    simplify: bool,
) -> Result<(OdeSystem, usize), Error> {
    let n = system.n();
    let m = if n_lyap < 0 || n_lyap as usize > n {
        n
    } else {
        n_lyap as usize
    };

    let source = system.source().clone();
    let helpers = system.helpers().to_vec();
    let f: Rc<dyn Fn() -> Box<dyn Iterator<Item = Expr>>> = Rc::new(move || {
        let jacobian = Jacobian::new(&helpers, n, false);
        let base: Rc<Vec<Expr>> = Rc::new(source.iter().collect());
        let rows: Rc<Vec<Vec<Expr>>> = Rc::new(
            base.iter()
                .map(|f_i| jacobian.row(f_i).collect())
                .collect(),
        );

        let base_iter = {
            let base = Rc::clone(&base);
            (0..n).map(move |i| base[i].clone())
        };
        let tangent_iter = (0..m).flat_map(move |k| {
            let rows = Rc::clone(&rows);
            (0..n).map(move |i| {
                let mut sum = Expr::Const(0.0);
                for (j, entry) in rows[i].iter().enumerate() {
                    sum = Expr::add(
                        sum,
                        Expr::mul(entry.clone(), Expr::State(j + (k + 1) * n)),
                    );
                }
                if simplify {
                    sum.simplify_bounded()
                } else {
                    sum
                }
            })
        });
        Box::new(base_iter.chain(tangent_iter))
    });

    let extended = OdeSystem::new(
        EquationSource::Producer {
            len: n * (m + 1),
            f,
        },
        system.helpers().to_vec(),
        system.n_params(),
    )?;
    Ok((extended, m))
}

/// Sequential Gram–Schmidt orthonormalization in place.
///
/// Returns the norm each vector had after the projections but before its
/// normalization; these are the growth factors the exponents are computed
/// from. Vectors with a vanishing or non-finite norm are left
/// unnormalized.
pub fn orthonormalise(vectors: &mut [DVector<f64>]) -> Vec<f64> {
    let mut norms = Vec::with_capacity(vectors.len());
    for i in 0..vectors.len() {
        for j in 0..i {
            let projection = vectors[i].dot(&vectors[j]);
            let earlier = vectors[j].clone();
            vectors[i] -= earlier * projection;
        }
        let norm = vectors[i].norm();
        if norm.is_finite() && norm > 0.0 {
            vectors[i] /= norm;
        }
        norms.push(norm);
    }
    norms
}

/// A random unit vector, drawn isotropically.
fn random_direction(n: usize) -> DVector<f64> {
    let mut rng = rand::thread_rng();
    let v = DVector::from_fn(n, |_, _| -> f64 { StandardNormal.sample(&mut rng) });
    let norm = v.norm();
    if norm > 0.0 {
        v / norm
    } else {
        DVector::from_fn(n, |i, _| if i == 0 { 1.0 } else { 0.0 })
    }
}

/// The result of one Lyapunov integration step.
pub struct LyapunovStep {
    /// The base state at the target time.
    pub state: Vec<f64>,
    /// Local exponents `ln(growth) / Δt`, ordered like the tangents.
    pub exponents: Vec<f64>,
    /// The renormalized tangent vectors.
    pub vectors: Vec<Vec<f64>>,
}

/// A solver for the extended system that renormalises the tangents after
/// every integration.
pub struct LyapunovSolver {
    solver: Solver,
    n_basic: usize,
    n_lyap: usize,
}

impl LyapunovSolver {
    /// Builds the extended system, compiles it and binds it to the named
    /// integrator.
    pub fn new(
        system: &OdeSystem,
        n_lyap: isize,
        name: &str,
        options: SolverOptions,
    ) -> Result<Self, Error> {
        let wants_jacobian = integrator_info(name)?.wants_jacobian;
        let (mut extended, m) = extend_for_lyapunov(system, n_lyap, true)?;
        let ode = extended.compile(wants_jacobian)?;
        Ok(Self {
            solver: Solver::new(ode, name, options)?,
            n_basic: system.n(),
            n_lyap: m,
        })
    }

    /// Number of co-integrated tangent vectors (after clamping).
    pub fn n_lyap(&self) -> usize {
        self.n_lyap
    }

    pub fn time(&self) -> f64 {
        self.solver.time()
    }

    /// The base state, without the tangent blocks.
    pub fn state(&self) -> Option<&[f64]> {
        self.solver.state().map(|full| &full[..self.n_basic])
    }

    pub fn is_successful(&self) -> bool {
        self.solver.is_successful()
    }

    pub fn set_parameters(&mut self, params: &[f64]) -> Result<&mut Self, Error> {
        self.solver.set_parameters(params)?;
        Ok(self)
    }

    /// Sets the base initial state; the tangent vectors are drawn as
    /// random unit vectors.
    pub fn set_initial_value(&mut self, y0: &[f64], t0: f64) -> Result<&mut Self, Error> {
        if y0.len() != self.n_basic {
            return Err(ValidationError::DimensionMismatch {
                expected: self.n_basic,
                got: y0.len(),
            }
            .into());
        }
        let mut full = Vec::with_capacity(self.n_basic * (self.n_lyap + 1));
        full.extend_from_slice(y0);
        for _ in 0..self.n_lyap {
            full.extend(random_direction(self.n_basic).iter().copied());
        }
        self.solver.set_initial_value(&full, t0)?;
        Ok(self)
    }

    /// Replaces the tangent vectors, keeping the base state and time.
    pub fn set_tangent_vectors(&mut self, vectors: &[Vec<f64>]) -> Result<&mut Self, Error> {
        if vectors.len() != self.n_lyap {
            return Err(ValidationError::DimensionMismatch {
                expected: self.n_lyap,
                got: vectors.len(),
            }
            .into());
        }
        let base = self.solver.state().ok_or(Error::NotReady)?[..self.n_basic].to_vec();
        let t = self.solver.time();

        let mut full = Vec::with_capacity(self.n_basic * (self.n_lyap + 1));
        full.extend_from_slice(&base);
        for vector in vectors {
            if vector.len() != self.n_basic {
                return Err(ValidationError::DimensionMismatch {
                    expected: self.n_basic,
                    got: vector.len(),
                }
                .into());
            }
            full.extend_from_slice(vector);
        }
        self.solver.set_initial_value(&full, t)?;
        Ok(self)
    }

    /// Integrates to `t`, renormalises the tangents and restarts the
    /// trajectory from the written-back extended state.
    ///
    /// A vanishing or non-finite growth factor (a degenerate tangent) is
    /// reported via a warning, not an error; the corresponding exponent
    /// is whatever the logarithm yields.
    pub fn integrate(&mut self, t: f64) -> Result<LyapunovStep, Error> {
        let dt = t - self.solver.time();
        let full = self.solver.integrate(t)?.to_vec();
        let base = full[..self.n_basic].to_vec();

        let mut tangents: Vec<DVector<f64>> = (0..self.n_lyap)
            .map(|k| {
                let start = (k + 1) * self.n_basic;
                DVector::from_column_slice(&full[start..start + self.n_basic])
            })
            .collect();

        // an idempotent call advanced nothing, so there is no growth to
        // measure
        if dt == 0.0 {
            return Ok(LyapunovStep {
                state: base,
                exponents: vec![0.0; self.n_lyap],
                vectors: tangents.iter().map(|v| v.as_slice().to_vec()).collect(),
            });
        }

        let norms = orthonormalise(&mut tangents);
        if norms.iter().any(|norm| !norm.is_finite() || *norm <= 0.0) {
            warn!("degenerate renormalization at t = {t}: tangent growth factors {norms:?}");
        }
        let exponents = norms.iter().map(|norm| norm.ln() / dt).collect();

        let mut written_back = base.clone();
        for tangent in &tangents {
            written_back.extend_from_slice(tangent.as_slice());
        }
        self.solver.set_initial_value(&written_back, t)?;

        Ok(LyapunovStep {
            state: base,
            exponents,
            vectors: tangents.iter().map(|v| v.as_slice().to_vec()).collect(),
        })
    }
}

/// Measures the largest Lyapunov exponent within the orthogonal
/// complement of a fixed subspace.
///
/// The subspace basis is orthonormalised once at construction; the single
/// tangent vector is projected against it at every renormalization (and
/// when initialized), so growth along the excluded directions never
/// accumulates.
pub struct RestrictedLyapunovSolver {
    inner: LyapunovSolver,
    basis: Vec<DVector<f64>>,
}

impl RestrictedLyapunovSolver {
    pub fn new(
        system: &OdeSystem,
        basis: Vec<Vec<f64>>,
        name: &str,
        options: SolverOptions,
    ) -> Result<Self, Error> {
        let n = system.n();
        for vector in &basis {
            if vector.len() != n {
                return Err(ValidationError::DimensionMismatch {
                    expected: n,
                    got: vector.len(),
                }
                .into());
            }
        }
        let mut basis: Vec<DVector<f64>> =
            basis.iter().map(|v| DVector::from_column_slice(v)).collect();
        orthonormalise(&mut basis);

        Ok(Self {
            inner: LyapunovSolver::new(system, 1, name, options)?,
            basis,
        })
    }

    pub fn time(&self) -> f64 {
        self.inner.time()
    }

    pub fn state(&self) -> Option<&[f64]> {
        self.inner.state()
    }

    pub fn is_successful(&self) -> bool {
        self.inner.is_successful()
    }

    pub fn set_parameters(&mut self, params: &[f64]) -> Result<&mut Self, Error> {
        self.inner.set_parameters(params)?;
        Ok(self)
    }

    /// Sets the base initial state; the tangent vector is drawn randomly
    /// and immediately projected out of the excluded subspace.
    pub fn set_initial_value(&mut self, y0: &[f64], t0: f64) -> Result<&mut Self, Error> {
        self.inner.set_initial_value(y0, t0)?;
        let tangent = self.projected_tangent()?;
        self.inner.set_tangent_vectors(&[tangent.as_slice().to_vec()])?;
        Ok(self)
    }

    /// Integrates to `t` and renormalises the projected tangent.
    pub fn integrate(&mut self, t: f64) -> Result<LyapunovStep, Error> {
        let dt = t - self.inner.time();
        let step = self.inner.integrate(t)?;
        if dt == 0.0 {
            return Ok(step);
        }

        // redo the renormalization with the projection applied to the raw
        // (pre-normalization) tangent: undo the inner normalization first
        let growth = (step.exponents[0] * dt).exp();
        let mut tangent = DVector::from_column_slice(&step.vectors[0]) * growth;
        for b in &self.basis {
            let projection = tangent.dot(b);
            tangent -= b * projection;
        }
        let norm = tangent.norm();
        if !norm.is_finite() || norm <= 0.0 {
            warn!("degenerate restricted renormalization at t = {t}: growth factor {norm}");
        } else {
            tangent /= norm;
        }
        self.inner
            .set_tangent_vectors(&[tangent.as_slice().to_vec()])?;

        Ok(LyapunovStep {
            state: step.state,
            exponents: vec![norm.ln() / dt],
            vectors: vec![tangent.as_slice().to_vec()],
        })
    }

    fn projected_tangent(&mut self) -> Result<DVector<f64>, Error> {
        let full = self.inner.solver.state().ok_or(Error::NotReady)?;
        let n = self.inner.n_basic;
        let mut tangent = DVector::from_column_slice(&full[n..2 * n]);
        for b in &self.basis {
            let projection = tangent.dot(b);
            tangent -= b * projection;
        }
        let norm = tangent.norm();
        if norm > 0.0 {
            tangent /= norm;
        }
        Ok(tangent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn y(i: usize) -> Expr {
        Expr::State(i)
    }

    /// Decoupled linear system with exponents 1.0 and -0.5.
    fn linear_system() -> OdeSystem {
        let source = EquationSource::Fixed(vec![
            y(0),
            Expr::mul(Expr::Const(-0.5), y(1)),
        ]);
        OdeSystem::new(source, Vec::new(), 0).unwrap()
    }

    #[test]
    fn random_directions_are_unit_vectors() {
        for n in [1, 3, 7] {
            let v = random_direction(n);
            assert_eq!(v.len(), n);
            assert_relative_eq!(v.norm(), 1.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn extension_has_the_documented_dimension() {
        let source = EquationSource::Fixed(vec![y(1), y(2), Expr::neg(y(0))]);
        let system = OdeSystem::new(source, Vec::new(), 0).unwrap();

        let (extended, m) = extend_for_lyapunov(&system, 2, false).unwrap();
        assert_eq!(m, 2);
        assert_eq!(extended.n(), 9);
    }

    #[test]
    fn tangent_count_is_clamped_to_the_dimension() {
        let source = EquationSource::Fixed(vec![y(1), y(2), Expr::neg(y(0))]);
        let system = OdeSystem::new(source, Vec::new(), 0).unwrap();

        let (extended, m) = extend_for_lyapunov(&system, 10, false).unwrap();
        assert_eq!(m, 3);
        assert_eq!(extended.n(), 12);

        let (extended, m) = extend_for_lyapunov(&system, -1, false).unwrap();
        assert_eq!(m, 3);
        assert_eq!(extended.n(), 12);
    }

    #[test]
    fn tangent_blocks_follow_the_variational_equation() {
        // f = [y1, -y0]; J = [[0, 1], [-1, 0]]; tangent block (v0, v1)
        // evolves as (v1, -v0)
        let source = EquationSource::Fixed(vec![y(1), Expr::neg(y(0))]);
        let system = OdeSystem::new(source, Vec::new(), 0).unwrap();
        let (extended, _) = extend_for_lyapunov(&system, 1, false).unwrap();

        let equations: Vec<Expr> = extended.source().iter().collect();
        assert_eq!(equations.len(), 4);
        let state = [0.3, 0.7, 2.0, 5.0];
        assert_relative_eq!(equations[2].eval(0.0, &state, &[], &[], &[]), 5.0);
        assert_relative_eq!(equations[3].eval(0.0, &state, &[], &[], &[]), -2.0);
    }

    #[test]
    fn orthonormalise_returns_pre_normalization_norms() {
        let mut vectors = vec![
            DVector::from_column_slice(&[3.0, 0.0]),
            DVector::from_column_slice(&[1.0, 2.0]),
        ];
        let norms = orthonormalise(&mut vectors);

        assert_relative_eq!(norms[0], 3.0);
        // after removing the component along e0, (1, 2) has norm 2
        assert_relative_eq!(norms[1], 2.0);
        assert_relative_eq!(vectors[0].norm(), 1.0);
        assert_relative_eq!(vectors[1].norm(), 1.0);
        assert_relative_eq!(vectors[0].dot(&vectors[1]), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn local_exponents_of_a_linear_system() {
        let system = linear_system();
        let mut solver =
            LyapunovSolver::new(&system, 2, "dopri5", SolverOptions::default()).unwrap();
        solver.set_initial_value(&[1.0, 1.0], 0.0).unwrap();
        // align the tangents with the eigendirections
        solver
            .set_tangent_vectors(&[vec![1.0, 0.0], vec![0.0, 1.0]])
            .unwrap();

        let step = solver.integrate(0.5).unwrap();
        assert_relative_eq!(step.exponents[0], 1.0, max_relative = 1e-4);
        assert_relative_eq!(step.exponents[1], -0.5, max_relative = 1e-4);
    }

    #[test]
    fn tangents_stay_orthonormal_across_calls() {
        let system = linear_system();
        let mut solver =
            LyapunovSolver::new(&system, 2, "dopri5", SolverOptions::default()).unwrap();
        solver.set_initial_value(&[1.0, 1.0], 0.0).unwrap();

        let mut step = None;
        for i in 1..=4 {
            step = Some(solver.integrate(0.25 * i as f64).unwrap());
        }
        let vectors: Vec<DVector<f64>> = step
            .unwrap()
            .vectors
            .iter()
            .map(|v| DVector::from_column_slice(v))
            .collect();
        assert_relative_eq!(vectors[0].norm(), 1.0, max_relative = 1e-9);
        assert_relative_eq!(vectors[1].norm(), 1.0, max_relative = 1e-9);
        assert_relative_eq!(vectors[0].dot(&vectors[1]), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn idempotent_call_reports_zero_exponents() {
        let system = linear_system();
        let mut solver =
            LyapunovSolver::new(&system, 1, "dopri5", SolverOptions::default()).unwrap();
        solver.set_initial_value(&[1.0, 1.0], 0.0).unwrap();
        solver.integrate(1.0).unwrap();

        let step = solver.integrate(1.0).unwrap();
        assert_eq!(step.exponents, vec![0.0]);
    }

    #[test]
    fn restricted_solver_avoids_the_excluded_direction() {
        // excluding the growing direction leaves the -0.5 exponent
        let system = linear_system();
        let mut solver = RestrictedLyapunovSolver::new(
            &system,
            vec![vec![1.0, 0.0]],
            "dopri5",
            SolverOptions::default(),
        )
        .unwrap();
        solver.set_initial_value(&[1.0, 1.0], 0.0).unwrap();

        let mut exponent = 0.0;
        for i in 1..=8 {
            let step = solver.integrate(0.25 * i as f64).unwrap();
            exponent = step.exponents[0];
        }
        assert_relative_eq!(exponent, -0.5, max_relative = 1e-3);
    }
}
