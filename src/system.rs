//! The equation model: a system of ODE right-hand sides with helpers and
//! parameters, and its staged compilation into native routines.
//!
//! A system is built either programmatically from [`Expr`] trees or from
//! equation strings via [`OdeSystem::from_strings`]. Construction brings
//! the helpers into dependency order (rejecting cycles) and validates
//! every index the equations reference. The helper, derivative and
//! Jacobian generation stages are cached independently, so regenerating
//! an existing stage is a no-op and a solver that never asks for the
//! Jacobian never pays for it.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::convert::{parse_expression, SymbolTable};
use crate::emit::{build_routine, EmitOptions, Instr, Routine, Target};
use crate::errors::{Error, ValidationError};
use crate::expr::Expr;
use crate::jacobian::Jacobian;

/// Where the right-hand sides come from.
///
/// `Fixed` holds the equations in memory. `Producer` generates them on
/// demand: the closure must be deterministic and re-invocable, because
/// validation, derivative generation and Jacobian generation each iterate
/// it afresh. Producers keep very large generated systems (such as
/// Lyapunov extensions) from being materialized more often than needed.
#[derive(Clone)]
pub enum EquationSource {
    Fixed(Vec<Expr>),
    Producer {
        len: usize,
        f: Rc<dyn Fn() -> Box<dyn Iterator<Item = Expr>>>,
    },
}

impl EquationSource {
    /// The declared number of equations.
    pub fn len(&self) -> usize {
        match self {
            EquationSource::Fixed(exprs) => exprs.len(),
            EquationSource::Producer { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = Expr> + '_> {
        match self {
            EquationSource::Fixed(exprs) => Box::new(exprs.iter().cloned()),
            EquationSource::Producer { f, .. } => f(),
        }
    }
}

/// A symbolically specified ODE system.
pub struct OdeSystem {
    source: EquationSource,
    /// Helpers in dependency order; a helper only references helpers with
    /// smaller indices.
    helpers: Vec<Expr>,
    n: usize,
    n_params: usize,
    helper_routine: Option<Rc<Routine>>,
    f_routine: Option<Rc<Routine>>,
    jac_routine: Option<Rc<Routine>>,
}

impl OdeSystem {
    /// Creates a system from an equation source.
    ///
    /// `helpers[i]` defines the helper referenced as `Expr::Helper(i)`;
    /// helpers may be declared in any order and are sorted here. Returns a
    /// validation error for cyclic helpers, out-of-range indices, an empty
    /// system or a producer that does not match its declared length.
    pub fn new(
        source: EquationSource,
        helpers: Vec<Expr>,
        n_params: usize,
    ) -> Result<Self, Error> {
        let (helpers, map) = sort_helpers(helpers)?;
        let source = remap_source(source, &map);

        let system = Self {
            n: source.len(),
            source,
            helpers,
            n_params,
            helper_routine: None,
            f_routine: None,
            jac_routine: None,
        };
        system.check()?;
        Ok(system)
    }

    /// Creates a system from equation strings.
    ///
    /// `equations[i]` is the right-hand side of the state named
    /// `states[i]`; helpers are `(name, definition)` pairs and may
    /// reference states, parameters, `t` and each other (acyclically).
    pub fn from_strings(
        equations: &[&str],
        states: &[&str],
        params: &[&str],
        helpers: &[(&str, &str)],
    ) -> Result<Self, Error> {
        if equations.len() != states.len() {
            return Err(ValidationError::LengthMismatch {
                declared: states.len(),
                got: equations.len(),
            }
            .into());
        }

        let helper_names: Vec<&str> = helpers.iter().map(|(name, _)| *name).collect();
        let table = SymbolTable::new(states, params, &helper_names)?;

        let helper_exprs = helpers
            .iter()
            .map(|(_, definition)| parse_expression(definition, &table))
            .collect::<Result<Vec<_>, _>>()?;
        let equation_exprs = equations
            .iter()
            .map(|equation| parse_expression(equation, &table))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(
            EquationSource::Fixed(equation_exprs),
            helper_exprs,
            params.len(),
        )
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub(crate) fn source(&self) -> &EquationSource {
        &self.source
    }

    pub(crate) fn helpers(&self) -> &[Expr] {
        &self.helpers
    }

    /// Validates every index the equations and helpers reference.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.n == 0 {
            return Err(ValidationError::EmptySystem);
        }

        let mut count = 0;
        for expr in self.source.iter() {
            self.check_expr(&expr)?;
            count += 1;
        }
        if count != self.n {
            return Err(ValidationError::LengthMismatch {
                declared: self.n,
                got: count,
            });
        }

        for helper in &self.helpers {
            self.check_expr(helper)?;
        }
        Ok(())
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), ValidationError> {
        let mut error = None;
        expr.visit(&mut |sub| {
            if error.is_some() {
                return;
            }
            error = match sub {
                Expr::State(i) if *i >= self.n => Some(ValidationError::StateIndexOutOfRange {
                    index: *i,
                    n: self.n,
                }),
                Expr::Param(i) if *i >= self.n_params => {
                    Some(ValidationError::ParamIndexOutOfRange {
                        index: *i,
                        count: self.n_params,
                    })
                }
                Expr::Helper(k) if *k >= self.helpers.len() => {
                    Some(ValidationError::HelperIndexOutOfRange {
                        index: *k,
                        count: self.helpers.len(),
                    })
                }
                _ => None,
            };
        });
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Generates the helper routine. No-op when cached or when the system
    /// has no helpers.
    pub fn generate_helpers(&mut self, options: &EmitOptions) {
        if self.helper_routine.is_some() || self.helpers.is_empty() {
            return;
        }
        debug!("generating helper routine ({} helpers)", self.helpers.len());
        let instrs = self
            .helpers
            .iter()
            .enumerate()
            .map(|(k, expr)| Instr {
                target: Target::Helper(k),
                expr: expr.clone(),
            })
            .collect();
        self.helper_routine = Some(Rc::new(build_routine("helpers", instrs, options)));
    }

    /// Generates the derivative routine. No-op when cached.
    pub fn generate_f(&mut self, options: &EmitOptions) {
        if self.f_routine.is_some() {
            return;
        }
        debug!("generating derivative routine (n = {})", self.n);
        let instrs = self
            .source
            .iter()
            .enumerate()
            .map(|(i, expr)| Instr {
                target: Target::Out(i),
                expr,
            })
            .collect();
        self.f_routine = Some(Rc::new(build_routine("f", instrs, options)));
    }

    /// Generates the Jacobian routine. No-op when cached.
    ///
    /// The output is the row-major flattened matrix; with `sparse` set,
    /// statically zero entries produce no instruction at all, so callers
    /// must clear the output array before each evaluation.
    pub fn generate_jac(&mut self, options: &EmitOptions) {
        if self.jac_routine.is_some() {
            return;
        }
        debug!("generating Jacobian routine (n = {})", self.n);
        let instrs = self.jacobian_instructions(options);
        // entries are already simplified by the Jacobian engine
        let options = EmitOptions {
            simplify: false,
            ..*options
        };
        self.jac_routine = Some(Rc::new(build_routine("jac", instrs, &options)));
    }

    /// Builds the Jacobian instruction batch, skipping statically zero
    /// entries when `sparse` is set.
    fn jacobian_instructions(&self, options: &EmitOptions) -> Vec<Instr> {
        let jacobian = Jacobian::new(&self.helpers, self.n, options.simplify);
        let mut instrs = Vec::new();
        for (i, f_i) in self.source.iter().enumerate() {
            for (j, entry) in jacobian.row(&f_i).enumerate() {
                if options.sparse && entry.is_zero() {
                    continue;
                }
                instrs.push(Instr {
                    target: Target::Out(i * self.n + j),
                    expr: entry,
                });
            }
        }
        instrs
    }

    /// Generates any missing stage with default options and assembles the
    /// compiled artifact. The Jacobian stage is only generated (or
    /// included) when `wants_jacobian` is set.
    pub fn compile(&mut self, wants_jacobian: bool) -> Result<Rc<CompiledOde>, Error> {
        let options = EmitOptions::default();
        self.generate_helpers(&options);
        self.generate_f(&options);
        if wants_jacobian {
            self.generate_jac(&options);
        }

        Ok(Rc::new(CompiledOde {
            n: self.n,
            n_params: self.n_params,
            helpers: self.helper_routine.clone(),
            f: self.f_routine.clone().ok_or(ValidationError::EmptySystem)?,
            jac: if wants_jacobian {
                self.jac_routine.clone()
            } else {
                None
            },
            gh: RefCell::new(vec![0.0; self.helpers.len()]),
        }))
    }
}

/// A fully generated system, ready for evaluation by an integrator.
pub struct CompiledOde {
    n: usize,
    n_params: usize,
    helpers: Option<Rc<Routine>>,
    f: Rc<Routine>,
    jac: Option<Rc<Routine>>,
    gh: RefCell<Vec<f64>>,
}

impl CompiledOde {
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn has_jacobian(&self) -> bool {
        self.jac.is_some()
    }

    /// Evaluates the derivative into `dy`, refreshing helpers first.
    pub fn eval_f(&self, t: f64, y: &[f64], p: &[f64], dy: &mut [f64]) {
        let mut gh = self.gh.borrow_mut();
        let mut empty: [f64; 0] = [];
        if let Some(helpers) = &self.helpers {
            helpers.call(t, y, p, &mut gh, &mut empty);
        }
        self.f.call(t, y, p, &mut gh, dy);
    }

    /// Evaluates the Jacobian into the row-major `out` (length `n * n`),
    /// refreshing helpers first. Entries the sparse emission omitted stay
    /// at the zero this method writes.
    ///
    /// Returns false when no Jacobian routine was generated.
    pub fn eval_jac(&self, t: f64, y: &[f64], p: &[f64], out: &mut [f64]) -> bool {
        let Some(jac) = &self.jac else {
            return false;
        };
        let mut gh = self.gh.borrow_mut();
        let mut empty: [f64; 0] = [];
        if let Some(helpers) = &self.helpers {
            helpers.call(t, y, p, &mut gh, &mut empty);
        }
        out.fill(0.0);
        jac.call(t, y, p, &mut gh, out);
        true
    }
}

/// Brings helpers into dependency order.
///
/// Returns the sorted helper definitions (with all `Helper` references
/// rewritten to the new indices) and the old-to-new index map.
fn sort_helpers(helpers: Vec<Expr>) -> Result<(Vec<Expr>, Vec<usize>), ValidationError> {
    let count = helpers.len();

    let mut references: Vec<Vec<usize>> = Vec::with_capacity(count);
    for helper in &helpers {
        let mut refs = Vec::new();
        helper.visit(&mut |sub| {
            if let Expr::Helper(j) = sub {
                refs.push(*j);
            }
        });
        for &j in &refs {
            if j >= count {
                return Err(ValidationError::HelperIndexOutOfRange { index: j, count });
            }
        }
        references.push(refs);
    }

    // Kahn's algorithm over "references" edges
    let mut placed = vec![false; count];
    let mut order = Vec::with_capacity(count);
    while order.len() < count {
        let ready = (0..count).find(|&k| {
            !placed[k] && references[k].iter().all(|&j| placed[j])
        });
        match ready {
            Some(k) => {
                placed[k] = true;
                order.push(k);
            }
            None => {
                let stuck = (0..count).find(|&k| !placed[k]).unwrap();
                return Err(ValidationError::HelperCycle(stuck));
            }
        }
    }

    let mut map = vec![0; count];
    for (new, &old) in order.iter().enumerate() {
        map[old] = new;
    }
    let sorted = order
        .iter()
        .map(|&old| helpers[old].remap_helpers(&map))
        .collect();
    Ok((sorted, map))
}

/// Rewrites helper references in a source through the index map.
fn remap_source(source: EquationSource, map: &[usize]) -> EquationSource {
    if map.iter().enumerate().all(|(old, &new)| old == new) {
        return source;
    }
    match source {
        EquationSource::Fixed(exprs) => EquationSource::Fixed(
            exprs.iter().map(|e| e.remap_helpers(map)).collect(),
        ),
        EquationSource::Producer { len, f } => {
            let map = Rc::new(map.to_vec());
            EquationSource::Producer {
                len,
                f: Rc::new(move || {
                    let map = Rc::clone(&map);
                    Box::new(f().map(move |e| e.remap_helpers(&map)))
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn y(i: usize) -> Expr {
        Expr::State(i)
    }

    #[test]
    fn from_strings_builds_and_evaluates() {
        // damped harmonic oscillator with a helper for the restoring force
        let mut system = OdeSystem::from_strings(
            &["v", "force - 0.1*v"],
            &["x", "v"],
            &["omega"],
            &[("force", "-omega^2 * x")],
        )
        .unwrap();

        let compiled = system.compile(false).unwrap();
        let mut dy = [0.0, 0.0];
        compiled.eval_f(0.0, &[1.0, 2.0], &[3.0], &mut dy);
        assert_relative_eq!(dy[0], 2.0);
        assert_relative_eq!(dy[1], -9.0 - 0.2, max_relative = 1e-12);
    }

    #[test]
    fn helpers_are_sorted_into_dependency_order() {
        // declared backwards: helper 0 references helper 1
        let helpers = vec![Expr::mul(Expr::Helper(1), y(0)), Expr::mul(y(0), y(1))];
        let source = EquationSource::Fixed(vec![Expr::Helper(0), y(0)]);
        let mut system = OdeSystem::new(source, helpers, 0).unwrap();

        // helper(1)*y0 with helper(1) = y0*y1 substitutes to y0^2 * y1
        let compiled = system.compile(false).unwrap();
        let mut dy = [0.0, 0.0];
        compiled.eval_f(0.0, &[2.0, 3.0], &[], &mut dy);
        assert_relative_eq!(dy[0], 12.0);
    }

    #[test]
    fn cyclic_helpers_are_rejected() {
        let helpers = vec![Expr::mul(Expr::Helper(1), y(0)), Expr::Helper(0)];
        let source = EquationSource::Fixed(vec![y(0), y(1)]);
        let Err(err) = OdeSystem::new(source, helpers, 0) else {
            panic!("cyclic helpers were accepted");
        };
        assert!(matches!(
            err,
            Error::Validation(ValidationError::HelperCycle(_))
        ));
    }

    #[test]
    fn out_of_range_state_index_is_rejected() {
        let source = EquationSource::Fixed(vec![y(5)]);
        let Err(err) = OdeSystem::new(source, Vec::new(), 0) else {
            panic!("out-of-range state index was accepted");
        };
        assert!(matches!(
            err,
            Error::Validation(ValidationError::StateIndexOutOfRange { index: 5, n: 1 })
        ));
    }

    #[test]
    fn empty_system_is_rejected() {
        let Err(err) = OdeSystem::new(EquationSource::Fixed(Vec::new()), Vec::new(), 0) else {
            panic!("empty system was accepted");
        };
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EmptySystem)
        ));
    }

    #[test]
    fn producer_length_mismatch_is_rejected() {
        let source = EquationSource::Producer {
            len: 3,
            f: Rc::new(|| Box::new(vec![Expr::State(0), Expr::State(1)].into_iter())),
        };
        let Err(err) = OdeSystem::new(source, Vec::new(), 0) else {
            panic!("length mismatch was accepted");
        };
        assert!(matches!(
            err,
            Error::Validation(ValidationError::LengthMismatch {
                declared: 3,
                got: 2
            })
        ));
    }

    #[test]
    fn jacobian_evaluation_zeroes_omitted_entries() {
        // f0 = y1, f1 = -y0: the diagonal is statically zero
        let source = EquationSource::Fixed(vec![y(1), Expr::neg(y(0))]);
        let mut system = OdeSystem::new(source, Vec::new(), 0).unwrap();
        let compiled = system.compile(true).unwrap();

        let mut out = [f64::NAN; 4];
        assert!(compiled.eval_jac(0.0, &[1.0, 2.0], &[], &mut out));
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[1], 1.0);
        assert_relative_eq!(out[2], -1.0);
        assert_relative_eq!(out[3], 0.0);
    }

    #[test]
    fn sparse_jacobian_batch_is_a_subset_of_the_dense_one() {
        // f0 = y1, f1 = -y0: the diagonal is statically zero
        let source = EquationSource::Fixed(vec![y(1), Expr::neg(y(0))]);
        let system = OdeSystem::new(source, Vec::new(), 0).unwrap();

        let dense = system.jacobian_instructions(&EmitOptions {
            sparse: false,
            ..Default::default()
        });
        let sparse = system.jacobian_instructions(&EmitOptions {
            sparse: true,
            ..Default::default()
        });

        assert_eq!(dense.len(), 4);
        assert_eq!(sparse.len(), 2);

        // every sparse instruction appears unchanged in the dense batch
        for instr in &sparse {
            assert!(dense
                .iter()
                .any(|d| d.target == instr.target && d.expr == instr.expr));
        }
        // and the omitted entries are exactly the statically zero ones
        let kept: Vec<Target> = sparse.iter().map(|i| i.target).collect();
        for instr in &dense {
            if !kept.contains(&instr.target) {
                assert!(instr.expr.is_zero());
            }
        }
    }

    #[test]
    fn jacobian_uses_helper_chain_rule() {
        // helper = y0*y1; f0 = helper + y0 substitutes to y0*y1 + y0
        let helpers = vec![Expr::mul(y(0), y(1))];
        let source = EquationSource::Fixed(vec![
            Expr::add(Expr::Helper(0), y(0)),
            Expr::mul(Expr::Helper(0), y(1)),
        ]);
        let mut system = OdeSystem::new(source, helpers, 0).unwrap();
        let compiled = system.compile(true).unwrap();

        let yv = [1.5, -2.0];
        let mut out = [0.0; 4];
        assert!(compiled.eval_jac(0.0, &yv, &[], &mut out));
        // df0/dy0 = y1 + 1, df0/dy1 = y0
        assert_relative_eq!(out[0], yv[1] + 1.0, max_relative = 1e-12);
        assert_relative_eq!(out[1], yv[0], max_relative = 1e-12);
        // f1 = y0*y1^2: df1/dy0 = y1^2, df1/dy1 = 2*y0*y1
        assert_relative_eq!(out[2], yv[1] * yv[1], max_relative = 1e-12);
        assert_relative_eq!(out[3], 2.0 * yv[0] * yv[1], max_relative = 1e-12);
    }

    #[test]
    fn stage_generation_is_idempotent() {
        let source = EquationSource::Fixed(vec![Expr::neg(y(0))]);
        let mut system = OdeSystem::new(source, Vec::new(), 0).unwrap();
        let options = EmitOptions::default();

        system.generate_f(&options);
        let first = Rc::as_ptr(system.f_routine.as_ref().unwrap());
        system.generate_f(&options);
        let second = Rc::as_ptr(system.f_routine.as_ref().unwrap());
        assert_eq!(first, second);
    }
}
