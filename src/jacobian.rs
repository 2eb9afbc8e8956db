//! Helper-aware symbolic Jacobians.
//!
//! Helpers may depend on state components and on earlier helpers, so the
//! entry `∂f_i/∂y_j` needs chain-rule contributions through every helper
//! that (directly or transitively) depends on `y_j`. A single forward
//! pass over the dependency-ordered helper list computes, per state
//! index, each helper's total derivative; rows and entries are then
//! produced lazily so callers can stream them into emission batches
//! without materializing the full matrix.

use std::rc::Rc;

use crate::expr::{Expr, Wrt};

/// For each state index `j`, the helpers whose total derivative with
/// respect to `y(j)` is not structurally zero, with that derivative.
type DependentHelpers = Vec<Vec<(usize, Expr)>>;

/// Computes the dependent-helper annotation in one forward pass.
///
/// `helpers` must be in dependency order: a helper may only reference
/// helpers with smaller indices, which is what lets a single pass
/// accumulate total derivatives.
pub(crate) fn dependent_helpers(helpers: &[Expr], n: usize) -> DependentHelpers {
    let mut deps: DependentHelpers = vec![Vec::new(); n];
    for (j, deps_j) in deps.iter_mut().enumerate() {
        for (k, helper) in helpers.iter().enumerate() {
            let mut derivative = helper.derivative(Wrt::State(j));
            for (earlier, total) in deps_j.iter() {
                derivative = Expr::add(
                    derivative,
                    Expr::mul(helper.derivative(Wrt::Helper(*earlier)), total.clone()),
                );
            }
            if !derivative.is_zero() {
                deps_j.push((k, derivative));
            }
        }
    }
    deps
}

/// Lazy helper-aware Jacobian over a system of dimension `n`.
#[derive(Clone)]
pub(crate) struct Jacobian {
    deps: Rc<DependentHelpers>,
    n: usize,
    simplify: bool,
}

impl Jacobian {
    pub fn new(helpers: &[Expr], n: usize, simplify: bool) -> Self {
        Self {
            deps: Rc::new(dependent_helpers(helpers, n)),
            n,
            simplify,
        }
    }

    /// The entry `∂f_i/∂y_j` for the given right-hand side component.
    pub fn entry(&self, f_i: &Expr, j: usize) -> Expr {
        let mut entry = f_i.derivative(Wrt::State(j));
        for (k, total) in &self.deps[j] {
            entry = Expr::add(
                entry,
                Expr::mul(f_i.derivative(Wrt::Helper(*k)), total.clone()),
            );
        }
        if self.simplify {
            entry.simplify_bounded()
        } else {
            entry
        }
    }

    /// Lazily yields the row for one right-hand side component.
    pub fn row<'a>(&'a self, f_i: &'a Expr) -> impl Iterator<Item = Expr> + 'a {
        (0..self.n).map(move |j| self.entry(f_i, j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn y(i: usize) -> Expr {
        Expr::State(i)
    }

    /// Evaluates the helper array at a state, in dependency order.
    fn helper_values(helpers: &[Expr], t: f64, yv: &[f64]) -> Vec<f64> {
        let mut gh = Vec::with_capacity(helpers.len());
        for h in helpers {
            let v = h.eval(t, yv, &[], &gh, &[]);
            gh.push(v);
        }
        gh
    }

    #[test]
    fn entries_without_helpers_are_plain_derivatives() {
        let jac = Jacobian::new(&[], 2, false);
        // f0 = y0 * y1
        let f0 = Expr::mul(y(0), y(1));
        assert_eq!(jac.entry(&f0, 0).simplify(), y(1));
        assert_eq!(jac.entry(&f0, 1).simplify(), y(0));
    }

    #[test]
    fn single_helper_contributes_chain_rule_term() {
        // helper(0) = y0 * y1; f0 = helper(0) + y0
        // direct substitution gives f0 = y0*y1 + y0, so df0/dy0 = y1 + 1
        let helpers = vec![Expr::mul(y(0), y(1))];
        let jac = Jacobian::new(&helpers, 2, false);
        let f0 = Expr::add(Expr::Helper(0), y(0));

        let yv = [1.7, -0.4];
        let gh = helper_values(&helpers, 0.0, &yv);
        let entry = jac.entry(&f0, 0);
        assert_relative_eq!(entry.eval(0.0, &yv, &[], &gh, &[]), yv[1] + 1.0);
    }

    #[test]
    fn nested_helpers_accumulate_transitively() {
        // helper(0) = y0^2, helper(1) = helper(0) * y1
        // f0 = helper(1) substitutes to y0^2 * y1, so df0/dy0 = 2 y0 y1
        let helpers = vec![
            Expr::Pow(Box::new(y(0)), 2),
            Expr::mul(Expr::Helper(0), y(1)),
        ];
        let jac = Jacobian::new(&helpers, 2, false);
        let f0 = Expr::Helper(1);

        let yv = [1.3, 2.5];
        let gh = helper_values(&helpers, 0.0, &yv);
        let d_dy0 = jac.entry(&f0, 0);
        let d_dy1 = jac.entry(&f0, 1);
        assert_relative_eq!(
            d_dy0.eval(0.0, &yv, &[], &gh, &[]),
            2.0 * yv[0] * yv[1],
            max_relative = 1e-12
        );
        assert_relative_eq!(
            d_dy1.eval(0.0, &yv, &[], &gh, &[]),
            yv[0] * yv[0],
            max_relative = 1e-12
        );
    }

    #[test]
    fn annotation_skips_state_independent_helpers() {
        // helper(0) = t * par(0) never depends on the state
        let helpers = vec![Expr::mul(Expr::Time, Expr::Param(0))];
        let deps = dependent_helpers(&helpers, 3);
        assert!(deps.iter().all(|d| d.is_empty()));
    }

    #[test]
    fn rows_are_lazy_and_complete() {
        let helpers = vec![Expr::mul(y(0), y(1))];
        let jac = Jacobian::new(&helpers, 2, true);
        let f0 = Expr::mul(Expr::Helper(0), y(1));

        let row: Vec<Expr> = jac.row(&f0).collect();
        assert_eq!(row.len(), 2);

        // f0 substitutes to y0 * y1^2
        let yv = [0.9, 1.4];
        let gh = helper_values(&helpers, 0.0, &yv);
        assert_relative_eq!(
            row[0].eval(0.0, &yv, &[], &gh, &[]),
            yv[1] * yv[1],
            max_relative = 1e-12
        );
        assert_relative_eq!(
            row[1].eval(0.0, &yv, &[], &gh, &[]),
            2.0 * yv[0] * yv[1],
            max_relative = 1e-12
        );
    }
}
