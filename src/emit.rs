//! The code emission pipeline: instruction batches, common-subexpression
//! extraction, chunking and the interpreted fallback.
//!
//! A generation stage produces a flat batch of instructions, each writing
//! one expression to one slot. The pipeline optionally rewrites the batch
//! with a CSE pre-pass, splits it into chunks of bounded size and hands
//! the chunks to the Cranelift builder. When JIT compilation fails the
//! same batch is kept as an interpreted routine, so a system remains
//! usable on hosts the code generator cannot target.

use std::cell::RefCell;
use std::collections::HashMap;

use itertools::Itertools;
use log::warn;

use crate::builder::{self, CompiledRoutine};
use crate::expr::{Expr, Leaf};

/// Where an instruction writes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Slot `i` of the general helper array, shared across routines.
    Helper(usize),
    /// Slot `i` of the per-routine CSE scratch array.
    Aux(usize),
    /// Component `i` of the output array (derivative component or
    /// flattened Jacobian entry).
    Out(usize),
}

impl Target {
    /// Drops any cached load of the slot this target just overwrote.
    pub(crate) fn invalidate(&self, cache: &mut HashMap<Leaf, cranelift_codegen::ir::Value>) {
        match self {
            Target::Helper(i) => {
                cache.remove(&Leaf::Helper(*i));
            }
            Target::Aux(i) => {
                cache.remove(&Leaf::Cse(*i));
            }
            // output slots are never read back
            Target::Out(_) => {}
        }
    }
}

/// One instruction of a batch: evaluate `expr`, write it to `target`.
#[derive(Debug, Clone)]
pub struct Instr {
    pub target: Target,
    pub expr: Expr,
}

/// Per-stage emission options.
///
/// `chunk_size` bounds the number of instructions compiled into one
/// function; any value below one disables chunking. `sparse` is consumed
/// by the Jacobian stage, which omits statically zero entries from the
/// batch it builds.
#[derive(Debug, Clone, Copy)]
pub struct EmitOptions {
    pub simplify: bool,
    pub do_cse: bool,
    pub chunk_size: isize,
    pub sparse: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            simplify: true,
            do_cse: false,
            chunk_size: 100,
            sparse: true,
        }
    }
}

/// Extracts repeated non-leaf subexpressions into CSE slots.
///
/// Candidates are extracted smallest-first. Each extraction introduces an
/// `Aux` instruction ahead of the batch and replaces every occurrence of
/// the pattern, including occurrences inside previously extracted
/// definitions. Because a later pattern is never smaller than an earlier
/// one, no definition can reference a slot defined after it, so the aux
/// instructions are valid in extraction order.
///
/// Returns the rewritten batch and the number of CSE slots it uses.
pub(crate) fn extract_common_subexpressions(instrs: Vec<Instr>) -> (Vec<Instr>, usize) {
    let mut aux_defs: Vec<Instr> = Vec::new();
    let mut body = instrs;

    loop {
        // count occurrences of every non-leaf subexpression, keyed by the
        // canonical notation so structurally equal trees collide
        let mut counts: HashMap<String, (Expr, usize)> = HashMap::new();
        let all = aux_defs.iter().chain(body.iter());
        for instr in all {
            instr.expr.visit(&mut |sub| {
                if !sub.is_leaf() {
                    counts
                        .entry(sub.to_string())
                        .and_modify(|(_, c)| *c += 1)
                        .or_insert_with(|| (sub.clone(), 1));
                }
            });
        }

        let candidate = counts
            .into_iter()
            .filter(|(_, (_, count))| *count >= 2)
            .map(|(key, (expr, _))| (expr.size(), key, expr))
            .min_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let Some((_, _, pattern)) = candidate else {
            break;
        };

        let slot = Expr::Cse(aux_defs.len());
        for instr in aux_defs.iter_mut().chain(body.iter_mut()) {
            instr.expr = instr.expr.replace_equal(&pattern, &slot);
        }
        aux_defs.push(Instr {
            target: Target::Aux(aux_defs.len()),
            expr: pattern,
        });
    }

    let n_aux = aux_defs.len();
    aux_defs.extend(body);
    (aux_defs, n_aux)
}

/// Splits a batch into contiguous chunks of at most `chunk_size`
/// instructions, preserving order. A `chunk_size` below one yields a
/// single chunk.
pub(crate) fn chunk_instructions(instrs: Vec<Instr>, chunk_size: isize) -> Vec<Vec<Instr>> {
    if instrs.is_empty() {
        return Vec::new();
    }
    if chunk_size < 1 {
        return vec![instrs];
    }
    let groups = instrs.into_iter().chunks(chunk_size as usize);
    groups.into_iter().map(|chunk| chunk.collect()).collect()
}

/// A batch executed by direct expression evaluation.
pub(crate) struct InterpretedRoutine {
    instrs: Vec<Instr>,
    aux: RefCell<Vec<f64>>,
}

impl InterpretedRoutine {
    pub fn new(instrs: Vec<Instr>, n_aux: usize) -> Self {
        Self {
            instrs,
            aux: RefCell::new(vec![0.0; n_aux]),
        }
    }

    pub fn call(&self, t: f64, y: &[f64], p: &[f64], gh: &mut [f64], out: &mut [f64]) {
        let mut aux = self.aux.borrow_mut();
        for instr in &self.instrs {
            let value = instr.expr.eval(t, y, p, gh, &aux);
            match instr.target {
                Target::Helper(i) => gh[i] = value,
                Target::Aux(i) => aux[i] = value,
                Target::Out(i) => out[i] = value,
            }
        }
    }
}

/// A generated routine, either native or interpreted.
pub(crate) enum Routine {
    Jit(CompiledRoutine),
    Interpreted(InterpretedRoutine),
}

impl Routine {
    pub fn call(&self, t: f64, y: &[f64], p: &[f64], gh: &mut [f64], out: &mut [f64]) {
        match self {
            Routine::Jit(routine) => routine.call(t, y, p, gh, out),
            Routine::Interpreted(routine) => routine.call(t, y, p, gh, out),
        }
    }
}

/// Runs a batch through the full pipeline: per-instruction bounded
/// simplification, optional CSE, chunking and compilation. Falls back to
/// interpretation when the JIT backend reports an error.
pub(crate) fn build_routine(name: &str, mut instrs: Vec<Instr>, options: &EmitOptions) -> Routine {
    if options.simplify {
        for instr in &mut instrs {
            instr.expr = instr.expr.simplify_bounded();
        }
    }

    let (instrs, n_aux) = if options.do_cse {
        extract_common_subexpressions(instrs)
    } else {
        (instrs, 0)
    };

    let chunks = chunk_instructions(instrs.clone(), options.chunk_size);
    match builder::compile_batch(name, &chunks, n_aux) {
        Ok(compiled) => Routine::Jit(compiled),
        Err(e) => {
            warn!("JIT compilation of {name:?} failed ({e}); falling back to interpretation");
            Routine::Interpreted(InterpretedRoutine::new(instrs, n_aux))
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

    fn out(i: usize, expr: Expr) -> Instr {
        Instr {
            target: Target::Out(i),
            expr,
        }
    }

    #[test]
    fn chunking_preserves_order_and_bounds_size() {
        let instrs: Vec<Instr> = (0..25).map(|i| out(i, Expr::Const(i as f64))).collect();
        let chunks = chunk_instructions(instrs, 10);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));

        let flattened: Vec<usize> = chunks
            .iter()
            .flatten()
            .map(|instr| match instr.target {
                Target::Out(i) => i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(flattened, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn chunk_size_below_one_disables_chunking() {
        let instrs: Vec<Instr> = (0..25).map(|i| out(i, Expr::Const(0.0))).collect();
        assert_eq!(chunk_instructions(instrs.clone(), 0).len(), 1);
        assert_eq!(chunk_instructions(instrs, -1).len(), 1);
    }

    #[test]
    fn cse_extracts_repeated_subexpressions() {
        // y0*y1 occurs three times across two instructions
        let shared = Expr::mul(y(0), y(1));
        let instrs = vec![
            out(0, Expr::add(shared.clone(), Expr::Exp(Box::new(shared.clone())))),
            out(1, Expr::mul(shared.clone(), y(2))),
        ];
        let (rewritten, n_aux) = extract_common_subexpressions(instrs);

        assert!(n_aux >= 1);
        assert_eq!(rewritten[0].target, Target::Aux(0));
        assert_eq!(rewritten[0].expr, shared);
        // no instruction still contains the extracted pattern
        for instr in &rewritten[1..] {
            let mut found = false;
            instr.expr.visit(&mut |sub| found |= *sub == shared);
            assert!(!found);
        }
    }

    #[test]
    fn cse_definitions_only_reference_earlier_slots() {
        let inner = Expr::mul(y(0), y(1));
        let outer = Expr::add(inner.clone(), Expr::Time);
        let instrs = vec![
            out(0, Expr::add(outer.clone(), inner.clone())),
            out(1, Expr::mul(outer.clone(), inner.clone())),
        ];
        let (rewritten, n_aux) = extract_common_subexpressions(instrs);

        for (pos, instr) in rewritten[..n_aux].iter().enumerate() {
            assert_eq!(instr.target, Target::Aux(pos));
            instr.expr.visit(&mut |sub| {
                if let Expr::Cse(slot) = sub {
                    assert!(*slot < pos, "cse({slot}) referenced before definition");
                }
            });
        }
    }

    #[test]
    fn interpreted_routine_matches_direct_evaluation() {
        let shared = Expr::mul(y(0), y(1));
        let exprs = vec![
            Expr::add(shared.clone(), Expr::Exp(Box::new(shared.clone()))),
            Expr::mul(shared.clone(), Expr::Param(0)),
        ];
        let instrs: Vec<Instr> = exprs
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, e)| out(i, e))
            .collect();
        let (rewritten, n_aux) = extract_common_subexpressions(instrs);
        let routine = InterpretedRoutine::new(rewritten, n_aux);

        let (t, y_vals, p) = (0.5, [2.0, 3.0], [7.0]);
        let mut gh: [f64; 0] = [];
        let mut result = [0.0, 0.0];
        routine.call(t, &y_vals, &p, &mut gh, &mut result);

        for (got, expr) in result.iter().zip(&exprs) {
            assert_relative_eq!(*got, expr.eval(t, &y_vals, &p, &[], &[]));
        }
    }
}
