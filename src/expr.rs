//! Expression trees for the right-hand sides of differential equations.
//!
//! The AST is deliberately small: its leaves are the quantities an ODE
//! right-hand side may legally reference (the time `t`, an indexed state
//! component `y(i)`, a control parameter, a general helper slot, or a
//! CSE slot introduced by the emission pipeline). Every node can be
//!
//! - symbolically differentiated with respect to a state component or a
//!   helper slot (`derivative`),
//! - simplified with a size bound (`simplify_bounded`),
//! - evaluated directly (`eval`), which doubles as the fallback when JIT
//!   compilation is unavailable,
//! - lowered to Cranelift IR (`codegen`).
//!
//! Differentiation applies the usual sum/product/quotient/chain rules and
//! returns trees that are pre-folded through the smart constructors, so a
//! derivative that is structurally zero really is `Const(0.0)`. The
//! Jacobian engine and the sparse emission mode rely on that.

use std::collections::HashMap;

use cranelift::prelude::*;
use cranelift_codegen::ir::{immediates::Offset32, Value};
use cranelift_jit::JITModule;

use crate::errors::BuilderError;
use crate::operators;

/// A differentiation target: one state component or one helper slot.
///
/// Helpers are treated as independent symbols here; the chain-rule
/// contribution of helpers that themselves depend on the state is added by
/// the Jacobian engine, not by `derivative`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrt {
    /// The state component `y(i)`.
    State(usize),
    /// The general helper with the given slot index.
    Helper(usize),
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value.
    Const(f64),
    /// The time `t`.
    Time,
    /// The state component `y(i)`.
    State(usize),
    /// A control parameter, by declaration order.
    Param(usize),
    /// A general helper slot, by dependency order.
    Helper(usize),
    /// A common-subexpression slot local to one emitted routine.
    Cse(usize),
    /// Addition of two expressions.
    Add(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions.
    Sub(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions.
    Mul(Box<Expr>, Box<Expr>),
    /// Division of two expressions.
    Div(Box<Expr>, Box<Expr>),
    /// Negation of an expression.
    Neg(Box<Expr>),
    /// Absolute value of an expression.
    Abs(Box<Expr>),
    /// Exponentiation by an integer constant.
    Pow(Box<Expr>, i64),
    /// Exponentiation by a floating point constant.
    PowFloat(Box<Expr>, f64),
    /// Exponential function.
    Exp(Box<Expr>),
    /// Natural logarithm.
    Ln(Box<Expr>),
    /// Square root.
    Sqrt(Box<Expr>),
    /// Sine (radians).
    Sin(Box<Expr>),
    /// Cosine (radians).
    Cos(Box<Expr>),
}

/// Leaf identity used to cache loads during code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Leaf {
    State(usize),
    Param(usize),
    Helper(usize),
    Cse(usize),
}

/// Argument values of the chunk currently being emitted, plus the load
/// cache. The cache is owned by the emission pipeline and dropped at the
/// end of every chunk.
pub(crate) struct EmitCtx {
    pub t: Value,
    pub y: Value,
    pub p: Value,
    pub gh: Value,
    pub aux: Value,
    pub cache: HashMap<Leaf, Value>,
}

impl Expr {
    /// Smart addition: elides structural zeros and folds constants.
    pub fn add(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x + y),
            (a, b) if a.is_zero() => b,
            (a, b) if b.is_zero() => a,
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        }
    }

    /// Smart subtraction.
    pub fn sub(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x - y),
            (a, b) if b.is_zero() => a,
            (a, b) if a.is_zero() => Expr::neg(b),
            (a, b) => Expr::Sub(Box::new(a), Box::new(b)),
        }
    }

    /// Smart multiplication: annihilates on zero, elides units.
    pub fn mul(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x * y),
            (a, b) if a.is_zero() || b.is_zero() => Expr::Const(0.0),
            (a, b) if a.is_one() => b,
            (a, b) if b.is_one() => a,
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }

    /// Smart division: elides unit denominators, keeps zero numerators.
    pub fn div(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (a, b) if b.is_one() => a,
            (a, _) if a.is_zero() => Expr::Const(0.0),
            (a, b) => Expr::Div(Box::new(a), Box::new(b)),
        }
    }

    /// Smart negation.
    pub fn neg(a: Expr) -> Expr {
        match a {
            Expr::Const(x) => Expr::Const(-x),
            Expr::Neg(inner) => *inner,
            a => Expr::Neg(Box::new(a)),
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(v) if *v == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Const(v) if *v == 1.0)
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(
            self,
            Expr::Const(_)
                | Expr::Time
                | Expr::State(_)
                | Expr::Param(_)
                | Expr::Helper(_)
                | Expr::Cse(_)
        )
    }

    /// Number of nodes in the tree. Used by the bounded simplifier and the
    /// CSE extraction order.
    pub fn size(&self) -> usize {
        match self {
            e if e.is_leaf() => 1,
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) | Expr::Div(l, r) => {
                1 + l.size() + r.size()
            }
            Expr::Neg(e)
            | Expr::Abs(e)
            | Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e) => 1 + e.size(),
            _ => unreachable!(),
        }
    }

    /// Pre-order visit of every node, including `self`.
    pub(crate) fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            e if e.is_leaf() => {}
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) | Expr::Div(l, r) => {
                l.visit(f);
                r.visit(f);
            }
            Expr::Neg(e)
            | Expr::Abs(e)
            | Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Sin(e)
            | Expr::Cos(e) => e.visit(f),
            _ => unreachable!(),
        }
    }

    /// Replaces every subtree equal to `pattern` with `replacement`.
    pub(crate) fn replace_equal(&self, pattern: &Expr, replacement: &Expr) -> Expr {
        if self == pattern {
            return replacement.clone();
        }
        self.map_children(|child| child.replace_equal(pattern, replacement))
    }

    /// Rewrites helper slot indices through `map`. Used when helpers are
    /// brought into dependency order after declaration.
    pub(crate) fn remap_helpers(&self, map: &[usize]) -> Expr {
        if let Expr::Helper(i) = self {
            return Expr::Helper(map[*i]);
        }
        self.map_children(|child| child.remap_helpers(map))
    }

    fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            e if e.is_leaf() => e.clone(),
            Expr::Add(l, r) => Expr::Add(Box::new(f(l)), Box::new(f(r))),
            Expr::Sub(l, r) => Expr::Sub(Box::new(f(l)), Box::new(f(r))),
            Expr::Mul(l, r) => Expr::Mul(Box::new(f(l)), Box::new(f(r))),
            Expr::Div(l, r) => Expr::Div(Box::new(f(l)), Box::new(f(r))),
            Expr::Neg(e) => Expr::Neg(Box::new(f(e))),
            Expr::Abs(e) => Expr::Abs(Box::new(f(e))),
            Expr::Pow(e, n) => Expr::Pow(Box::new(f(e)), *n),
            Expr::PowFloat(e, c) => Expr::PowFloat(Box::new(f(e)), *c),
            Expr::Exp(e) => Expr::Exp(Box::new(f(e))),
            Expr::Ln(e) => Expr::Ln(Box::new(f(e))),
            Expr::Sqrt(e) => Expr::Sqrt(Box::new(f(e))),
            Expr::Sin(e) => Expr::Sin(Box::new(f(e))),
            Expr::Cos(e) => Expr::Cos(Box::new(f(e))),
            _ => unreachable!(),
        }
    }

    /// Computes the symbolic derivative with respect to `wrt`.
    ///
    /// Helpers and state components are independent symbols from the point
    /// of view of this method; `t` and parameters always differentiate to
    /// zero.
    pub fn derivative(&self, wrt: Wrt) -> Expr {
        match self {
            Expr::Const(_) | Expr::Time | Expr::Param(_) | Expr::Cse(_) => Expr::Const(0.0),

            Expr::State(i) => {
                if wrt == Wrt::State(*i) {
                    Expr::Const(1.0)
                } else {
                    Expr::Const(0.0)
                }
            }

            Expr::Helper(k) => {
                if wrt == Wrt::Helper(*k) {
                    Expr::Const(1.0)
                } else {
                    Expr::Const(0.0)
                }
            }

            // d(f + g) = df + dg
            Expr::Add(l, r) => Expr::add(l.derivative(wrt), r.derivative(wrt)),

            // d(f - g) = df - dg
            Expr::Sub(l, r) => Expr::sub(l.derivative(wrt), r.derivative(wrt)),

            // d(f * g) = f dg + g df
            Expr::Mul(l, r) => Expr::add(
                Expr::mul((**l).clone(), r.derivative(wrt)),
                Expr::mul((**r).clone(), l.derivative(wrt)),
            ),

            // d(f / g) = (g df - f dg) / g^2
            Expr::Div(l, r) => {
                let num = Expr::sub(
                    Expr::mul((**r).clone(), l.derivative(wrt)),
                    Expr::mul((**l).clone(), r.derivative(wrt)),
                );
                Expr::div(num, Expr::Pow(r.clone(), 2))
            }

            Expr::Neg(e) => Expr::neg(e.derivative(wrt)),

            // d|f| = f/|f| df
            Expr::Abs(e) => Expr::mul(
                Expr::div((**e).clone(), Expr::Abs(e.clone())),
                e.derivative(wrt),
            ),

            // d(f^n) = n f^(n-1) df
            Expr::Pow(base, n) => Expr::mul(
                Expr::mul(Expr::Const(*n as f64), Expr::Pow(base.clone(), n - 1)),
                base.derivative(wrt),
            ),

            // d(f^c) = c f^(c-1) df
            Expr::PowFloat(base, c) => Expr::mul(
                Expr::mul(Expr::Const(*c), Expr::PowFloat(base.clone(), c - 1.0)),
                base.derivative(wrt),
            ),

            // d(e^f) = e^f df
            Expr::Exp(e) => Expr::mul(Expr::Exp(e.clone()), e.derivative(wrt)),

            // d(ln f) = df / f
            Expr::Ln(e) => Expr::div(e.derivative(wrt), (**e).clone()),

            // d(sqrt f) = df / (2 sqrt f)
            Expr::Sqrt(e) => Expr::div(
                e.derivative(wrt),
                Expr::mul(Expr::Const(2.0), Expr::Sqrt(e.clone())),
            ),

            // d(sin f) = cos f df
            Expr::Sin(e) => Expr::mul(Expr::Cos(e.clone()), e.derivative(wrt)),

            // d(cos f) = -sin f df
            Expr::Cos(e) => Expr::mul(Expr::neg(Expr::Sin(e.clone())), e.derivative(wrt)),
        }
    }

    /// Simplifies the tree by constant folding and basic algebraic rules.
    ///
    /// Deliberately conservative: every rule either shrinks the tree or
    /// keeps its size, so repeated application terminates.
    pub fn simplify(&self) -> Expr {
        match self {
            e if e.is_leaf() => e.clone(),

            Expr::Add(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a + b),
                    (e, z) | (z, e) if z.is_zero() => e.clone(),
                    // c1*x + c2*x -> (c1+c2)*x
                    (Expr::Mul(a1, x1), Expr::Mul(a2, x2)) if x1 == x2 => Expr::mul(
                        Expr::add((**a1).clone(), (**a2).clone()).simplify(),
                        (**x1).clone(),
                    ),
                    _ => Expr::Add(Box::new(l), Box::new(r)),
                }
            }

            Expr::Sub(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a - b),
                    (e, z) if z.is_zero() => e.clone(),
                    (z, e) if z.is_zero() => Expr::neg(e.clone()),
                    (a, b) if a == b => Expr::Const(0.0),
                    _ => Expr::Sub(Box::new(l), Box::new(r)),
                }
            }

            Expr::Mul(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                if l == r {
                    return Expr::Pow(Box::new(l), 2);
                }
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) => Expr::Const(a * b),
                    (z, _) | (_, z) if z.is_zero() => Expr::Const(0.0),
                    (o, e) | (e, o) if o.is_one() => e.clone(),
                    (Expr::Const(-1.0), e) | (e, Expr::Const(-1.0)) => Expr::neg(e.clone()),
                    // x^a * x^b -> x^(a+b)
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 + e2)
                    }
                    // (c1 * x) * c2 -> (c1*c2) * x
                    (Expr::Mul(c1, x), c2 @ Expr::Const(_)) if matches!(**c1, Expr::Const(_)) => {
                        Expr::mul(Expr::mul((**c1).clone(), c2.clone()).simplify(), (**x).clone())
                    }
                    _ => Expr::Mul(Box::new(l), Box::new(r)),
                }
            }

            Expr::Div(l, r) => {
                let l = l.simplify();
                let r = r.simplify();
                match (&l, &r) {
                    (Expr::Const(a), Expr::Const(b)) if *b != 0.0 => Expr::Const(a / b),
                    (z, _) if z.is_zero() => Expr::Const(0.0),
                    (e, o) if o.is_one() => e.clone(),
                    (e, Expr::Const(-1.0)) => Expr::neg(e.clone()),
                    (a, b) if a == b => Expr::Const(1.0),
                    // x^a / x^b -> x^(a-b)
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 - e2).simplify()
                    }
                    _ => Expr::Div(Box::new(l), Box::new(r)),
                }
            }

            Expr::Neg(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) => Expr::Const(-a),
                    Expr::Neg(inner) => *inner,
                    e => Expr::Neg(Box::new(e)),
                }
            }

            Expr::Abs(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) => Expr::Const(a.abs()),
                    Expr::Abs(inner) => Expr::Abs(inner),
                    Expr::Neg(inner) => Expr::Abs(inner).simplify(),
                    // even powers are already non-negative
                    Expr::Pow(_, n) if n % 2 == 0 => e,
                    e => Expr::Abs(Box::new(e)),
                }
            }

            Expr::Pow(base, n) => {
                let b = base.simplify();
                match (&b, n) {
                    (_, 0) => Expr::Const(1.0),
                    (e, 1) => e.clone(),
                    (Expr::Const(a), n) => Expr::Const(a.powi(*n as i32)),
                    // (x^a)^b -> x^(a*b)
                    (Expr::Pow(inner, m), n) => Expr::Pow(inner.clone(), m * n),
                    _ => Expr::Pow(Box::new(b), *n),
                }
            }

            Expr::PowFloat(base, c) => {
                let b = base.simplify();
                match (&b, c) {
                    (_, c) if *c == 0.0 => Expr::Const(1.0),
                    (e, c) if *c == 1.0 => e.clone(),
                    (Expr::Const(a), c) => Expr::Const(a.powf(*c)),
                    (_, c) if c.fract() == 0.0 => Expr::Pow(Box::new(b), *c as i64),
                    _ => Expr::PowFloat(Box::new(b), *c),
                }
            }

            Expr::Exp(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) => Expr::Const(a.exp()),
                    Expr::Ln(inner) => *inner,
                    e => Expr::Exp(Box::new(e)),
                }
            }

            Expr::Ln(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) if a > 0.0 => Expr::Const(a.ln()),
                    Expr::Exp(inner) => *inner,
                    e => Expr::Ln(Box::new(e)),
                }
            }

            Expr::Sqrt(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) if a >= 0.0 => Expr::Const(a.sqrt()),
                    Expr::Pow(x, 2) => Expr::Abs(x),
                    e => Expr::Sqrt(Box::new(e)),
                }
            }

            Expr::Sin(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) => Expr::Const(a.sin()),
                    e => Expr::Sin(Box::new(e)),
                }
            }

            Expr::Cos(e) => {
                let e = e.simplify();
                match e {
                    Expr::Const(a) => Expr::Const(a.cos()),
                    e => Expr::Cos(Box::new(e)),
                }
            }

            _ => unreachable!(),
        }
    }

    /// Bounded simplification: the rewritten tree is accepted only when it
    /// does not net increase the node count.
    pub fn simplify_bounded(&self) -> Expr {
        let s = self.simplify();
        if s.size() <= self.size() {
            s
        } else {
            self.clone()
        }
    }

    /// Evaluates the expression directly, without compilation.
    ///
    /// Used by the interpreted fallback routine and by tests.
    pub fn eval(&self, t: f64, y: &[f64], p: &[f64], gh: &[f64], aux: &[f64]) -> f64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Time => t,
            Expr::State(i) => y[*i],
            Expr::Param(i) => p[*i],
            Expr::Helper(i) => gh[*i],
            Expr::Cse(i) => aux[*i],
            Expr::Add(l, r) => l.eval(t, y, p, gh, aux) + r.eval(t, y, p, gh, aux),
            Expr::Sub(l, r) => l.eval(t, y, p, gh, aux) - r.eval(t, y, p, gh, aux),
            Expr::Mul(l, r) => l.eval(t, y, p, gh, aux) * r.eval(t, y, p, gh, aux),
            Expr::Div(l, r) => l.eval(t, y, p, gh, aux) / r.eval(t, y, p, gh, aux),
            Expr::Neg(e) => -e.eval(t, y, p, gh, aux),
            Expr::Abs(e) => e.eval(t, y, p, gh, aux).abs(),
            Expr::Pow(e, n) => e.eval(t, y, p, gh, aux).powi(*n as i32),
            Expr::PowFloat(e, c) => e.eval(t, y, p, gh, aux).powf(*c),
            Expr::Exp(e) => e.eval(t, y, p, gh, aux).exp(),
            Expr::Ln(e) => e.eval(t, y, p, gh, aux).ln(),
            Expr::Sqrt(e) => e.eval(t, y, p, gh, aux).sqrt(),
            Expr::Sin(e) => e.eval(t, y, p, gh, aux).sin(),
            Expr::Cos(e) => e.eval(t, y, p, gh, aux).cos(),
        }
    }

    /// Lowers the expression to Cranelift IR within the chunk described by
    /// `ctx`. Leaf loads are cached in `ctx.cache` for the duration of the
    /// current chunk.
    pub(crate) fn codegen(
        &self,
        builder: &mut FunctionBuilder,
        module: &mut JITModule,
        ctx: &mut EmitCtx,
    ) -> Result<Value, BuilderError> {
        let mem = MemFlags::new();
        Ok(match self {
            Expr::Const(v) => builder.ins().f64const(*v),
            Expr::Time => ctx.t,
            Expr::State(i) => match ctx.cache.get(&Leaf::State(*i)) {
                Some(v) => *v,
                None => {
                    let v = builder
                        .ins()
                        .load(types::F64, mem, ctx.y, Offset32::new((*i * 8) as i32));
                    ctx.cache.insert(Leaf::State(*i), v);
                    v
                }
            },
            Expr::Param(i) => match ctx.cache.get(&Leaf::Param(*i)) {
                Some(v) => *v,
                None => {
                    let v = builder
                        .ins()
                        .load(types::F64, mem, ctx.p, Offset32::new((*i * 8) as i32));
                    ctx.cache.insert(Leaf::Param(*i), v);
                    v
                }
            },
            Expr::Helper(i) => match ctx.cache.get(&Leaf::Helper(*i)) {
                Some(v) => *v,
                None => {
                    let v = builder
                        .ins()
                        .load(types::F64, mem, ctx.gh, Offset32::new((*i * 8) as i32));
                    ctx.cache.insert(Leaf::Helper(*i), v);
                    v
                }
            },
            Expr::Cse(i) => match ctx.cache.get(&Leaf::Cse(*i)) {
                Some(v) => *v,
                None => {
                    let v = builder
                        .ins()
                        .load(types::F64, mem, ctx.aux, Offset32::new((*i * 8) as i32));
                    ctx.cache.insert(Leaf::Cse(*i), v);
                    v
                }
            },
            Expr::Add(l, r) => {
                let l = l.codegen(builder, module, ctx)?;
                let r = r.codegen(builder, module, ctx)?;
                builder.ins().fadd(l, r)
            }
            Expr::Sub(l, r) => {
                let l = l.codegen(builder, module, ctx)?;
                let r = r.codegen(builder, module, ctx)?;
                builder.ins().fsub(l, r)
            }
            Expr::Mul(l, r) => {
                let l = l.codegen(builder, module, ctx)?;
                let r = r.codegen(builder, module, ctx)?;
                builder.ins().fmul(l, r)
            }
            Expr::Div(l, r) => {
                let l = l.codegen(builder, module, ctx)?;
                let r = r.codegen(builder, module, ctx)?;
                builder.ins().fdiv(l, r)
            }
            Expr::Neg(e) => {
                let v = e.codegen(builder, module, ctx)?;
                builder.ins().fneg(v)
            }
            Expr::Abs(e) => {
                let v = e.codegen(builder, module, ctx)?;
                builder.ins().fabs(v)
            }
            Expr::Sqrt(e) => {
                let v = e.codegen(builder, module, ctx)?;
                builder.ins().sqrt(v)
            }
            Expr::Pow(base, n) => {
                let b = base.codegen(builder, module, ctx)?;
                emit_integer_power(builder, b, *n)
            }
            Expr::PowFloat(base, c) => {
                let b = base.codegen(builder, module, ctx)?;
                let e = builder.ins().f64const(*c);
                operators::pow::call_pow(builder, module, b, e)?
            }
            Expr::Exp(e) => {
                let v = e.codegen(builder, module, ctx)?;
                operators::exp::call_exp(builder, module, v)?
            }
            Expr::Ln(e) => {
                let v = e.codegen(builder, module, ctx)?;
                operators::ln::call_ln(builder, module, v)?
            }
            Expr::Sin(e) => {
                let v = e.codegen(builder, module, ctx)?;
                operators::trigonometric::call_sin(builder, module, v)?
            }
            Expr::Cos(e) => {
                let v = e.codegen(builder, module, ctx)?;
                operators::trigonometric::call_cos(builder, module, v)?
            }
        })
    }
}

/// Emits an integer power as inline multiplications.
///
/// Common small exponents are special-cased; everything else goes through
/// binary exponentiation.
fn emit_integer_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        3 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, base)
        }
        4 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, square)
        }
        -1 => {
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, base)
        }
        -2 => {
            let square = builder.ins().fmul(base, base);
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, square)
        }
        _ => {
            let mut result = builder.ins().f64const(1.0);
            let mut current = base;
            let mut remaining = exp.abs();
            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = builder.ins().fmul(result, current);
                }
                if remaining > 1 {
                    current = builder.ins().fmul(current, current);
                }
                remaining >>= 1;
            }
            if exp < 0 {
                let one = builder.ins().f64const(1.0);
                builder.ins().fdiv(one, result)
            } else {
                result
            }
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Time => write!(f, "t"),
            Expr::State(i) => write!(f, "y({i})"),
            Expr::Param(i) => write!(f, "par({i})"),
            Expr::Helper(i) => write!(f, "helper({i})"),
            Expr::Cse(i) => write!(f, "cse({i})"),
            Expr::Add(l, r) => write!(f, "({l} + {r})"),
            Expr::Sub(l, r) => write!(f, "({l} - {r})"),
            Expr::Mul(l, r) => write!(f, "({l} * {r})"),
            Expr::Div(l, r) => write!(f, "({l} / {r})"),
            Expr::Neg(e) => write!(f, "-({e})"),
            Expr::Abs(e) => write!(f, "|{e}|"),
            Expr::Pow(b, n) => write!(f, "({b}^{n})"),
            Expr::PowFloat(b, c) => write!(f, "({b}^{c})"),
            Expr::Exp(e) => write!(f, "exp({e})"),
            Expr::Ln(e) => write!(f, "ln({e})"),
            Expr::Sqrt(e) => write!(f, "sqrt({e})"),
            Expr::Sin(e) => write!(f, "sin({e})"),
            Expr::Cos(e) => write!(f, "cos({e})"),
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
    fn derivative_of_state_components() {
        assert_eq!(y(0).derivative(Wrt::State(0)), Expr::Const(1.0));
        assert_eq!(y(0).derivative(Wrt::State(1)), Expr::Const(0.0));
        assert_eq!(Expr::Time.derivative(Wrt::State(0)), Expr::Const(0.0));
        assert_eq!(Expr::Param(0).derivative(Wrt::State(0)), Expr::Const(0.0));
    }

    #[test]
    fn derivative_treats_helpers_as_symbols() {
        // d/dy0 of helper(0) * y(0) is helper(0); the chain-rule term for
        // the helper itself is added by the Jacobian engine.
        let e = Expr::mul(Expr::Helper(0), y(0));
        assert_eq!(e.derivative(Wrt::State(0)), Expr::Helper(0));
        assert_eq!(e.derivative(Wrt::Helper(0)), y(0));
    }

    #[test]
    fn product_and_quotient_rules() {
        // d/dy0 (y0 * y1) = y1
        let product = Expr::mul(y(0), y(1));
        assert_eq!(product.derivative(Wrt::State(0)).simplify(), y(1));

        // d/dy0 (y0 / y1) = y1 / y1^2
        let quotient = Expr::div(y(0), y(1));
        let d = quotient.derivative(Wrt::State(0));
        assert_relative_eq!(d.eval(0.0, &[2.0, 4.0], &[], &[], &[]), 0.25);
    }

    #[test]
    fn chain_rule_through_transcendentals() {
        // d/dy0 exp(2*y0) = 2 exp(2*y0)
        let e = Expr::Exp(Box::new(Expr::mul(Expr::Const(2.0), y(0))));
        let d = e.derivative(Wrt::State(0));
        assert_relative_eq!(
            d.eval(0.0, &[0.3], &[], &[], &[]),
            2.0 * (0.6f64).exp(),
            max_relative = 1e-12
        );

        // d/dy0 sin(y0) = cos(y0)
        let s = Expr::Sin(Box::new(y(0)));
        let d = s.derivative(Wrt::State(0));
        assert_relative_eq!(d.eval(0.0, &[1.1], &[], &[], &[]), (1.1f64).cos());
    }

    #[test]
    fn smart_constructors_fold_zeros() {
        assert!(Expr::mul(Expr::Const(0.0), y(3)).is_zero());
        assert_eq!(Expr::add(Expr::Const(0.0), y(1)), y(1));
        assert_eq!(Expr::mul(Expr::Const(1.0), y(2)), y(2));
        assert_eq!(Expr::sub(y(1), Expr::Const(0.0)), y(1));
    }

    #[test]
    fn simplify_folds_constants_and_identities() {
        let e = Expr::Add(Box::new(Expr::Const(2.0)), Box::new(Expr::Const(3.0)));
        assert_eq!(e.simplify(), Expr::Const(5.0));

        let e = Expr::Mul(Box::new(y(0)), Box::new(Expr::Const(1.0)));
        assert_eq!(e.simplify(), y(0));

        let e = Expr::Div(Box::new(y(0)), Box::new(y(0)));
        assert_eq!(e.simplify(), Expr::Const(1.0));

        let e = Expr::Pow(Box::new(y(0)), 1);
        assert_eq!(e.simplify(), y(0));
    }

    #[test]
    fn bounded_simplification_never_grows() {
        let e = Expr::mul(Expr::add(y(0), y(1)), Expr::add(y(0), y(1)));
        let s = e.simplify_bounded();
        assert!(s.size() <= e.size());
    }

    #[test]
    fn eval_matches_hand_computation() {
        // t * y0 + par0 * helper0
        let e = Expr::add(
            Expr::mul(Expr::Time, y(0)),
            Expr::mul(Expr::Param(0), Expr::Helper(0)),
        );
        assert_relative_eq!(e.eval(2.0, &[3.0], &[4.0], &[5.0], &[]), 26.0);
    }

    #[test]
    fn display_notation() {
        let e = Expr::add(Expr::mul(Expr::Const(2.0), y(0)), Expr::Param(1));
        assert_eq!(e.to_string(), "((2 * y(0)) + par(1))");
        assert_eq!(Expr::Sqrt(Box::new(Expr::Time)).to_string(), "sqrt(t)");
    }

    #[test]
    fn replace_equal_substitutes_all_occurrences() {
        let pattern = Expr::mul(y(0), y(1));
        let e = Expr::add(pattern.clone(), Expr::mul(pattern.clone(), y(2)));
        let replaced = e.replace_equal(&pattern, &Expr::Cse(0));
        assert_eq!(
            replaced,
            Expr::add(Expr::Cse(0), Expr::mul(Expr::Cse(0), y(2)))
        );
    }
}
