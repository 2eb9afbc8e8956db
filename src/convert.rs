//! Conversion from parsed equation strings to expression trees.
//!
//! Equations can be written as plain strings ("-0.1*x + sin(t)") and are
//! parsed with evalexpr; this module maps the resulting AST onto [`Expr`],
//! resolving every identifier through a [`SymbolTable`] that knows the
//! declared state components, parameters and helpers. `t` is always bound
//! to the time.

use std::collections::HashMap;

use evalexpr::{build_operator_tree, DefaultNumericTypes, Node, Operator};

use crate::errors::{ConvertError, ValidationError};
use crate::expr::Expr;

/// Maps identifiers to the leaf expressions they stand for.
pub struct SymbolTable {
    map: HashMap<String, Expr>,
}

impl SymbolTable {
    /// Builds a table binding state names to `y(i)`, parameter names to
    /// `par(i)` and helper names to `helper(i)`, each by position.
    ///
    /// `t` is reserved for the time; redeclaring it or any other name is
    /// rejected.
    pub fn new(
        states: &[&str],
        params: &[&str],
        helpers: &[&str],
    ) -> Result<Self, ValidationError> {
        let mut map = HashMap::new();
        map.insert("t".to_string(), Expr::Time);

        let declarations = states
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, Expr::State(i)))
            .chain(
                params
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (*name, Expr::Param(i))),
            )
            .chain(
                helpers
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (*name, Expr::Helper(i))),
            );

        for (name, expr) in declarations {
            if map.insert(name.to_string(), expr).is_some() {
                return Err(ValidationError::DuplicateSymbol(name.to_string()));
            }
        }

        Ok(Self { map })
    }

    fn resolve(&self, identifier: &str) -> Result<Expr, ConvertError> {
        self.map
            .get(identifier)
            .cloned()
            .ok_or_else(|| ConvertError::UndeclaredSymbol(identifier.to_string()))
    }
}

/// Parses one equation string and converts it to an expression tree.
pub fn parse_expression(source: &str, table: &SymbolTable) -> Result<Expr, ConvertError> {
    let node = build_operator_tree::<DefaultNumericTypes>(source)?;
    build_ast(&node, table)
}

/// Converts an evalexpr AST node into an [`Expr`].
///
/// Supported: `+ - * /`, unary negation, `^` with a constant exponent, and
/// the functions `abs`, `ln`/`log`, `sqrt`, `exp`, `sin`, `cos`.
pub fn build_ast(node: &Node, table: &SymbolTable) -> Result<Expr, ConvertError> {
    match node.operator() {
        // addition and multiplication may carry more than two children
        Operator::Add => {
            let children = node.children();
            children
                .iter()
                .skip(1)
                .try_fold(build_ast(&children[0], table)?, |acc, child| {
                    Ok(Expr::Add(Box::new(acc), Box::new(build_ast(child, table)?)))
                })
        }
        Operator::Mul => {
            let children = node.children();
            children
                .iter()
                .skip(1)
                .try_fold(build_ast(&children[0], table)?, |acc, child| {
                    Ok(Expr::Mul(Box::new(acc), Box::new(build_ast(child, table)?)))
                })
        }
        Operator::Sub => {
            let children = binary_children(node)?;
            Ok(Expr::Sub(
                Box::new(build_ast(&children[0], table)?),
                Box::new(build_ast(&children[1], table)?),
            ))
        }
        Operator::Div => {
            let children = binary_children(node)?;
            Ok(Expr::Div(
                Box::new(build_ast(&children[0], table)?),
                Box::new(build_ast(&children[1], table)?),
            ))
        }
        Operator::Neg => {
            let children = node.children();
            Ok(Expr::Neg(Box::new(build_ast(&children[0], table)?)))
        }
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::Malformed(format!(
                "expected numeric constant, got {value:?}"
            ))),
        },
        Operator::VariableIdentifierRead { identifier } => table.resolve(identifier.as_str()),
        Operator::FunctionIdentifier { identifier } => {
            let children = node.children();
            let arg = Box::new(build_ast(&children[0], table)?);
            match identifier.as_str() {
                "abs" => Ok(Expr::Abs(arg)),
                "ln" | "log" => Ok(Expr::Ln(arg)),
                "sqrt" => Ok(Expr::Sqrt(arg)),
                "exp" => Ok(Expr::Exp(arg)),
                "sin" => Ok(Expr::Sin(arg)),
                "cos" => Ok(Expr::Cos(arg)),
                _ => Err(ConvertError::UnknownFunction(identifier.to_string())),
            }
        }
        // exponentiation requires a constant exponent
        Operator::Exp => {
            let children = binary_children(node)?;
            let base = Box::new(build_ast(&children[0], table)?);
            if let Operator::Const { value } = children[1].operator() {
                match value {
                    evalexpr::Value::Int(exp) => Ok(Expr::Pow(base, *exp)),
                    evalexpr::Value::Float(exp) => Ok(Expr::PowFloat(base, *exp)),
                    _ => Err(ConvertError::NonConstantExponent(format!("{value:?}"))),
                }
            } else {
                Err(ConvertError::NonConstantExponent(format!(
                    "{:?}",
                    children[1].operator()
                )))
            }
        }
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                build_ast(&children[0], table)
            } else {
                Err(ConvertError::Malformed(format!(
                    "expected a single expression, got {} at the root",
                    children.len()
                )))
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn binary_children(node: &Node) -> Result<&[Node], ConvertError> {
    let children = node.children();
    if children.len() == 2 {
        Ok(children)
    } else {
        Err(ConvertError::Malformed(format!(
            "expected 2 operands for {:?}, got {}",
            node.operator(),
            children.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> SymbolTable {
        SymbolTable::new(&["x", "v"], &["omega"], &["coupling"]).unwrap()
    }

    #[test]
    fn resolves_declared_symbols_by_position() {
        let table = table();
        assert_eq!(parse_expression("x", &table).unwrap(), Expr::State(0));
        assert_eq!(parse_expression("v", &table).unwrap(), Expr::State(1));
        assert_eq!(parse_expression("omega", &table).unwrap(), Expr::Param(0));
        assert_eq!(
            parse_expression("coupling", &table).unwrap(),
            Expr::Helper(0)
        );
        assert_eq!(parse_expression("t", &table).unwrap(), Expr::Time);
    }

    #[test]
    fn rejects_undeclared_symbols() {
        let err = parse_expression("x + unknown", &table()).unwrap_err();
        assert!(matches!(err, ConvertError::UndeclaredSymbol(name) if name == "unknown"));
    }

    #[test]
    fn rejects_duplicate_declarations() {
        assert!(matches!(
            SymbolTable::new(&["x", "x"], &[], &[]),
            Err(ValidationError::DuplicateSymbol(_))
        ));
        assert!(matches!(
            SymbolTable::new(&["x"], &["x"], &[]),
            Err(ValidationError::DuplicateSymbol(_))
        ));
        // `t` is reserved
        assert!(matches!(
            SymbolTable::new(&["t"], &[], &[]),
            Err(ValidationError::DuplicateSymbol(_))
        ));
    }

    #[test]
    fn parses_arithmetic_and_functions() {
        let table = table();
        let e = parse_expression("-omega^2 * x + sin(t)", &table).unwrap();
        let omega = 1.3;
        let x = 0.7;
        let t = 0.2;
        assert_relative_eq!(
            e.eval(t, &[x, 0.0], &[omega], &[], &[]),
            -(omega * omega) * x + t.sin(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn integer_and_float_exponents() {
        let table = table();
        assert_eq!(
            parse_expression("x^3", &table).unwrap(),
            Expr::Pow(Box::new(Expr::State(0)), 3)
        );
        assert_eq!(
            parse_expression("x^1.5", &table).unwrap(),
            Expr::PowFloat(Box::new(Expr::State(0)), 1.5)
        );
        assert!(matches!(
            parse_expression("x^v", &table),
            Err(ConvertError::NonConstantExponent(_))
        ));
    }

    #[test]
    fn unknown_functions_are_rejected() {
        assert!(matches!(
            parse_expression("tanh(x)", &table()),
            Err(ConvertError::UnknownFunction(_))
        ));
    }
}
