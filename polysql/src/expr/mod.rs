//! Expression engine for generated columns and CHECK constraints.
//!
//! The grammar is the arithmetic/comparison subset a generated-column clause
//! may use: comparison over additive over multiplicative, parenthesized
//! sub-expressions, function calls dispatched to an injected scalar-function
//! table, numeric/boolean/string literals and bare column references.
//!
//! Parsing is a Pratt parser with standard SQL precedence. Evaluation
//! propagates NULL through every operator, computes arithmetic in f64 and
//! reports division/modulo by zero as a row-level error that the STORED
//! materialization path converts into NULL-and-continue.

pub mod eval;
pub mod generated;
pub mod parser;

use crate::error::{CResult, Error};
use crate::sql::value::Value;

/// A parsed expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column(String),
    Call(String, Vec<Expr>),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Expr {
    /// All column names referenced by the expression.
    pub fn column_refs(&self) -> Vec<String> {
        let mut refs = Vec::new();
        self.walk_refs(&mut refs);
        refs
    }

    fn walk_refs(&self, refs: &mut Vec<String>) {
        match self {
            Expr::Column(name) => {
                if !refs.contains(name) {
                    refs.push(name.clone());
                }
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.walk_refs(refs)),
            Expr::Negate(inner) => inner.walk_refs(refs),
            Expr::Binary(_, lhs, rhs) => {
                lhs.walk_refs(refs);
                rhs.walk_refs(refs);
            }
            Expr::Literal(_) => {}
        }
    }

    /// All function names called by the expression, lowercased.
    pub fn function_refs(&self) -> Vec<String> {
        let mut fns = Vec::new();
        self.walk_fns(&mut fns);
        fns
    }

    fn walk_fns(&self, fns: &mut Vec<String>) {
        match self {
            Expr::Call(name, args) => {
                let name = name.to_lowercase();
                if !fns.contains(&name) {
                    fns.push(name);
                }
                args.iter().for_each(|a| a.walk_fns(fns));
            }
            Expr::Negate(inner) => inner.walk_fns(fns),
            Expr::Binary(_, lhs, rhs) => {
                lhs.walk_fns(fns);
                rhs.walk_fns(fns);
            }
            Expr::Literal(_) | Expr::Column(_) => {}
        }
    }
}

/// The external scalar-function library. The built-in implementation is out
/// of scope for the core; tests and embedders inject their own.
pub trait ScalarFns: Send + Sync {
    fn call(&self, name: &str, args: &[Value]) -> CResult<Value>;
}

/// A function table with no functions. Any call is an error, which the
/// STORED generated-column path turns into NULL.
pub struct NoFns;

impl ScalarFns for NoFns {
    fn call(&self, name: &str, _args: &[Value]) -> CResult<Value> {
        Err(Error::Value(format!("unknown function: {}", name)))
    }
}
