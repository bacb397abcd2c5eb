use crate::error::{CResult, Error};
use crate::expr::{BinaryOp, Expr, ScalarFns};
use crate::sql::value::Value;
use crate::sql::Row;

/// Evaluates an expression against a row.
///
/// NULL propagates through every arithmetic and comparison operator.
/// Arithmetic runs in f64 via the shared numeric coercion; division and
/// modulo by zero are errors so the caller can decide how to degrade
/// (the STORED generated-column path stores NULL and continues).
pub fn evaluate(expr: &Expr, row: &Row, fns: &dyn ScalarFns) -> CResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Column(name) => Ok(row.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Negate(inner) => match evaluate(inner, row, fns)?.to_numeric() {
            None => Ok(Value::Null),
            Some(n) => Ok(Value::Float(-n)),
        },
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| evaluate(a, row, fns))
                .collect::<CResult<Vec<_>>>()?;
            fns.call(name, &args)
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = evaluate(lhs, row, fns)?;
            let rhs = evaluate(rhs, row, fns)?;
            apply_binary(*op, &lhs, &rhs)
        }
    }
}

fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> CResult<Value> {
    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let Some(ord) = lhs.sql_cmp(rhs) else { return Ok(Value::Null) };
            let result = match op {
                BinaryOp::Eq => ord == std::cmp::Ordering::Equal,
                BinaryOp::Ne => ord != std::cmp::Ordering::Equal,
                BinaryOp::Lt => ord == std::cmp::Ordering::Less,
                BinaryOp::Le => ord != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Boolean(result))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (Some(a), Some(b)) = (lhs.to_numeric(), rhs.to_numeric()) else {
                return Ok(Value::Null);
            };
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => {
                    if b == 0.0 {
                        return Err(Error::Value("division by zero".to_string()));
                    }
                    a / b
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        return Err(Error::Value("modulo by zero".to_string()));
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Float(result))
        }
    }
}

/// Evaluates an expression as a WHERE-style predicate: NULL is false.
pub fn evaluate_predicate(expr: &Expr, row: &Row, fns: &dyn ScalarFns) -> CResult<bool> {
    match evaluate(expr, row, fns)? {
        Value::Boolean(b) => Ok(b),
        Value::Null => Ok(false),
        v => Ok(v.to_numeric().map_or(false, |n| n != 0.0)),
    }
}
