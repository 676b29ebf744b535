//! Tree-walking evaluation of predicates.
//!
//! Evaluation only sees the bindings map handed to it. Every failure mode
//! (unbound or null variable, type mismatch, division by zero, non-boolean
//! result) makes the predicate false.

use super::{BinaryOp, Expr, Function, Predicate, UnaryOp};
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

/// Variable bindings for one record
pub type Bindings = FxHashMap<String, Value>;

/// Internal evaluation failure; never escapes this module.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EvalError {
    TypeMismatch(&'static str),
    DivisionByZero,
    Unbound,
}

type EvalResult = std::result::Result<Value, EvalError>;

impl Predicate {
    /// Evaluate the predicate against a set of bindings.
    ///
    /// `TRUE`/`FALSE` predicates return immediately. Otherwise a predicate
    /// referencing any unbound or null variable is false.
    #[must_use]
    pub fn evaluate(&self, bindings: &Bindings) -> bool {
        if let Some(constant) = self.constant() {
            return constant;
        }

        let all_bound = self
            .variables()
            .iter()
            .all(|v| bindings.get(v).is_some_and(|value| !value.is_null()));
        if !all_bound {
            return false;
        }

        matches!(eval(self.expr(), bindings), Ok(Value::Bool(true)))
    }
}

fn eval(expr: &Expr, bindings: &Bindings) -> EvalResult {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Variable(name) => match bindings.get(name) {
            Some(v) if !v.is_null() => Ok(v.clone()),
            _ => Err(EvalError::Unbound),
        },
        Expr::Unary { op, expr } => {
            let v = eval(expr, bindings)?;
            match (op, v) {
                (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                (UnaryOp::Plus, Value::Number(n)) => Ok(Value::Number(n)),
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                _ => Err(EvalError::TypeMismatch("unary operand")),
            }
        }
        Expr::Binary { left, op, right } => match op {
            BinaryOp::And => {
                if !expect_bool(eval(left, bindings)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool(eval(right, bindings)?)?))
            }
            BinaryOp::Or => {
                if expect_bool(eval(left, bindings)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool(eval(right, bindings)?)?))
            }
            _ => {
                let l = eval(left, bindings)?;
                let r = eval(right, bindings)?;
                binary(*op, &l, &r)
            }
        },
        Expr::Call { func, args } => {
            let nums = args
                .iter()
                .map(|a| eval(a, bindings).and_then(expect_number))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let out = match func {
                Function::Abs => nums[0].abs(),
                Function::Min => nums.iter().copied().fold(f64::INFINITY, f64::min),
                Function::Max => nums.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            };
            Ok(Value::Number(out))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval(expr, bindings)?;
            let lo = eval(low, bindings)?;
            let hi = eval(high, bindings)?;
            let inside = compare(&v, &lo)? != Ordering::Less && compare(&v, &hi)? != Ordering::Greater;
            Ok(Value::Bool(inside != *negated))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let v = eval(expr, bindings)?;
            let mut found = false;
            for candidate in list {
                if compare(&v, &eval(candidate, bindings)?)? == Ordering::Equal {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> EvalResult {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let a = expect_number(l.clone())?;
            let b = expect_number(r.clone())?;
            let out = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div | BinaryOp::Mod if b == 0.0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            Ok(Value::Number(out))
        }
        BinaryOp::Eq => Ok(Value::Bool(compare(l, r)? == Ordering::Equal)),
        BinaryOp::NotEq => Ok(Value::Bool(compare(l, r)? != Ordering::Equal)),
        BinaryOp::Lt => Ok(Value::Bool(compare(l, r)? == Ordering::Less)),
        BinaryOp::LtEq => Ok(Value::Bool(compare(l, r)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(l, r)? == Ordering::Greater)),
        BinaryOp::GtEq => Ok(Value::Bool(compare(l, r)? != Ordering::Less)),
        BinaryOp::And | BinaryOp::Or => {
            let a = expect_bool(l.clone())?;
            let b = expect_bool(r.clone())?;
            Ok(Value::Bool(if op == BinaryOp::And { a && b } else { a || b }))
        }
    }
}

/// Order two values of the same type. NaN never compares.
fn compare(l: &Value, r: &Value) -> std::result::Result<Ordering, EvalError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or(EvalError::TypeMismatch("NaN comparison")),
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::TypeMismatch("comparison operands")),
    }
}

fn expect_number(v: Value) -> std::result::Result<f64, EvalError> {
    match v {
        Value::Number(n) => Ok(n),
        _ => Err(EvalError::TypeMismatch("number")),
    }
}

fn expect_bool(v: Value) -> std::result::Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(b),
        _ => Err(EvalError::TypeMismatch("bool")),
    }
}
