//! Restricted condition language for routing
//!
//! Conditions are parsed once at compile time into a [`Condition`] and
//! evaluated against state on every transition. The grammar only covers
//! field paths, literals, comparisons, and `and` / `or` / `not`; nothing in a
//! condition can execute code.
//!
//! A path that does not resolve evaluates to an absent sentinel: it is falsy,
//! `==` against it is false, `!=` is true, and ordering comparisons are false.

pub mod lexer;
pub mod parser;

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::error::ExpressionError;
use crate::state::StateMap;

pub use parser::{CompareOp, Expr, Literal};

/// A compiled routing condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse `source`; unsupported syntax is an error here, never at run time
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let expr = parser::parse(source)?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Field paths the condition reads
    pub fn paths(&self) -> Vec<String> {
        self.expr.paths()
    }

    pub fn evaluate(&self, values: &StateMap) -> bool {
        evaluate(&self.expr, values).truthy()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Field paths referenced by `source`, or empty when it does not tokenize
pub fn referenced_paths(source: &str) -> Vec<String> {
    parser::parse(source).map(|e| e.paths()).unwrap_or_default()
}

/// Result of evaluating a sub-expression.
#[derive(Debug, Clone, PartialEq)]
enum Operand<'a> {
    Absent,
    Borrowed(&'a Value),
    Owned(Value),
}

impl Operand<'_> {
    fn value(&self) -> Option<&Value> {
        match self {
            Operand::Absent => None,
            Operand::Borrowed(v) => Some(v),
            Operand::Owned(v) => Some(v),
        }
    }

    fn truthy(&self) -> bool {
        match self.value() {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(map)) => !map.is_empty(),
        }
    }
}

fn evaluate<'a>(expr: &Expr, values: &'a StateMap) -> Operand<'a> {
    match expr {
        Expr::Literal(literal) => Operand::Owned(literal_value(literal)),
        Expr::Path(segments) => resolve(values, segments),
        Expr::Compare { op, lhs, rhs } => {
            let lhs = evaluate(lhs, values);
            let rhs = evaluate(rhs, values);
            Operand::Owned(Value::Bool(compare(*op, lhs.value(), rhs.value())))
        }
        Expr::And(lhs, rhs) => {
            let result = evaluate(lhs, values).truthy() && evaluate(rhs, values).truthy();
            Operand::Owned(Value::Bool(result))
        }
        Expr::Or(lhs, rhs) => {
            let result = evaluate(lhs, values).truthy() || evaluate(rhs, values).truthy();
            Operand::Owned(Value::Bool(result))
        }
        Expr::Not(inner) => Operand::Owned(Value::Bool(!evaluate(inner, values).truthy())),
    }
}

fn resolve<'a>(values: &'a StateMap, segments: &[String]) -> Operand<'a> {
    let Some((first, rest)) = segments.split_first() else {
        return Operand::Absent;
    };
    let Some(mut current) = values.get(first) else {
        return Operand::Absent;
    };
    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Operand::Absent,
        }
    }
    Operand::Borrowed(current)
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Int(v) => Value::from(*v),
        Literal::Float(v) => Value::from(*v),
        Literal::Str(v) => Value::String(v.clone()),
        Literal::Bool(v) => Value::Bool(*v),
        Literal::Null => Value::Null,
    }
}

fn compare(op: CompareOp, lhs: Option<&Value>, rhs: Option<&Value>) -> bool {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        // Absent never equals anything
        return op == CompareOp::Ne;
    };
    match op {
        CompareOp::Eq => values_equal(lhs, rhs),
        CompareOp::Ne => !values_equal(lhs, rhs),
        CompareOp::Lt => order(lhs, rhs) == Some(Ordering::Less),
        CompareOp::Le => matches!(order(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => order(lhs, rhs) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(order(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => lhs == rhs,
    }
}

/// Numbers compare numerically, strings lexicographically; anything else is unordered
fn order(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
