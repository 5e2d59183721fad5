//! Evaluation of a compiled filter against one record

use super::parser::{ArithOp, CmpOp, Expr, Literal, StrOp, Variable};
use super::FilterError;
use crate::timeparse::parse_time;
use chrono::{DateTime, FixedOffset};
use logprof_core::Record;
use regex::Regex;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
    Time(DateTime<FixedOffset>),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Time(_) => "time",
            Value::List(_) => "list",
        }
    }
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Number(n) => Value::Number(*n),
            Literal::Str(s) => Value::Str(s.clone()),
        }
    }
}

pub(crate) struct Env<'a> {
    pub record: &'a Record,
    pub now: DateTime<FixedOffset>,
}

impl Env<'_> {
    pub fn eval(&self, expr: &Expr) -> Result<Value, FilterError> {
        match expr {
            Expr::Literal(literal) => Ok(literal.into()),
            Expr::Var(var) => Ok(self.variable(*var)),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<_, _>>()
                .map(Value::List),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner)?)),
            Expr::Neg(inner) => match self.eval(inner)? {
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(type_error(format!("cannot negate {}", other.type_name()))),
            },
            Expr::And(lhs, rhs) => Ok(Value::Bool(self.eval_bool(lhs)? && self.eval_bool(rhs)?)),
            Expr::Or(lhs, rhs) => Ok(Value::Bool(self.eval_bool(lhs)? || self.eval_bool(rhs)?)),
            Expr::Compare { op, lhs, rhs } => {
                let (lhs, rhs) = (self.eval(lhs)?, self.eval(rhs)?);
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }
            Expr::TimeCompare { op, lhs, rhs } => {
                let lhs = Value::Time(self.eval_time(lhs)?);
                let rhs = Value::Time(self.eval_time(rhs)?);
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }
            Expr::In { negated, lhs, rhs } => {
                let needle = self.eval(lhs)?;
                let found = match self.eval(rhs)? {
                    Value::List(items) => items.iter().any(|item| equal(&needle, item)),
                    other => {
                        return Err(type_error(format!(
                            "'in' expects a list, got {}",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Bool(found != *negated))
            }
            Expr::Matches { lhs, regex } => {
                let text = self.eval_str(lhs, "matches")?;
                Ok(Value::Bool(regex.is_match(&text)))
            }
            Expr::MatchesDynamic { lhs, rhs } => {
                let text = self.eval_str(lhs, "matches")?;
                let pattern = self.eval_str(rhs, "matches")?;
                let regex = Regex::new(&pattern)
                    .map_err(|source| FilterError::Regex { pattern, source })?;
                Ok(Value::Bool(regex.is_match(&text)))
            }
            Expr::Str { op, lhs, rhs } => {
                let name = match op {
                    StrOp::Contains => "contains",
                    StrOp::StartsWith => "startsWith",
                    StrOp::EndsWith => "endsWith",
                };
                let haystack = self.eval_str(lhs, name)?;
                let needle = self.eval_str(rhs, name)?;
                Ok(Value::Bool(match op {
                    StrOp::Contains => haystack.contains(&needle),
                    StrOp::StartsWith => haystack.starts_with(&needle),
                    StrOp::EndsWith => haystack.ends_with(&needle),
                }))
            }
            Expr::Arith { op, lhs, rhs } => arith(*op, self.eval(lhs)?, self.eval(rhs)?),
            Expr::TimeAgo(delta) => Ok(Value::Time(self.now - *delta)),
            Expr::BetweenTime { value, start, end } => {
                let t = self.eval_time(value)?;
                let start = self.eval_time(start)?;
                let end = self.eval_time(end)?;
                Ok(Value::Bool(start <= t && t <= end))
            }
        }
    }

    fn variable(&self, var: Variable) -> Value {
        let record = self.record;
        match var {
            Variable::Uri => Value::Str(record.uri.clone()),
            Variable::Method => Value::Str(record.method.clone()),
            Variable::Time => Value::Str(record.time.clone()),
            Variable::ResponseTime => Value::Number(record.response_time),
            Variable::BodyBytes => Value::Number(record.body_bytes),
            Variable::Status => Value::Number(f64::from(record.status)),
        }
    }

    pub fn eval_bool(&self, expr: &Expr) -> Result<bool, FilterError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(type_error(format!(
                "expected bool, got {}",
                other.type_name()
            ))),
        }
    }

    fn eval_str(&self, expr: &Expr, op: &str) -> Result<String, FilterError> {
        match self.eval(expr)? {
            Value::Str(s) => Ok(s),
            other => Err(type_error(format!(
                "'{op}' expects strings, got {}",
                other.type_name()
            ))),
        }
    }

    fn eval_time(&self, expr: &Expr) -> Result<DateTime<FixedOffset>, FilterError> {
        match self.eval(expr)? {
            Value::Time(t) => Ok(t),
            Value::Str(s) => parse_time(&s).ok_or(FilterError::InvalidTime(s)),
            Value::Number(n) => epoch_time(n).ok_or_else(|| FilterError::InvalidTime(n.to_string())),
            other => Err(type_error(format!(
                "expected a time, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Whole non-negative epoch seconds within chrono's range
fn epoch_time(n: f64) -> Option<DateTime<FixedOffset>> {
    if !n.is_finite() || n < 0.0 || n.fract() != 0.0 || n >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp(n as i64, 0).map(|t| t.fixed_offset())
}

fn type_error(message: String) -> FilterError {
    FilterError::Type(message)
}

/// Values of different types are never equal
fn equal(lhs: &Value, rhs: &Value) -> bool {
    lhs == rhs
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, FilterError> {
    let wanted: fn(Ordering) -> bool = match op {
        CmpOp::Eq => return Ok(equal(lhs, rhs)),
        CmpOp::NotEq => return Ok(!equal(lhs, rhs)),
        CmpOp::Lt => Ordering::is_lt,
        CmpOp::Le => Ordering::is_le,
        CmpOp::Gt => Ordering::is_gt,
        CmpOp::Ge => Ordering::is_ge,
    };

    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        _ => {
            return Err(type_error(format!(
                "cannot order {} and {}",
                lhs.type_name(),
                rhs.type_name()
            )))
        }
    };

    // NaN orders against nothing
    Ok(ordering.is_some_and(wanted))
}

fn arith(op: ArithOp, lhs: Value, rhs: Value) -> Result<Value, FilterError> {
    match (op, lhs, rhs) {
        (op, Value::Number(a), Value::Number(b)) => Ok(Value::Number(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
        })),
        (ArithOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (_, lhs, rhs) => Err(type_error(format!(
            "invalid operands {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}
