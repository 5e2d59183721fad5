//! Filter expressions
//!
//! A filter is compiled once from its source text and evaluated against each
//! record before aggregation. Compile errors surface before any record is
//! read; evaluation errors (for example an unparsable time) abort the pass.
//!
//! ```text
//! Status >= 500 && Uri startsWith "/api/"
//! Method in ["POST", "PUT"] and ResponseTime > 0.5
//! Time > TimeAgo("15m")
//! BetweenTime(Time, "2024-03-01T00:00:00Z", "2024-03-02T00:00:00Z")
//! ```

mod eval;
mod lexer;
mod parser;

use chrono::{DateTime, FixedOffset, Local};
use logprof_core::Record;
use thiserror::Error;

use eval::Env;
use parser::{Expr, Parser};

/// Filter compile and evaluation errors
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Syntax error at position {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid time: {0:?}")]
    InvalidTime(String),

    #[error("Invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("Type error: {0}")]
    Type(String),
}

/// A compiled filter expression
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    pub fn compile(source: &str) -> Result<Self, FilterError> {
        let tokens = lexer::tokenize(source)?;
        let expr = Parser::new(tokens, source.len()).parse()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a record, with `TimeAgo` relative to the current time
    pub fn matches(&self, record: &Record) -> Result<bool, FilterError> {
        self.matches_at(record, Local::now().fixed_offset())
    }

    /// Evaluate against a record, with `TimeAgo` relative to `now`
    pub fn matches_at(
        &self,
        record: &Record,
        now: DateTime<FixedOffset>,
    ) -> Result<bool, FilterError> {
        Env { record, now }.eval_bool(&self.expr)
    }
}
