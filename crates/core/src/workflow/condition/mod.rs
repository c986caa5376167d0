//! A small, closed expression language for branch and loop decisions.
//!
//! Conditions are written the way graph authors already write them, e.g.
//! `state['score'] >= 70` or `state.get('issues', 0) < 3 and not state['done']`.
//! Only the run state and a fixed set of pure functions are reachable.

mod eval;
mod lexer;
mod parser;

pub use eval::truthy;
pub use parser::{parse, ArithOp, CompareOp, Expr, Function};

use crate::types::RunState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a condition could not be evaluated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("syntax error at offset {pos}: {message}")]
    Lex { pos: usize, message: String },

    #[error("syntax error: {0}")]
    Parse(String),

    #[error("name '{0}' is not available in conditions")]
    UnknownName(String),

    #[error("{function}() takes {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("key '{0}' not found in state")]
    MissingKey(String),

    #[error("index {0} out of range")]
    IndexOutOfRange(i64),

    #[error("type error: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("numeric overflow")]
    Overflow,
}

/// Condition source text as written in a graph definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Condition(String);

impl Condition {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<Expr, ConditionError> {
        parse(&self.0)
    }

    /// Evaluate strictly, surfacing any error.
    pub fn check(&self, state: &RunState) -> Result<bool, ConditionError> {
        let expr = self.parse()?;
        eval::evaluate_expr(&expr, state)
    }

    /// Evaluate, treating any error as `false`.
    ///
    /// A mistyped condition silently fails its branch; the error is logged.
    pub fn evaluate(&self, state: &RunState) -> bool {
        match self.check(state) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(condition = %self.0, error = %e, "Condition evaluation error");
                false
            }
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Condition {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for Condition {
    fn from(source: String) -> Self {
        Self(source)
    }
}

/// Evaluate `condition` against `state`, returning `false` on any error.
pub fn evaluate_condition(condition: &str, state: &RunState) -> bool {
    Condition::new(condition).evaluate(state)
}
