//! Override value expressions.
//!
//! Override sets map a target field to a small expression language:
//!
//! | written as        | meaning                                          |
//! |-------------------|--------------------------------------------------|
//! | `null`            | copy the staged value of the same field          |
//! | `"NOW()"`         | current timestamp                                |
//! | `"NULL()"`        | NULL                                             |
//! | `"IFNULL(a, b)"`  | `a` unless it is NULL, else `b`                  |
//! | `"IF(c, a, b)"`   | `a` when the raw condition `c` holds, else `b`   |
//! | any other scalar  | literal                                          |
//!
//! Inside a call an empty argument means the staged value of the current
//! field and `$name` means the staged value of `name`. Quoted arguments are
//! literals, nested calls are parsed recursively and anything else is passed
//! through to the store untouched.

mod parser;

use crate::error::{SyncError, SyncResult};
use crate::policy::OverrideSet;
use crate::value::Value;
use serde::Serialize;
use std::fmt;

/// Alias of the staged snapshot when expressions are rendered.
pub const STAGED_ALIAS: &str = "_s";

/// A parsed override expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    /// Value of a staged field.
    Staged(String),
    /// Current timestamp.
    Now,
    /// NULL.
    Null,
    /// Literal value.
    Literal(Value),
    /// Store-specific fragment passed through verbatim.
    Raw(String),
    /// `value` unless NULL, else `fallback`.
    IfNull {
        /// Preferred value.
        value: Box<Expr>,
        /// Value used when `value` is NULL.
        fallback: Box<Expr>,
    },
    /// Conditional on a raw boolean fragment.
    If {
        /// Raw condition.
        condition: String,
        /// Value when the condition holds.
        then: Box<Expr>,
        /// Value otherwise.
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Shorthand for [`Expr::Staged`].
    pub fn staged(field: impl Into<String>) -> Self {
        Expr::Staged(field.into())
    }

    /// Shorthand for [`Expr::Literal`].
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Staged(field) => write!(f, "{STAGED_ALIAS}.{field}"),
            Expr::Now => f.write_str("NOW()"),
            Expr::Null => f.write_str("NULL"),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Raw(text) => f.write_str(text),
            Expr::IfNull { value, fallback } => write!(f, "IFNULL({value}, {fallback})"),
            Expr::If {
                condition,
                then,
                otherwise,
            } => write!(f, "IF({condition}, {then}, {otherwise})"),
        }
    }
}

/// Assignment of an expression to a target field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    /// Target field.
    pub field: String,
    /// Value expression.
    pub value: Expr,
}

impl Assignment {
    /// Creates an assignment.
    pub fn new(field: impl Into<String>, value: Expr) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.field, self.value)
    }
}

/// Parses the override entry of `field`.
pub fn normalize(field: &str, raw: &serde_json::Value) -> SyncResult<Expr> {
    match raw {
        serde_json::Value::Null => Ok(Expr::Staged(field.to_string())),
        serde_json::Value::String(text) => match text.as_str() {
            "NOW()" => Ok(Expr::Now),
            "NULL()" => Ok(Expr::Null),
            t if t.starts_with("IFNULL(") || t.starts_with("IF(") => parser::parse_call(field, t),
            t => Ok(Expr::Literal(Value::Text(t.to_string()))),
        },
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => Value::from_json(raw)
            .map(Expr::Literal)
            .ok_or_else(|| SyncError::invalid_expression(field, "unrepresentable number")),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(
            SyncError::invalid_expression(field, "expected a scalar or a call expression"),
        ),
    }
}

/// Parses every entry of an override set.
pub fn normalize_set(set: &OverrideSet) -> SyncResult<Vec<Assignment>> {
    set.iter()
        .map(|(field, raw)| Ok(Assignment::new(field.clone(), normalize(field, raw)?)))
        .collect()
}
