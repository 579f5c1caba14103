//! PostgREST-style row predicates (`active=eq.true`).
//!
//! The same predicate is sent to the REST API as a query parameter, to the
//! realtime server as a channel filter, and evaluated client-side when
//! routing change events to subscriptions.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Is,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Is => "is",
        }
    }
}

impl FromStr for FilterOp {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "is" => Ok(Self::Is),
            other => Err(BackendError::InvalidFilter(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.to_string(),
        }
    }

    pub fn is(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Is,
            value: value.to_string(),
        }
    }

    /// Query-string pair for the REST API: `("active", "eq.true")`.
    pub fn query_pair(&self) -> (String, String) {
        (
            self.column.clone(),
            format!("{}.{}", self.op.as_str(), self.value),
        )
    }

    /// Evaluate the predicate against a JSON row.
    pub fn matches(&self, record: &Value) -> bool {
        let field = record.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => render(field).as_deref() == Some(self.value.as_str()),
            FilterOp::Neq => render(field).as_deref() != Some(self.value.as_str()),
            FilterOp::Is => match self.value.as_str() {
                "null" => field.is_null(),
                "true" => field.as_bool() == Some(true),
                "false" => field.as_bool() == Some(false),
                _ => false,
            },
        }
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null".to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.op.as_str(), self.value)
    }
}

impl FromStr for RowFilter {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BackendError::InvalidFilter(s.to_string());
        let (column, rest) = s.split_once('=').ok_or_else(invalid)?;
        let (op, value) = rest.split_once('.').ok_or_else(invalid)?;
        if column.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            column: column.to_string(),
            op: op.parse().map_err(|_| invalid())?,
            value: value.to_string(),
        })
    }
}
