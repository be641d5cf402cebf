//! Core data types: conversation requests, replies and tabular results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One prior exchange in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            text: text.into(),
        }
    }
}

/// A user request together with the conversation that led to it.
///
/// Handlers only ever see `&Request`; the value is immutable once it has
/// been handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub text: String,
    #[serde(default)]
    pub history: Vec<Turn>,
}

impl Request {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(text: impl Into<String>, history: Vec<Turn>) -> Self {
        Self {
            text: text.into(),
            history,
        }
    }
}

/// The accepted (or degraded) answer for a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub text: String,
    /// Name of the handler that produced the text.
    pub handler: String,
    /// Score assigned by the quality gate.
    pub quality: f64,
    /// Set when no reply met the acceptance threshold and the best one seen
    /// was returned anyway.
    pub degraded: bool,
}

/// A single cell in a [`Table`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{}", i),
            SqlValue::Real(r) => write!(f, "{}", r),
            SqlValue::Text(s) => write!(f, "{}", s),
            SqlValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Integer(i)
    }
}

impl From<f64> for SqlValue {
    fn from(f: f64) -> Self {
        SqlValue::Real(f)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Rows returned by a query, with their column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Vec<SqlValue>>) -> Self {
        self.rows = rows;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Cell at `row` in the column called `name`.
    pub fn get(&self, row: usize, name: &str) -> Option<&SqlValue> {
        let idx = self.column_index(name)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Text of a cell, `None` for NULL or missing.
    pub fn text(&self, row: usize, name: &str) -> Option<String> {
        match self.get(row, name)? {
            SqlValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup_is_case_insensitive() {
        let table = Table::new(vec!["Store".into(), "product_name".into()])
            .with_rows(vec![vec![SqlValue::from("2"), SqlValue::from("Vodka")]]);
        assert_eq!(table.text(0, "store").as_deref(), Some("2"));
        assert_eq!(table.text(0, "PRODUCT_NAME").as_deref(), Some("Vodka"));
        assert!(table.get(0, "brand_name").is_none());
        assert!(table.get(3, "store").is_none());
    }

    #[test]
    fn test_null_cells_have_no_text() {
        let table = Table::new(vec!["store".into()]).with_rows(vec![vec![SqlValue::Null]]);
        assert_eq!(table.text(0, "store"), None);
    }

    #[test]
    fn test_sql_value_json_is_untagged() {
        let row = vec![
            SqlValue::Null,
            SqlValue::Integer(3),
            SqlValue::Text("gin".into()),
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[null,3,"gin"]"#);
    }
}
