//! Values and result sets exchanged with drivers

use std::fmt;
use std::sync::Arc;

/// A column value or bound parameter.
///
/// Variants follow the storage classes a row can hold; drivers map their
/// native types onto them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; text holding a decimal integer counts.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One result row. Rows of the same result share their column names.
#[derive(Debug, Clone)]
pub struct Row {
    pub values: Vec<Value>,
    columns: Arc<[String]>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Rows of a query, in the order the database returned them.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Arc<[String]>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Outcome of a statement that modifies data.
#[derive(Debug, Clone, Default)]
pub struct StatementResult {
    pub affected_rows: u64,
    /// Id the database assigned to the row an INSERT created, when the
    /// driver can report one
    pub last_insert_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_by_name() {
        let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
        let row = Row::new(columns, vec![Value::Integer(7), Value::from("quiz")]);
        assert_eq!(row.get_by_name("name"), Some(&Value::from("quiz")));
        assert_eq!(row.get_by_name("missing"), None);
        assert_eq!(row.columns().len(), 2);
    }

    #[test]
    fn test_value_as_i64() {
        assert_eq!(Value::Integer(4).as_i64(), Some(4));
        assert_eq!(Value::from("42").as_i64(), Some(42));
        assert_eq!(Value::from("x").as_i64(), None);
        assert_eq!(Value::Real(4.0).as_i64(), None);
        assert_eq!(Value::Null.as_i64(), None);
    }
}
