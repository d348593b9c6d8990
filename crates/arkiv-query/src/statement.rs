//! Structural validation of source queries

use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

/// Reasons a SQL text is not usable as a read-only data source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatementError {
    #[error("failed to parse SQL: {0}")]
    Parse(String),

    #[error("expected exactly one statement, found {0}")]
    StatementCount(usize),

    #[error("statement is not a read-only query: {0}")]
    NotReadOnly(String),
}

/// Checks that `sql` is exactly one `SELECT` (optionally with a `WITH` clause)
/// that does not modify data.
///
/// Placeholders must already be in a form the parser understands, such as
/// `$1` or `:name`.
pub fn validate_read_only(sql: &str) -> Result<(), StatementError> {
    let dialect = GenericDialect {};
    let statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| StatementError::Parse(e.to_string()))?;

    if statements.len() != 1 {
        return Err(StatementError::StatementCount(statements.len()));
    }

    match &statements[0] {
        Statement::Query(query) if is_read_only_query(query) => Ok(()),
        other => {
            let preview: String = other.to_string().chars().take(60).collect();
            Err(StatementError::NotReadOnly(preview))
        }
    }
}

fn is_read_only_query(query: &Query) -> bool {
    let ctes_read_only = query
        .with
        .as_ref()
        .is_none_or(|with| with.cte_tables.iter().all(|cte| is_read_only_query(&cte.query)));
    ctes_read_only && is_read_only_body(&query.body)
}

fn is_read_only_body(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => true,
        SetExpr::Query(query) => is_read_only_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            is_read_only_body(left) && is_read_only_body(right)
        }
        _ => false,
    }
}
