//! SQL Parameter Binder
//!
//! Rewrites colon-named placeholders into positional `$N` placeholders once,
//! then binds values by name each time the query runs.

use std::collections::HashMap;

use arkiv_core::Value;
use thiserror::Error;

use super::extractor::{COLON_NAMED_REGEX, mask_strings_and_comments};
use super::{Parameter, extract_parameters};

/// Errors that can occur during parameter binding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindError {
    /// A required named parameter was not provided.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// The text uses positional placeholders, which cannot be bound by name.
    #[error("positional placeholder ${0} is not supported; use :name parameters")]
    PositionalPlaceholder(usize),
}

/// Result type for parameter binding operations.
pub type BindResult<T> = Result<T, BindError>;

/// A query with its named placeholders rewritten to `$1`, `$2`, ...
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenQuery {
    /// The SQL with positional placeholders
    pub sql: String,
    /// Parameter names by position; `parameter_order[0]` binds `$1`
    pub parameter_order: Vec<String>,
}

impl RewrittenQuery {
    /// Returns the values for this query's placeholders in positional order.
    ///
    /// Entries of `params` that the query does not reference are ignored.
    pub fn bind(&self, params: &HashMap<String, Value>) -> BindResult<Vec<Value>> {
        self.parameter_order
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BindError::MissingParameter(name.clone()))
            })
            .collect()
    }
}

/// Rewrites `:name` placeholders into `$N` placeholders.
///
/// Each distinct name gets one position, assigned in order of first
/// occurrence, so a reused name refers to the same value. Placeholders in
/// string literals, quoted identifiers and comments are left untouched.
///
/// ```
/// use arkiv_query::parameters::rewrite_named;
///
/// let rewritten = rewrite_named("SELECT * FROM t WHERE a = :x OR b = :y OR c = :x").unwrap();
/// assert_eq!(rewritten.sql, "SELECT * FROM t WHERE a = $1 OR b = $2 OR c = $1");
/// assert_eq!(rewritten.parameter_order, vec!["x", "y"]);
/// ```
pub fn rewrite_named(sql: &str) -> BindResult<RewrittenQuery> {
    if let Some(Parameter::Positional(pos)) =
        extract_parameters(sql).into_iter().find(|p| !p.is_named())
    {
        return Err(BindError::PositionalPlaceholder(pos));
    }

    // Match on the masked text; offsets are identical in the original
    let masked = mask_strings_and_comments(sql);
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut parameter_order: Vec<String> = Vec::new();
    let mut result = String::with_capacity(sql.len());
    let mut last_end = 0;

    for cap in COLON_NAMED_REGEX.captures_iter(&masked) {
        let Some(name) = cap.get(2) else {
            continue;
        };
        // The placeholder starts at the colon right before the name
        let start = name.start() - 1;
        let name = name.as_str();
        let pos = *positions.entry(name.to_string()).or_insert_with(|| {
            parameter_order.push(name.to_string());
            parameter_order.len()
        });

        result.push_str(&sql[last_end..start]);
        result.push_str(&format!("${}", pos));
        last_end = start + 1 + name.len();
    }
    result.push_str(&sql[last_end..]);

    Ok(RewrittenQuery {
        sql: result,
        parameter_order,
    })
}
