//! Source bindings and their compiled queries
//!
//! Every sourced element compiles to one parameterized query when the schema
//! is built. Table scans become `SELECT * ... WHERE "col" = $N ... ORDER BY
//! <keys>`; query templates have their `{table}` references expanded and
//! their `:name` placeholders rewritten to positional ones. Nothing is ever
//! interpolated into SQL at traversal time.

use std::sync::LazyLock;

use arkiv_query::parameters::{
    BindError, RewrittenQuery, mask_strings_and_comments, rewrite_named,
};
use arkiv_query::{StatementError, validate_read_only};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a filter column or query parameter gets its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextVar {
    /// Identity of the nearest ancestor record that came from a data source
    ParentId,
    /// Id of the activity instance being backed up or restored
    ActivityId,
    /// Id of the course module holding the activity
    ModuleId,
}

/// Errors in a source binding, reported when the schema is built.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindingError {
    #[error("table name is empty")]
    EmptyTableName,

    #[error("failed to parse query template: {0}")]
    Parse(String),

    #[error("query template must be a single statement, found {0}")]
    StatementCount(usize),

    #[error("query template is not a read-only SELECT: {0}")]
    NotReadOnly(String),

    #[error("positional placeholder ${0} in query template; use :name parameters")]
    PositionalPlaceholder(usize),

    #[error("parameter :{0} has no binding")]
    UnboundParameter(String),

    #[error("binding for :{0} is not used by the query")]
    UnusedParameter(String),
}

impl From<StatementError> for BindingError {
    fn from(e: StatementError) -> Self {
        match e {
            StatementError::Parse(msg) => BindingError::Parse(msg),
            StatementError::StatementCount(n) => BindingError::StatementCount(n),
            StatementError::NotReadOnly(stmt) => BindingError::NotReadOnly(stmt),
        }
    }
}

/// A validated query with positional placeholders, bound by parameter name
/// at traversal time.
pub type CompiledQuery = RewrittenQuery;

/// The data source of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceBinding {
    /// Scan of one table filtered by equality on context values
    Table {
        table: String,
        filter: IndexMap<String, ContextVar>,
        scan: CompiledQuery,
    },
    /// Arbitrary read-only query with named parameters
    Query {
        template: CompiledQuery,
        params: IndexMap<String, ContextVar>,
    },
    /// Grouping element; emits one value-less record carrying its children
    None,
}

impl SourceBinding {
    pub fn is_sourced(&self) -> bool {
        !matches!(self, SourceBinding::None)
    }

    pub fn compiled(&self) -> Option<&CompiledQuery> {
        match self {
            SourceBinding::Table { scan, .. } => Some(scan),
            SourceBinding::Query { template, .. } => Some(template),
            SourceBinding::None => None,
        }
    }

    /// Filter columns or query parameters with their context variables.
    pub fn context_vars(&self) -> impl Iterator<Item = (&str, ContextVar)> {
        let vars = match self {
            SourceBinding::Table { filter, .. } => Some(filter),
            SourceBinding::Query { params, .. } => Some(params),
            SourceBinding::None => None,
        };
        vars.into_iter()
            .flat_map(|map| map.iter().map(|(name, var)| (name.as_str(), *var)))
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            SourceBinding::Table { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// Binding as declared, before compilation.
#[derive(Debug, Clone, Default)]
pub(crate) enum DeclaredBinding {
    Table {
        table: String,
        filter: IndexMap<String, ContextVar>,
    },
    Query {
        template: String,
        params: IndexMap<String, ContextVar>,
    },
    #[default]
    None,
}

impl DeclaredBinding {
    pub(crate) fn uses(&self, var: ContextVar) -> bool {
        match self {
            DeclaredBinding::Table { filter, .. } => filter.values().any(|v| *v == var),
            DeclaredBinding::Query { params, .. } => params.values().any(|v| *v == var),
            DeclaredBinding::None => false,
        }
    }

    pub(crate) fn compile(
        self,
        table_prefix: &str,
        keys: &[String],
    ) -> Result<SourceBinding, BindingError> {
        match self {
            DeclaredBinding::Table { table, filter } => {
                let scan = compile_table_scan(table_prefix, &table, &filter, keys)?;
                Ok(SourceBinding::Table {
                    table,
                    filter,
                    scan,
                })
            }
            DeclaredBinding::Query { template, params } => {
                let template = compile_query(table_prefix, &template, &params)?;
                Ok(SourceBinding::Query { template, params })
            }
            DeclaredBinding::None => Ok(SourceBinding::None),
        }
    }
}

static TABLE_REFERENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("valid regex"));

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quoted, prefixed table name.
pub fn qualified_table(table_prefix: &str, table: &str) -> String {
    quote_identifier(&format!("{}{}", table_prefix, table))
}

fn compile_table_scan(
    table_prefix: &str,
    table: &str,
    filter: &IndexMap<String, ContextVar>,
    keys: &[String],
) -> Result<CompiledQuery, BindingError> {
    if table.trim().is_empty() {
        return Err(BindingError::EmptyTableName);
    }

    let mut sql = format!("SELECT * FROM {}", qualified_table(table_prefix, table));
    let conditions: Vec<String> = filter
        .keys()
        .enumerate()
        .map(|(idx, column)| format!("{} = ${}", quote_identifier(column), idx + 1))
        .collect();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if !keys.is_empty() {
        let order: Vec<String> = keys.iter().map(|k| quote_identifier(k)).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }

    Ok(CompiledQuery {
        sql,
        parameter_order: filter.keys().cloned().collect(),
    })
}

fn compile_query(
    table_prefix: &str,
    template: &str,
    params: &IndexMap<String, ContextVar>,
) -> Result<CompiledQuery, BindingError> {
    let expanded = expand_table_references(table_prefix, template);
    let rewritten = rewrite_named(&expanded).map_err(|e| match e {
        BindError::PositionalPlaceholder(pos) => BindingError::PositionalPlaceholder(pos),
        BindError::MissingParameter(name) => BindingError::UnboundParameter(name),
    })?;

    validate_read_only(&rewritten.sql)?;

    if let Some(unbound) = rewritten
        .parameter_order
        .iter()
        .find(|name| !params.contains_key(name.as_str()))
    {
        return Err(BindingError::UnboundParameter(unbound.clone()));
    }
    if let Some(unused) = params
        .keys()
        .find(|name| !rewritten.parameter_order.contains(name))
    {
        return Err(BindingError::UnusedParameter(unused.clone()));
    }

    Ok(CompiledQuery {
        sql: rewritten.sql,
        parameter_order: rewritten.parameter_order,
    })
}

/// Replaces `{table}` with the quoted, prefixed table name outside of
/// literals and comments.
fn expand_table_references(table_prefix: &str, template: &str) -> String {
    let masked = mask_strings_and_comments(template);
    let mut result = String::with_capacity(template.len());
    let mut last_end = 0;

    for cap in TABLE_REFERENCE_REGEX.captures_iter(&masked) {
        let (Some(full), Some(name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        result.push_str(&template[last_end..full.start()]);
        result.push_str(&qualified_table(table_prefix, name.as_str()));
        last_end = full.end();
    }
    result.push_str(&template[last_end..]);
    result
}
