//! Arkiv Query - compile-time handling of SQL text used as data sources
//!
//! - [`parameters`]: extraction of `:name` placeholders and their rewriting into
//!   positional placeholders bound from a name → value map
//! - [`statement`]: structural validation that a text is one read-only statement

pub mod parameters;
pub mod statement;

pub use parameters::{BindError, BindResult, Parameter, RewrittenQuery, rewrite_named};
pub use statement::{StatementError, validate_read_only};
