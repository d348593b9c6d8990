//! SQL Parameter Extraction and Binding
//!
//! Query templates use colon-named parameters (`:name`). Positional styles
//! (`$1`, `?`) are detected so callers can reject them.
//!
//! # Example
//!
//! ```
//! use arkiv_query::parameters::{extract_parameters, Parameter};
//!
//! let params = extract_parameters("SELECT * FROM quiz WHERE id = :quizid");
//! assert_eq!(params, vec![Parameter::Named("quizid".into())]);
//! ```

pub mod binder;
mod extractor;

pub use binder::{BindError, BindResult, RewrittenQuery, rewrite_named};
pub use extractor::{Parameter, extract_parameters, mask_strings_and_comments};
