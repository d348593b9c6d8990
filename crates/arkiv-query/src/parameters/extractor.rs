//! SQL Parameter Extractor
//!
//! Finds parameter placeholders in query templates. Only colon-named
//! parameters are bindable; positional placeholders are reported so a
//! template using them can be rejected up front.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// A parameter placeholder found in a SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// A named parameter like `:quizid`.
    Named(String),
    /// A positional parameter like `$1` or `?`.
    Positional(usize),
}

impl Parameter {
    pub fn is_named(&self) -> bool {
        matches!(self, Parameter::Named(_))
    }
}

pub(super) static COLON_NAMED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^:]):([a-zA-Z_][a-zA-Z0-9_]*)").expect("valid regex"));

static DOLLAR_POSITIONAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("valid regex"));

static QUESTION_MARK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?").expect("valid regex"));

// String literals, quoted identifiers and comments
static SKIPPED_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|/\*[\s\S]*?\*/"#).expect("valid regex")
});

/// Extracts the unique parameters of a SQL text, in order of first occurrence.
///
/// Placeholders inside string literals, quoted identifiers and comments are
/// ignored. A doubled colon (`::`) is never the start of a parameter.
///
/// ```
/// use arkiv_query::parameters::{extract_parameters, Parameter};
///
/// let params = extract_parameters("SELECT * FROM t WHERE a = :a AND b = :b OR c = :a");
/// assert_eq!(params, vec![Parameter::Named("a".into()), Parameter::Named("b".into())]);
/// ```
pub fn extract_parameters(sql: &str) -> Vec<Parameter> {
    let masked_sql = mask_strings_and_comments(sql);

    let mut parameters: Vec<Parameter> = Vec::new();
    let mut seen: HashSet<Parameter> = HashSet::new();
    let mut push = |param: Parameter| {
        if seen.insert(param.clone()) {
            parameters.push(param);
        }
    };

    for cap in COLON_NAMED_REGEX.captures_iter(&masked_sql) {
        if let Some(name_match) = cap.get(2) {
            push(Parameter::Named(name_match.as_str().to_string()));
        }
    }

    for cap in DOLLAR_POSITIONAL_REGEX.captures_iter(&masked_sql) {
        if let Some(num_match) = cap.get(1)
            && let Ok(position) = num_match.as_str().parse::<usize>()
        {
            push(Parameter::Positional(position));
        }
    }

    let question_count = QUESTION_MARK_REGEX.find_iter(&masked_sql).count();
    for i in 1..=question_count {
        push(Parameter::Positional(i));
    }

    parameters
}

/// Replaces string literals, quoted identifiers and comments with spaces.
///
/// Byte offsets are preserved, so matches found in the masked text can be
/// applied to the original.
pub fn mask_strings_and_comments(sql: &str) -> String {
    SKIPPED_REGEX
        .replace_all(sql, |caps: &regex::Captures| " ".repeat(caps[0].len()))
        .into_owned()
}
