//! TOML schema files
//!
//! A schema file describes the element tree declaratively and is replayed
//! through [`SchemaBuilder`], so it is validated exactly like a tree built
//! in code.
//!
//! ```toml
//! [root]
//! name = "studentquiz"
//! keys = ["id"]
//! data = ["name", "intro"]
//! id_mapping = { attribute = "id", entity_type = "studentquiz" }
//! source = { table = "studentquiz", filter = { id = "activity_id" } }
//! files = [{ component = "mod_studentquiz", file_area = "intro" }]
//!
//! [[root.children]]
//! name = "question"
//! keys = ["id"]
//! data = ["studentquizid", "groupid"]
//! restore_table = "studentquiz_question"
//! source = { query = "SELECT * FROM {studentquiz_question} WHERE studentquizid = :sqid", params = { sqid = "parent_id" } }
//! ids = [{ attribute = "groupid", entity_type = "group", policy = { policy = "optional" } }]
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use super::{ContextVar, ElementId, ReferencePolicy, Schema, SchemaBuilder, SchemaError};

#[derive(Debug, Error)]
pub enum SchemaFileError {
    #[error("failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid schema in element '{element}': {source}")]
    Invalid {
        element: String,
        #[source]
        source: SchemaError,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaFile {
    pub root: ElementSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementSpec {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub ids: Vec<IdSpec>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub user_data: bool,
    #[serde(default)]
    pub id_mapping: Option<IdMappingSpec>,
    #[serde(default)]
    pub restore_table: Option<String>,
    #[serde(default)]
    pub children: Vec<ElementSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Table {
        table: String,
        #[serde(default)]
        filter: IndexMap<String, ContextVar>,
    },
    Query {
        query: String,
        #[serde(default)]
        params: IndexMap<String, ContextVar>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdSpec {
    pub attribute: String,
    pub entity_type: String,
    #[serde(default)]
    pub policy: ReferencePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSpec {
    pub component: String,
    pub file_area: String,
    #[serde(default)]
    pub item_id_attribute: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdMappingSpec {
    pub attribute: String,
    pub entity_type: String,
}

impl SchemaFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaFileError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SchemaFileError> {
        Ok(toml::from_str(text)?)
    }

    /// Replays the file through a builder and builds the schema.
    pub fn build(&self, table_prefix: &str) -> Result<Schema, SchemaFileError> {
        let mut builder = SchemaBuilder::new().with_table_prefix(table_prefix);
        declare(&mut builder, &self.root, None)?;
        builder.build().map_err(|source| SchemaFileError::Invalid {
            element: self.root.name.clone(),
            source,
        })
    }
}

fn declare(
    builder: &mut SchemaBuilder,
    spec: &ElementSpec,
    parent: Option<ElementId>,
) -> Result<ElementId, SchemaFileError> {
    let invalid = |source: super::ConstructionError| SchemaFileError::Invalid {
        element: spec.name.clone(),
        source: source.into(),
    };

    let el = builder.element(&spec.name);
    if let Some(parent) = parent {
        builder.add_child(parent, el).map_err(invalid)?;
    }
    if !spec.keys.is_empty() {
        builder.define_keys(el, &spec.keys).map_err(invalid)?;
    }
    if !spec.data.is_empty() {
        builder.define_data(el, &spec.data).map_err(invalid)?;
    }

    match &spec.source {
        Some(SourceSpec::Table { table, filter }) => builder
            .bind_table(el, table, filter.iter().map(|(k, v)| (k, *v)))
            .map_err(invalid)?,
        Some(SourceSpec::Query { query, params }) => builder
            .bind_query(el, query, params.iter().map(|(k, v)| (k, *v)))
            .map_err(invalid)?,
        None => {}
    }

    for id in &spec.ids {
        builder
            .annotate_ids_with(el, &id.attribute, &id.entity_type, id.policy.clone())
            .map_err(invalid)?;
    }
    for file in &spec.files {
        builder
            .annotate_files(
                el,
                &file.component,
                &file.file_area,
                file.item_id_attribute.as_deref(),
            )
            .map_err(invalid)?;
    }
    if spec.user_data {
        builder.mark_user_data(el).map_err(invalid)?;
    }
    if let Some(mapping) = &spec.id_mapping {
        builder
            .id_mapping(el, &mapping.attribute, &mapping.entity_type)
            .map_err(invalid)?;
    }
    if let Some(table) = &spec.restore_table {
        builder.restore_table(el, table).map_err(invalid)?;
    }

    for child in &spec.children {
        declare(builder, child, Some(el))?;
    }
    Ok(el)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ConstructionError, SourceBinding};

    const QUIZ: &str = r#"
        [root]
        name = "studentquiz"
        keys = ["id"]
        data = ["name"]
        id_mapping = { attribute = "id", entity_type = "studentquiz" }
        source = { table = "studentquiz", filter = { id = "activity_id" } }

        [[root.children]]
        name = "questions"

        [[root.children.children]]
        name = "question"
        keys = ["id"]
        data = ["studentquizid", "groupid"]
        restore_table = "studentquiz_question"
        source = { query = "SELECT * FROM {studentquiz_question} WHERE studentquizid = :sqid", params = { sqid = "parent_id" } }
        ids = [{ attribute = "groupid", entity_type = "group", policy = { policy = "optional" } }]
    "#;

    #[test]
    fn test_schema_file_builds_tree() {
        let schema = SchemaFile::from_toml_str(QUIZ).unwrap().build("mdl_").unwrap();

        let question = schema.find("studentquiz/questions/question").unwrap();
        let el = schema.element(question);
        assert_eq!(el.target_table(), Some("studentquiz_question"));
        assert_eq!(
            el.id_annotations["groupid"].policy,
            ReferencePolicy::optional_null()
        );
        match &el.source {
            SourceBinding::Query { template, .. } => assert_eq!(
                template.sql,
                r#"SELECT * FROM "mdl_studentquiz_question" WHERE studentquizid = $1"#
            ),
            other => panic!("unexpected binding: {:?}", other),
        }
    }

    #[test]
    fn test_schema_file_reports_element() {
        let text = r#"
            [root]
            name = "quiz"
            keys = ["id"]
            data = ["id"]
            source = { table = "quiz" }
        "#;
        let err = SchemaFile::from_toml_str(text).unwrap().build("").unwrap_err();
        match err {
            SchemaFileError::Invalid { element, source } => {
                assert_eq!(element, "quiz");
                assert!(matches!(
                    source,
                    SchemaError::Construction(ConstructionError::OverlappingAttributes { .. })
                ));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = r#"
            [root]
            name = "quiz"
            colour = "blue"
        "#;
        assert!(matches!(
            SchemaFile::from_toml_str(text),
            Err(SchemaFileError::Parse(_))
        ));
    }
}
