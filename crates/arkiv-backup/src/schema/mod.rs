//! Element tree declaration
//!
//! A [`SchemaBuilder`] collects elements, their attributes, bindings and
//! annotations through mutable builder calls. [`SchemaBuilder::build`]
//! validates the whole tree at once and returns an immutable [`Schema`],
//! which is what the backup and restore engines walk.
//!
//! # Example
//!
//! ```
//! use arkiv_backup::schema::{ContextVar, SchemaBuilder};
//!
//! let mut builder = SchemaBuilder::new();
//! let quiz = builder.element("studentquiz");
//! builder.define_keys(quiz, ["id"]).unwrap();
//! builder.define_data(quiz, ["name"]).unwrap();
//! builder
//!     .bind_table(quiz, "studentquiz", [("id", ContextVar::ActivityId)])
//!     .unwrap();
//!
//! let schema = builder.build().unwrap();
//! assert_eq!(schema.element(schema.root()).name, "studentquiz");
//! ```

mod annotation;
mod binding;
mod file;

pub use annotation::{FileAnnotation, IdAnnotation, IdMapping, ReferencePolicy};
pub use binding::{
    BindingError, CompiledQuery, ContextVar, SourceBinding, qualified_table, quote_identifier,
};
pub use file::{ElementSpec, SchemaFile, SchemaFileError, SourceSpec};

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

use binding::DeclaredBinding;

/// Handle to an element inside a [`SchemaBuilder`] or [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(usize);

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structural defects in a schema declaration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConstructionError {
    #[error("element {0} does not belong to this schema")]
    UnknownElement(ElementId),

    #[error("element '{child}' already has a parent")]
    DuplicateParent { child: String },

    #[error("element '{0}' cannot be its own child")]
    SelfParent(String),

    #[error("attaching '{child}' under '{parent}' would form a cycle")]
    Cycle { parent: String, child: String },

    #[error("element '{parent}' already has a child named '{name}'")]
    DuplicateSiblingName { parent: String, name: String },

    #[error("keys of element '{0}' are already defined")]
    KeysAlreadyDefined(String),

    #[error("data attributes of element '{0}' are already defined")]
    DataAlreadyDefined(String),

    #[error("attribute '{attribute}' of element '{element}' is both a key and a data attribute")]
    OverlappingAttributes { element: String, attribute: String },

    #[error("attribute '{attribute}' is listed twice on element '{element}'")]
    DuplicateAttribute { element: String, attribute: String },

    #[error("element '{0}' has a data source but no key attributes")]
    MissingKeys(String),

    #[error("schema has no root element")]
    NoRoot,

    #[error("schema has several root elements: {}", .0.join(", "))]
    MultipleRoots(Vec<String>),

    #[error("root element '{0}' has no data source")]
    RootWithoutSource(String),

    #[error("root element '{0}' cannot bind to the parent id")]
    RootUsesParentId(String),

    #[error("element '{element}' annotates undeclared attribute '{attribute}'")]
    UnknownAttribute { element: String, attribute: String },
}

/// Any reason [`SchemaBuilder::build`] can fail.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error("invalid source binding on element '{element}': {source}")]
    Binding {
        element: String,
        #[source]
        source: BindingError,
    },
}

/// One node of a built schema.
#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub keys: Vec<String>,
    pub data: Vec<String>,
    pub children: Vec<ElementId>,
    pub parent: Option<ElementId>,
    pub source: SourceBinding,
    /// Keyed by attribute name
    pub id_annotations: IndexMap<String, IdAnnotation>,
    pub file_annotations: Vec<FileAnnotation>,
    pub user_data: bool,
    pub id_mapping: Option<IdMapping>,
    pub restore_table: Option<String>,
}

impl Element {
    /// Keys then data, in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().chain(self.data.iter()).map(String::as_str)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes().any(|a| a == name)
    }

    /// Attribute whose value identifies a record of this element: the id
    /// mapping attribute, else a key named `id`, else the first key.
    pub fn identity_attribute(&self) -> Option<&str> {
        if let Some(mapping) = &self.id_mapping {
            return Some(&mapping.attribute);
        }
        self.keys
            .iter()
            .find(|k| k.as_str() == "id")
            .or_else(|| self.keys.first())
            .map(String::as_str)
    }

    /// Table that restore writes this element's records into.
    pub fn target_table(&self) -> Option<&str> {
        self.restore_table.as_deref().or_else(|| self.source.table())
    }
}

/// A validated, immutable element tree.
#[derive(Debug, Clone)]
pub struct Schema {
    elements: Vec<Element>,
    root: ElementId,
    table_prefix: String,
}

impl Schema {
    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[id.0]
    }

    pub fn children(&self, id: ElementId) -> impl Iterator<Item = (ElementId, &Element)> {
        self.element(id)
            .children
            .iter()
            .map(|child| (*child, self.element(*child)))
    }

    /// Child of `parent` with the given name.
    pub fn child_by_name(&self, parent: ElementId, name: &str) -> Option<ElementId> {
        self.children(parent)
            .find(|(_, el)| el.name == name)
            .map(|(id, _)| id)
    }

    /// Element at a slash-separated path from the root, e.g.
    /// `studentquiz/comments/comment`.
    pub fn find(&self, path: &str) -> Option<ElementId> {
        let mut segments = path.split('/');
        let first = segments.next()?;
        if self.element(self.root).name != first {
            return None;
        }
        segments.try_fold(self.root, |current, name| self.child_by_name(current, name))
    }

    /// Slash-separated names from the root down to `id`.
    pub fn path(&self, id: ElementId) -> String {
        let mut names = vec![self.element(id).name.as_str()];
        let mut current = self.element(id).parent;
        while let Some(parent) = current {
            names.push(&self.element(parent).name);
            current = self.element(parent).parent;
        }
        names.reverse();
        names.join("/")
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    /// Elements in depth-first pre-order.
    pub fn iter(&self) -> impl Iterator<Item = (ElementId, &Element)> {
        let mut stack = vec![self.root];
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            stack.extend(self.element(id).children.iter().rev().copied());
            Some((id, self.element(id)))
        })
    }
}

#[derive(Debug, Default)]
struct ElementDraft {
    name: String,
    keys: Option<Vec<String>>,
    data: Option<Vec<String>>,
    children: Vec<ElementId>,
    parent: Option<ElementId>,
    binding: DeclaredBinding,
    id_annotations: IndexMap<String, IdAnnotation>,
    file_annotations: Vec<FileAnnotation>,
    user_data: bool,
    id_mapping: Option<IdMapping>,
    restore_table: Option<String>,
}

/// Mutable declaration of an element tree.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    drafts: Vec<ElementDraft>,
    table_prefix: String,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix prepended to every table name in scans and `{table}` references.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Declares a new, unattached element.
    pub fn element(&mut self, name: impl Into<String>) -> ElementId {
        self.drafts.push(ElementDraft {
            name: name.into(),
            ..Default::default()
        });
        ElementId(self.drafts.len() - 1)
    }

    /// Appends `child` to the ordered children of `parent`.
    pub fn add_child(
        &mut self,
        parent: ElementId,
        child: ElementId,
    ) -> Result<(), ConstructionError> {
        self.check(parent)?;
        self.check(child)?;

        if parent == child {
            return Err(ConstructionError::SelfParent(self.name(child)));
        }
        if self.drafts[child.0].parent.is_some() {
            return Err(ConstructionError::DuplicateParent {
                child: self.name(child),
            });
        }

        let mut ancestor = self.drafts[parent.0].parent;
        while let Some(current) = ancestor {
            if current == child {
                return Err(ConstructionError::Cycle {
                    parent: self.name(parent),
                    child: self.name(child),
                });
            }
            ancestor = self.drafts[current.0].parent;
        }

        let child_name = &self.drafts[child.0].name;
        if self.drafts[parent.0]
            .children
            .iter()
            .any(|sibling| &self.drafts[sibling.0].name == child_name)
        {
            return Err(ConstructionError::DuplicateSiblingName {
                parent: self.name(parent),
                name: self.name(child),
            });
        }

        self.drafts[child.0].parent = Some(parent);
        self.drafts[parent.0].children.push(child);
        Ok(())
    }

    pub fn define_keys<I, S>(&mut self, el: ElementId, names: I) -> Result<(), ConstructionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check(el)?;
        if self.drafts[el.0].keys.is_some() {
            return Err(ConstructionError::KeysAlreadyDefined(self.name(el)));
        }
        let names = self.unique_attributes(el, names)?;
        self.check_disjoint(el, &names, self.drafts[el.0].data.as_deref())?;
        self.drafts[el.0].keys = Some(names);
        Ok(())
    }

    pub fn define_data<I, S>(&mut self, el: ElementId, names: I) -> Result<(), ConstructionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check(el)?;
        if self.drafts[el.0].data.is_some() {
            return Err(ConstructionError::DataAlreadyDefined(self.name(el)));
        }
        let names = self.unique_attributes(el, names)?;
        self.check_disjoint(el, &names, self.drafts[el.0].keys.as_deref())?;
        self.drafts[el.0].data = Some(names);
        Ok(())
    }

    /// Binds the element to a scan of `table`, filtered by equality on each
    /// column's context value. Replaces any earlier binding.
    pub fn bind_table<I, S>(
        &mut self,
        el: ElementId,
        table: impl Into<String>,
        filter: I,
    ) -> Result<(), ConstructionError>
    where
        I: IntoIterator<Item = (S, ContextVar)>,
        S: Into<String>,
    {
        self.check(el)?;
        self.drafts[el.0].binding = DeclaredBinding::Table {
            table: table.into(),
            filter: filter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        Ok(())
    }

    /// Binds the element to a read-only query template with `:name`
    /// parameters. Replaces any earlier binding.
    pub fn bind_query<I, S>(
        &mut self,
        el: ElementId,
        template: impl Into<String>,
        params: I,
    ) -> Result<(), ConstructionError>
    where
        I: IntoIterator<Item = (S, ContextVar)>,
        S: Into<String>,
    {
        self.check(el)?;
        self.drafts[el.0].binding = DeclaredBinding::Query {
            template: template.into(),
            params: params.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        Ok(())
    }

    /// Marks `attribute` as a required reference into `entity_type`.
    pub fn annotate_ids(
        &mut self,
        el: ElementId,
        attribute: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Result<(), ConstructionError> {
        self.annotate_ids_with(el, attribute, entity_type, ReferencePolicy::Required)
    }

    pub fn annotate_ids_with(
        &mut self,
        el: ElementId,
        attribute: impl Into<String>,
        entity_type: impl Into<String>,
        policy: ReferencePolicy,
    ) -> Result<(), ConstructionError> {
        self.check(el)?;
        let attribute = attribute.into();
        self.drafts[el.0].id_annotations.insert(
            attribute.clone(),
            IdAnnotation {
                attribute,
                entity_type: entity_type.into(),
                policy,
            },
        );
        Ok(())
    }

    /// Marks the `file_area` attribute as content stored under
    /// `component/file_area`, optionally keyed per record.
    pub fn annotate_files(
        &mut self,
        el: ElementId,
        component: impl Into<String>,
        file_area: impl Into<String>,
        item_id_attribute: Option<&str>,
    ) -> Result<(), ConstructionError> {
        self.check(el)?;
        let annotation = FileAnnotation {
            component: component.into(),
            file_area: file_area.into(),
            item_id_attribute: item_id_attribute.map(str::to_string),
        };
        let files = &mut self.drafts[el.0].file_annotations;
        if !files.contains(&annotation) {
            files.push(annotation);
        }
        Ok(())
    }

    /// Marks the element's subtree as user data.
    pub fn mark_user_data(&mut self, el: ElementId) -> Result<(), ConstructionError> {
        self.check(el)?;
        self.drafts[el.0].user_data = true;
        Ok(())
    }

    /// Declares `attribute` as the record's own identity within `entity_type`.
    pub fn id_mapping(
        &mut self,
        el: ElementId,
        attribute: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Result<(), ConstructionError> {
        self.check(el)?;
        self.drafts[el.0].id_mapping = Some(IdMapping {
            attribute: attribute.into(),
            entity_type: entity_type.into(),
        });
        Ok(())
    }

    /// Table that restore inserts into, for elements bound to a query.
    pub fn restore_table(
        &mut self,
        el: ElementId,
        table: impl Into<String>,
    ) -> Result<(), ConstructionError> {
        self.check(el)?;
        self.drafts[el.0].restore_table = Some(table.into());
        Ok(())
    }

    /// Validates the declaration and compiles every binding.
    pub fn build(self) -> Result<Schema, SchemaError> {
        let roots: Vec<usize> = self
            .drafts
            .iter()
            .enumerate()
            .filter(|(_, d)| d.parent.is_none())
            .map(|(idx, _)| idx)
            .collect();
        let root = match roots.as_slice() {
            [] => return Err(ConstructionError::NoRoot.into()),
            [root] => ElementId(*root),
            _ => {
                let names = roots.iter().map(|r| self.drafts[*r].name.clone()).collect();
                return Err(ConstructionError::MultipleRoots(names).into());
            }
        };

        let root_draft = &self.drafts[root.0];
        if matches!(root_draft.binding, DeclaredBinding::None) {
            return Err(ConstructionError::RootWithoutSource(root_draft.name.clone()).into());
        }
        if root_draft.binding.uses(ContextVar::ParentId) {
            return Err(ConstructionError::RootUsesParentId(root_draft.name.clone()).into());
        }

        let table_prefix = self.table_prefix;
        let mut elements = Vec::with_capacity(self.drafts.len());
        for draft in self.drafts {
            elements.push(finish_element(draft, &table_prefix)?);
        }

        tracing::debug!(elements = elements.len(), "schema built");
        Ok(Schema {
            elements,
            root,
            table_prefix,
        })
    }

    fn check(&self, el: ElementId) -> Result<(), ConstructionError> {
        if el.0 < self.drafts.len() {
            Ok(())
        } else {
            Err(ConstructionError::UnknownElement(el))
        }
    }

    fn name(&self, el: ElementId) -> String {
        self.drafts[el.0].name.clone()
    }

    fn unique_attributes<I, S>(
        &self,
        el: ElementId,
        names: I,
    ) -> Result<Vec<String>, ConstructionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = IndexSet::new();
        for name in names {
            let name = name.into();
            if !seen.insert(name.clone()) {
                return Err(ConstructionError::DuplicateAttribute {
                    element: self.name(el),
                    attribute: name,
                });
            }
        }
        Ok(seen.into_iter().collect())
    }

    fn check_disjoint(
        &self,
        el: ElementId,
        names: &[String],
        other: Option<&[String]>,
    ) -> Result<(), ConstructionError> {
        if let Some(overlap) = other
            .into_iter()
            .flatten()
            .find(|attr| names.contains(attr))
        {
            return Err(ConstructionError::OverlappingAttributes {
                element: self.name(el),
                attribute: overlap.clone(),
            });
        }
        Ok(())
    }
}

fn finish_element(draft: ElementDraft, table_prefix: &str) -> Result<Element, SchemaError> {
    let keys = draft.keys.unwrap_or_default();
    let data = draft.data.unwrap_or_default();
    let declared = |attr: &str| keys.iter().chain(data.iter()).any(|a| a == attr);
    let unknown = |attribute: &str| ConstructionError::UnknownAttribute {
        element: draft.name.clone(),
        attribute: attribute.to_string(),
    };

    if !matches!(draft.binding, DeclaredBinding::None) && keys.is_empty() {
        return Err(ConstructionError::MissingKeys(draft.name.clone()).into());
    }
    if let Some(attr) = draft.id_annotations.keys().find(|a| !declared(a)) {
        return Err(unknown(attr).into());
    }
    for files in &draft.file_annotations {
        if !declared(&files.file_area) {
            return Err(unknown(&files.file_area).into());
        }
        if let Some(item) = &files.item_id_attribute
            && !declared(item)
        {
            return Err(unknown(item).into());
        }
    }
    if let Some(mapping) = &draft.id_mapping
        && !declared(&mapping.attribute)
    {
        return Err(unknown(&mapping.attribute).into());
    }

    let source = draft
        .binding
        .compile(table_prefix, &keys)
        .map_err(|source| SchemaError::Binding {
            element: draft.name.clone(),
            source,
        })?;

    Ok(Element {
        name: draft.name,
        keys,
        data,
        children: draft.children,
        parent: draft.parent,
        source,
        id_annotations: draft.id_annotations,
        file_annotations: draft.file_annotations,
        user_data: draft.user_data,
        id_mapping: draft.id_mapping,
        restore_table: draft.restore_table,
    })
}
