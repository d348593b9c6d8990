//! Restore
//!
//! [`Restorer`] replays a [`BackupDocument`] against the schema it was taken
//! with. Records are inserted parent first; every annotated reference is
//! rewritten through the [`MigrationRegistry`], and every record with an id
//! mapping registers the id the database assigned to it, so later records
//! (and later jobs sharing the registry) can refer to it.
//!
//! Optional references to entities that are restored later in the same job
//! are written with their default first and fixed up once all rows exist.

use std::sync::Arc;

use arkiv_core::{ArkivError, Connection, StatementResult, Transaction, Value};
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use thiserror::Error;

use crate::content::{ContentStore, LinkRewriter, StorageCopyError, StorageFailurePolicy};
use crate::context::Frame;
use crate::document::{BackupDocument, ElementData, IdManifest, RecordData};
use crate::registry::{MigrationRegistry, RegistryError};
use crate::scalar::Scalar;
use crate::schema::{
    ContextVar, Element, ElementId, FileAnnotation, ReferencePolicy, Schema, SourceBinding,
    qualified_table, quote_identifier,
};
use crate::settings::RestoreOptions;

#[derive(Debug, Error)]
pub enum RestoreError {
    /// A required reference has no entry in the registry. Drops the record.
    #[error(
        "'{element}.{attribute}' refers to {entity_type} {value}, which has not been restored"
    )]
    UnresolvedReference {
        element: String,
        attribute: String,
        entity_type: String,
        value: Scalar,
    },

    /// Content copy failed under [`StorageFailurePolicy::DropRecord`].
    #[error("content of '{element}.{attribute}' could not be copied: {source}")]
    StorageCopy {
        element: String,
        attribute: String,
        #[source]
        source: StorageCopyError,
    },

    #[error("document root '{found}' does not match schema root '{expected}'")]
    RootMismatch { expected: String, found: String },

    #[error("document root holds {0} records, expected exactly one")]
    RootRecordCount(usize),

    #[error("element '{0}' has no table to restore into")]
    NoRestoreTable(String),

    #[error("database did not report an id for the row inserted for '{0}'")]
    MissingInsertId(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("writing '{element}' failed: {source}")]
    Database {
        element: String,
        #[source]
        source: ArkivError,
    },

    #[error("transaction error: {0}")]
    Transaction(#[from] ArkivError),
}

impl RestoreError {
    /// Whether the error only affects the record being restored.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            RestoreError::UnresolvedReference { .. } | RestoreError::StorageCopy { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreWarningKind {
    UnresolvedReference,
    StorageCopy,
    UnknownElement,
    UnresolvedDeferredReference,
}

/// A problem that did not stop the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreWarning {
    /// Element path
    pub element: String,
    pub attribute: Option<String>,
    pub kind: RestoreWarningKind,
    pub message: String,
}

impl RestoreWarning {
    fn from_error(err: &RestoreError) -> Option<Self> {
        let (element, attribute, kind) = match err {
            RestoreError::UnresolvedReference {
                element, attribute, ..
            } => (element, attribute, RestoreWarningKind::UnresolvedReference),
            RestoreError::StorageCopy {
                element, attribute, ..
            } => (element, attribute, RestoreWarningKind::StorageCopy),
            _ => return None,
        };
        Some(Self {
            element: element.clone(),
            attribute: Some(attribute.clone()),
            kind,
            message: err.to_string(),
        })
    }
}

/// Job-level values for a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreJob {
    /// Course module the restored activity belongs to; columns bound to the
    /// module id keep their backed-up value when `None`
    pub course_module_id: Option<i64>,
    pub include_user_data: bool,
}

impl Default for RestoreJob {
    fn default() -> Self {
        Self {
            course_module_id: None,
            include_user_data: true,
        }
    }
}

impl RestoreJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_course_module(mut self, course_module_id: i64) -> Self {
        self.course_module_id = Some(course_module_id);
        self
    }

    pub fn without_user_data(mut self) -> Self {
        self.include_user_data = false;
        self
    }
}

/// What a restore job wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreResult {
    /// New id of the root record
    pub activity_id: Option<i64>,
    /// Rows inserted per element path
    pub rows_restored: IndexMap<String, u64>,
    /// Records not written, subtrees included
    pub records_dropped: u64,
    /// References fixed up after all rows were written
    pub deferred_updates: u64,
    /// Element paths not restored because they hold user data
    pub pruned: Vec<String>,
    pub warnings: Vec<RestoreWarning>,
}

impl RestoreResult {
    pub fn total_rows(&self) -> u64 {
        self.rows_restored.values().sum()
    }

    pub fn warnings_of(&self, kind: RestoreWarningKind) -> impl Iterator<Item = &RestoreWarning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }
}

/// Restores backup documents into one connection.
pub struct Restorer {
    connection: Arc<dyn Connection>,
    options: RestoreOptions,
    content: Arc<dyn ContentStore>,
}

impl Restorer {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            options: RestoreOptions::default(),
            content: Arc::new(LinkRewriter::new()),
        }
    }

    pub fn with_options(mut self, options: RestoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_content_store(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = content;
        self
    }

    /// Restores `document` as a new activity instance.
    ///
    /// Entities restored outside this job (users, groups, ...) must already
    /// be in `registry`; the mappings this job creates are added to it.
    #[tracing::instrument(skip_all, fields(root = %document.root.name))]
    pub async fn restore(
        &self,
        schema: &Schema,
        document: &BackupDocument,
        job: &RestoreJob,
        registry: &mut dyn MigrationRegistry,
    ) -> Result<RestoreResult, RestoreError> {
        check_document(schema, document)?;

        let executor = if self.options.use_transaction {
            Executor::Transaction(self.connection.begin_transaction().await?)
        } else {
            Executor::Connection(Arc::clone(&self.connection))
        };

        let mut walker = RestoreWalker {
            schema,
            job,
            options: &self.options,
            content: self.content.as_ref(),
            executor: &executor,
            registry,
            own_ids: collect_own_ids(schema, document, job),
            activity_id: None,
            deferred: Vec::new(),
            unknown_seen: IndexSet::new(),
            result: RestoreResult::default(),
        };

        let outcome = match walker.walk_root(&document.root).await {
            Ok(()) => walker.apply_deferred().await,
            Err(err) => Err(err),
        };
        let result = std::mem::take(&mut walker.result);
        drop(walker);

        if let Err(err) = outcome {
            if let Err(rollback_err) = executor.rollback().await {
                tracing::error!(error = %rollback_err, "rollback after failed restore failed");
            }
            return Err(err);
        }
        executor.commit().await?;

        tracing::info!(
            activity_id = ?result.activity_id,
            rows = result.total_rows(),
            dropped = result.records_dropped,
            warnings = result.warnings.len(),
            "restore complete"
        );
        Ok(result)
    }
}

fn check_document(schema: &Schema, document: &BackupDocument) -> Result<(), RestoreError> {
    let root = schema.element(schema.root());
    if document.root.name != root.name {
        return Err(RestoreError::RootMismatch {
            expected: root.name.clone(),
            found: document.root.name.clone(),
        });
    }
    if document.root.records.len() != 1 {
        return Err(RestoreError::RootRecordCount(document.root.records.len()));
    }
    if let Some((id, _)) = schema
        .iter()
        .find(|(_, el)| el.source.is_sourced() && el.target_table().is_none())
    {
        return Err(RestoreError::NoRestoreTable(schema.path(id)));
    }
    Ok(())
}

/// Ids of every record with an id mapping that the job will restore.
fn collect_own_ids(schema: &Schema, document: &BackupDocument, job: &RestoreJob) -> IdManifest {
    let mut ids = IdManifest::default();
    let mut stack = vec![(schema.root(), &document.root)];
    while let Some((id, data)) = stack.pop() {
        let element = schema.element(id);
        for record in &data.records {
            if let Some(mapping) = &element.id_mapping
                && let Some(own_id) = record.get(&mapping.attribute).and_then(Scalar::as_i64)
            {
                ids.insert(&mapping.entity_type, own_id);
            }
            for (child_id, child) in schema.children(id) {
                if child.user_data && !job.include_user_data {
                    continue;
                }
                if let Some(child_data) = record.child(&child.name) {
                    stack.push((child_id, child_data));
                }
            }
        }
    }
    ids
}

/// Where restore writes go.
enum Executor {
    Connection(Arc<dyn Connection>),
    Transaction(Box<dyn Transaction>),
}

impl Executor {
    async fn execute(&self, sql: &str, params: &[Value]) -> arkiv_core::Result<StatementResult> {
        match self {
            Executor::Connection(conn) => conn.execute(sql, params).await,
            Executor::Transaction(tx) => tx.execute(sql, params).await,
        }
    }

    async fn commit(self) -> arkiv_core::Result<()> {
        match self {
            Executor::Connection(_) => Ok(()),
            Executor::Transaction(tx) => tx.commit().await,
        }
    }

    async fn rollback(self) -> arkiv_core::Result<()> {
        match self {
            Executor::Connection(_) => Ok(()),
            Executor::Transaction(tx) => tx.rollback().await,
        }
    }
}

/// An optional reference written with its default, to be rewritten once
/// the referenced entity exists.
#[derive(Debug)]
struct DeferredReference {
    element: String,
    table: String,
    column: String,
    id_column: String,
    row_id: i64,
    entity_type: String,
    old_id: i64,
}

struct RestoreWalker<'a> {
    schema: &'a Schema,
    job: &'a RestoreJob,
    options: &'a RestoreOptions,
    content: &'a dyn ContentStore,
    executor: &'a Executor,
    registry: &'a mut dyn MigrationRegistry,
    /// Ids of the records this job writes, per mapped entity type
    own_ids: IdManifest,
    activity_id: Option<i64>,
    deferred: Vec<DeferredReference>,
    unknown_seen: IndexSet<String>,
    result: RestoreResult,
}

impl<'a> RestoreWalker<'a> {
    async fn walk_root(&mut self, root: &ElementData) -> Result<(), RestoreError> {
        let schema = self.schema;
        let root_id = schema.root();
        let top = Frame::root();

        // A dropped root leaves nothing to attach children to
        let Some(record) = root.records.first() else {
            return Err(RestoreError::RootRecordCount(0));
        };
        let identity = self.restore_record(root_id, record, &top).await?;
        self.activity_id = identity.as_i64();
        self.result.activity_id = self.activity_id;

        let frame = top.child(&root.name, Some(&identity));
        self.walk_children(root_id, record, &frame).await
    }

    fn walk_children<'b>(
        &'b mut self,
        id: ElementId,
        record: &'b RecordData,
        frame: &'b Frame<'b>,
    ) -> BoxFuture<'b, Result<(), RestoreError>> {
        Box::pin(async move {
            let schema = self.schema;
            for (child_id, child) in schema.children(id) {
                if child.user_data && !self.job.include_user_data {
                    let path = schema.path(child_id);
                    if !self.result.pruned.contains(&path) {
                        tracing::debug!(element = %path, "skipping user data subtree");
                        self.result.pruned.push(path);
                    }
                    continue;
                }
                if let Some(data) = record.child(&child.name) {
                    self.walk_element(child_id, data, frame).await?;
                }
            }

            for name in record.children.keys() {
                if schema.child_by_name(id, name).is_none() {
                    self.report_unknown(id, name);
                }
            }
            Ok(())
        })
    }

    fn walk_element<'b>(
        &'b mut self,
        id: ElementId,
        data: &'b ElementData,
        parent: &'b Frame<'b>,
    ) -> BoxFuture<'b, Result<(), RestoreError>> {
        Box::pin(async move {
            let schema = self.schema;
            let element = schema.element(id);

            if !element.source.is_sourced() {
                for record in &data.records {
                    let frame = parent.child(&element.name, None);
                    self.walk_children(id, record, &frame).await?;
                }
                return Ok(());
            }

            tracing::debug!(element = %schema.path(id), records = data.records.len(), "restoring element");
            for record in &data.records {
                match self.restore_record(id, record, parent).await {
                    Ok(identity) => {
                        let frame = parent.child(&element.name, Some(&identity));
                        self.walk_children(id, record, &frame).await?;
                    }
                    Err(err) if err.is_record_scoped() => {
                        tracing::warn!(error = %err, "dropping record");
                        self.result.records_dropped += subtree_size(record);
                        self.result.warnings.extend(RestoreWarning::from_error(&err));
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        })
    }

    /// Inserts one record and returns its new identity.
    async fn restore_record(
        &mut self,
        id: ElementId,
        record: &RecordData,
        frame: &Frame<'_>,
    ) -> Result<Scalar, RestoreError> {
        let schema = self.schema;
        let element = schema.element(id);
        let path = schema.path(id);
        let table = element
            .target_table()
            .ok_or_else(|| RestoreError::NoRestoreTable(path.clone()))?;
        let qualified = qualified_table(schema.table_prefix(), table);
        let mapping_attr = element.id_mapping.as_ref().map(|m| m.attribute.as_str());

        let mut values: IndexMap<String, Scalar> = element
            .attributes()
            .map(|attr| (attr.to_string(), record.get(attr).cloned().unwrap_or_default()))
            .collect();

        let mut linked = IndexSet::new();
        for (column, var) in linked_columns(element) {
            if Some(column) == mapping_attr {
                continue;
            }
            if let Some(value) = self.link_value(var, frame) {
                values.insert(column.to_string(), value);
                linked.insert(column);
            }
        }

        let mut pending = Vec::new();
        for annotation in element.id_annotations.values() {
            let attr = annotation.attribute.as_str();
            if linked.contains(attr) || Some(attr) == mapping_attr {
                continue;
            }
            let current = match values.get(attr) {
                Some(value) if !value.is_null() => value.clone(),
                _ => continue,
            };

            let old_id = current.as_i64();
            if let Some(new_id) = old_id.and_then(|old| self.registry.get(&annotation.entity_type, old))
            {
                values.insert(attr.to_string(), Scalar::Integer(new_id));
                continue;
            }

            match self
                .options
                .policy_for(&annotation.entity_type, &annotation.policy)
            {
                ReferencePolicy::Required => {
                    return Err(RestoreError::UnresolvedReference {
                        element: path,
                        attribute: attr.to_string(),
                        entity_type: annotation.entity_type.clone(),
                        value: current,
                    });
                }
                ReferencePolicy::Optional { default } => {
                    if let Some(old_id) = old_id
                        && self.defers(element, &annotation.entity_type, old_id)
                    {
                        pending.push((attr.to_string(), annotation.entity_type.clone(), old_id));
                    }
                    values.insert(attr.to_string(), default.clone());
                }
            }
        }

        let mut after_insert = Vec::new();
        for files in &element.file_annotations {
            let Some(raw) = values.get(&files.file_area).and_then(Scalar::as_str) else {
                continue;
            };
            let raw = raw.to_string();
            // Keyed by the record's own id, which only exists after the insert
            if mapping_attr.is_some() && files.item_id_attribute.as_deref() == mapping_attr {
                after_insert.push((files, raw));
                continue;
            }

            let (old_item, new_item) = match &files.item_id_attribute {
                Some(attr) => (
                    record.get(attr).and_then(Scalar::as_i64),
                    values.get(attr).and_then(Scalar::as_i64),
                ),
                None => (None, None),
            };
            let copied = self
                .content
                .copy_and_remap_content(files, old_item, new_item, &raw, &*self.registry)
                .await;
            match copied {
                Ok(text) => {
                    values.insert(files.file_area.clone(), Scalar::String(text));
                }
                Err(err) => self.storage_failure(&path, files, err)?,
            }
        }

        let row: Vec<(&str, &Scalar)> = values
            .iter()
            .filter(|(column, _)| Some(column.as_str()) != mapping_attr)
            .map(|(column, value)| (column.as_str(), value))
            .collect();
        let sql = insert_statement(&qualified, row.iter().map(|(column, _)| *column));
        let params: Vec<Value> = row.iter().map(|(_, value)| value.to_value()).collect();
        let inserted = self.execute(&path, &sql, &params).await?;

        let identity = match &element.id_mapping {
            Some(mapping) => {
                let new_id = inserted
                    .last_insert_id
                    .ok_or_else(|| RestoreError::MissingInsertId(path.clone()))?;
                let id_column = quote_identifier(&mapping.attribute);
                let old_id = record.get(&mapping.attribute).and_then(Scalar::as_i64);

                for (files, raw) in after_insert {
                    let copied = self
                        .content
                        .copy_and_remap_content(files, old_id, Some(new_id), &raw, &*self.registry)
                        .await;
                    match copied {
                        Ok(text) if text != raw => {
                            let sql = format!(
                                "UPDATE {} SET {} = $1 WHERE {} = $2",
                                qualified,
                                quote_identifier(&files.file_area),
                                id_column
                            );
                            self.execute(&path, &sql, &[Value::Text(text), Value::Integer(new_id)])
                                .await?;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            if let Err(drop) = self.storage_failure(&path, files, err) {
                                let sql =
                                    format!("DELETE FROM {} WHERE {} = $1", qualified, id_column);
                                self.execute(&path, &sql, &[Value::Integer(new_id)]).await?;
                                return Err(drop);
                            }
                        }
                    }
                }

                if let Some(old_id) = old_id {
                    self.registry.put(&mapping.entity_type, old_id, new_id)?;
                }
                for (column, entity_type, old_id) in pending {
                    self.deferred.push(DeferredReference {
                        element: path.clone(),
                        table: qualified.clone(),
                        column,
                        id_column: mapping.attribute.clone(),
                        row_id: new_id,
                        entity_type,
                        old_id,
                    });
                }
                Scalar::Integer(new_id)
            }
            None => element
                .identity_attribute()
                .and_then(|attr| values.get(attr))
                .cloned()
                .unwrap_or_default(),
        };

        *self.result.rows_restored.entry(path).or_default() += 1;
        Ok(identity)
    }

    /// Rewrites deferred references now that every row exists.
    async fn apply_deferred(&mut self) -> Result<(), RestoreError> {
        let deferred = std::mem::take(&mut self.deferred);
        tracing::debug!(count = deferred.len(), "applying deferred references");

        for reference in deferred {
            let Some(new_id) = self.registry.get(&reference.entity_type, reference.old_id) else {
                tracing::warn!(
                    element = %reference.element,
                    attribute = %reference.column,
                    old_id = reference.old_id,
                    "deferred reference still unresolved"
                );
                self.result.warnings.push(RestoreWarning {
                    message: format!(
                        "{} {} referenced by '{}.{}' was never restored",
                        reference.entity_type, reference.old_id, reference.element, reference.column
                    ),
                    element: reference.element,
                    attribute: Some(reference.column),
                    kind: RestoreWarningKind::UnresolvedDeferredReference,
                });
                continue;
            };

            let sql = format!(
                "UPDATE {} SET {} = $1 WHERE {} = $2",
                reference.table,
                quote_identifier(&reference.column),
                quote_identifier(&reference.id_column)
            );
            self.execute(
                &reference.element,
                &sql,
                &[Value::Integer(new_id), Value::Integer(reference.row_id)],
            )
            .await?;
            self.result.deferred_updates += 1;
        }
        Ok(())
    }

    /// New value for a linked column, if known at this point.
    fn link_value(&self, var: ContextVar, frame: &Frame<'_>) -> Option<Scalar> {
        match var {
            ContextVar::ParentId => frame.parent_identity().cloned(),
            ContextVar::ActivityId => self.activity_id.map(Scalar::Integer),
            ContextVar::ModuleId => self.job.course_module_id.map(Scalar::Integer),
        }
    }

    /// Whether a missed optional reference points at a row this job will
    /// write later.
    fn defers(&self, element: &Element, entity_type: &str, old_id: i64) -> bool {
        self.options.defer_self_references
            && element.id_mapping.is_some()
            && self.own_ids.contains(entity_type, old_id)
    }

    fn storage_failure(
        &mut self,
        path: &str,
        files: &FileAnnotation,
        err: StorageCopyError,
    ) -> Result<(), RestoreError> {
        let err = RestoreError::StorageCopy {
            element: path.to_string(),
            attribute: files.file_area.clone(),
            source: err,
        };
        match self.options.storage_failure {
            StorageFailurePolicy::KeepOriginal => {
                tracing::warn!(error = %err, "keeping original content");
                self.result.warnings.extend(RestoreWarning::from_error(&err));
                Ok(())
            }
            StorageFailurePolicy::DropRecord => Err(err),
        }
    }

    fn report_unknown(&mut self, parent: ElementId, name: &str) {
        let path = format!("{}/{}", self.schema.path(parent), name);
        if self.unknown_seen.insert(path.clone()) {
            tracing::warn!(element = %path, "document element not in schema, skipping");
            self.result.warnings.push(RestoreWarning {
                message: format!("element '{}' is not part of the schema", path),
                element: path,
                attribute: None,
                kind: RestoreWarningKind::UnknownElement,
            });
        }
    }

    async fn execute(
        &self,
        path: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<StatementResult, RestoreError> {
        self.executor
            .execute(sql, params)
            .await
            .map_err(|source| RestoreError::Database {
                element: path.to_string(),
                source,
            })
    }
}

/// Columns restore links to the new context values. Filter columns always
/// name columns of the table; query parameters only count when they name a
/// declared attribute.
fn linked_columns(element: &Element) -> Vec<(&str, ContextVar)> {
    match &element.source {
        SourceBinding::Table { .. } => element.source.context_vars().collect(),
        SourceBinding::Query { .. } => element
            .source
            .context_vars()
            .filter(|(name, _)| element.has_attribute(name))
            .collect(),
        SourceBinding::None => Vec::new(),
    }
}

fn insert_statement<'c>(table: &str, columns: impl Iterator<Item = &'c str>) -> String {
    let columns: Vec<String> = columns.map(quote_identifier).collect();
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", table);
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn subtree_size(record: &RecordData) -> u64 {
    1 + record
        .children
        .values()
        .map(|child| child.total_records() as u64)
        .sum::<u64>()
}
