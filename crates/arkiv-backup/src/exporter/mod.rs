//! Backup walk
//!
//! [`BackupEngine`] walks a [`Schema`] depth-first, pre-order, against one
//! read transaction and reports the tree to a [`BackupSink`]. The id and file
//! manifests are accumulated along the way and handed to the sink last.

mod sink;

pub use sink::{BackupSink, DocumentHeader, DocumentSink, JsonStreamSink, SinkError};

use std::collections::HashMap;
use std::sync::Arc;

use arkiv_core::{ArkivError, Connection, Transaction, Value};
use arkiv_query::parameters::BindError;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use thiserror::Error;

use crate::context::{Frame, JobContext, resolve};
use crate::document::{BackupDocument, BackupSource, FileManifest, IdManifest};
use crate::scalar::Scalar;
use crate::schema::{Element, ElementId, Schema};

/// Errors that abort a backup job.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("root element '{0}' returned no record")]
    MissingRoot(String),

    #[error("root element '{element}' returned {rows} records, expected exactly one")]
    AmbiguousRoot { element: String, rows: usize },

    #[error("query for element '{element}' failed: {source}")]
    Query {
        element: String,
        #[source]
        source: ArkivError,
    },

    #[error("no value for parameter '{parameter}' of element '{element}'")]
    UnresolvedParameter { element: String, parameter: String },

    #[error("binding parameters of element '{element}' failed: {source}")]
    Bind {
        element: String,
        #[source]
        source: BindError,
    },

    #[error("transaction error: {0}")]
    Transaction(#[from] ArkivError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("sink did not produce a document")]
    NoDocument,
}

/// What a backup job emitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupReport {
    /// Records emitted per element path
    pub records: IndexMap<String, u64>,
    /// Records skipped because a key attribute was null, per element path
    pub skipped_null_keys: IndexMap<String, u64>,
    /// Element paths not walked because they hold user data
    pub pruned: Vec<String>,
    pub id_references: usize,
    pub file_areas: usize,
}

impl BackupReport {
    pub fn total_records(&self) -> u64 {
        self.records.values().sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped_null_keys.values().sum()
    }
}

/// Runs backup jobs against one connection.
pub struct BackupEngine {
    connection: Arc<dyn Connection>,
}

impl BackupEngine {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Walks `schema` for the activity in `job`, reporting into `sink`.
    ///
    /// All reads run inside one transaction that is rolled back at the end.
    #[tracing::instrument(skip(self, schema, sink), fields(activity_id = job.activity_id))]
    pub async fn backup(
        &self,
        schema: &Schema,
        job: &JobContext,
        sink: &mut dyn BackupSink,
    ) -> Result<BackupReport, BackupError> {
        let tx = self.connection.begin_transaction().await?;

        let header = DocumentHeader::new(BackupSource {
            driver: self.connection.driver_name().to_string(),
            activity_id: job.activity_id,
            course_module_id: job.course_module_id,
            include_user_data: job.include_user_data,
        });

        let mut walker = Walker {
            schema,
            tx: tx.as_ref(),
            job,
            sink,
            report: BackupReport::default(),
            id_manifest: IdManifest::default(),
            file_manifest: FileManifest::default(),
        };
        walker.sink.begin_document(&header)?;
        walker.walk_root().await?;

        let Walker {
            mut report,
            id_manifest,
            file_manifest,
            sink,
            ..
        } = walker;
        report.id_references = id_manifest.len();
        report.file_areas = file_manifest.len();
        sink.finish_document(&id_manifest, &file_manifest)?;

        tx.rollback().await?;

        tracing::info!(
            records = report.total_records(),
            skipped = report.total_skipped(),
            id_references = report.id_references,
            "backup complete"
        );
        Ok(report)
    }

    /// Runs a backup into memory and returns the document.
    pub async fn backup_document(
        &self,
        schema: &Schema,
        job: &JobContext,
    ) -> Result<(BackupDocument, BackupReport), BackupError> {
        let mut sink = DocumentSink::new();
        let report = self.backup(schema, job, &mut sink).await?;
        let document = sink.into_document().ok_or(BackupError::NoDocument)?;
        Ok((document, report))
    }
}

struct Walker<'a> {
    schema: &'a Schema,
    tx: &'a dyn Transaction,
    job: &'a JobContext,
    sink: &'a mut dyn BackupSink,
    report: BackupReport,
    id_manifest: IdManifest,
    file_manifest: FileManifest,
}

/// A fetched record: values in key-then-data order and the identity used by
/// children bound to the parent id.
struct FetchedRecord {
    values: IndexMap<String, Scalar>,
    identity: Scalar,
}

impl<'a> Walker<'a> {
    async fn walk_root(&mut self) -> Result<(), BackupError> {
        let schema = self.schema;
        let root_id = schema.root();
        let root = schema.element(root_id);
        let top = Frame::root();

        let mut records = self.fetch(root_id, &top).await?;
        let record = match records.len() {
            0 => return Err(BackupError::MissingRoot(root.name.clone())),
            1 => records.remove(0),
            rows => {
                return Err(BackupError::AmbiguousRoot {
                    element: root.name.clone(),
                    rows,
                });
            }
        };

        self.sink.begin_element(&root.name)?;
        self.emit_record(root_id, &record)?;
        self.report.records.insert(schema.path(root_id), 1);
        let frame = top.child(&root.name, Some(&record.identity));
        self.walk_children(root_id, &frame).await?;
        self.sink.end_record()?;
        self.sink.end_element()?;
        Ok(())
    }

    fn walk_children<'b>(
        &'b mut self,
        id: ElementId,
        frame: &'b Frame<'b>,
    ) -> BoxFuture<'b, Result<(), BackupError>> {
        Box::pin(async move {
            let schema = self.schema;
            for (child_id, child) in schema.children(id) {
                if child.user_data && !self.job.include_user_data {
                    // Pruned before any binding is resolved
                    tracing::debug!(element = %child.name, "skipping user data subtree");
                    self.report.pruned.push(schema.path(child_id));
                    continue;
                }
                self.walk_element(child_id, frame).await?;
            }
            Ok(())
        })
    }

    fn walk_element<'b>(
        &'b mut self,
        id: ElementId,
        parent: &'b Frame<'b>,
    ) -> BoxFuture<'b, Result<(), BackupError>> {
        Box::pin(async move {
            let schema = self.schema;
            let element = schema.element(id);
            let path = schema.path(id);

            self.sink.begin_element(&element.name)?;
            if element.source.is_sourced() {
                let records = self.fetch(id, parent).await?;
                tracing::debug!(element = %path, records = records.len(), "emitting element");
                *self.report.records.entry(path).or_default() += records.len() as u64;
                for record in &records {
                    self.emit_record(id, record)?;
                    let frame = parent.child(&element.name, Some(&record.identity));
                    self.walk_children(id, &frame).await?;
                    self.sink.end_record()?;
                }
            } else {
                // Grouping element: one value-less record carrying the children
                *self.report.records.entry(path).or_default() += 1;
                self.sink.begin_record(&IndexMap::new())?;
                let frame = parent.child(&element.name, None);
                self.walk_children(id, &frame).await?;
                self.sink.end_record()?;
            }
            self.sink.end_element()?;
            Ok(())
        })
    }

    /// Writes the record and folds its annotated values into the manifests.
    fn emit_record(&mut self, id: ElementId, record: &FetchedRecord) -> Result<(), BackupError> {
        let element = self.schema.element(id);

        for annotation in element.id_annotations.values() {
            if let Some(old_id) = record
                .values
                .get(&annotation.attribute)
                .and_then(Scalar::as_i64)
            {
                self.id_manifest.insert(&annotation.entity_type, old_id);
            }
        }
        if let Some(mapping) = &element.id_mapping
            && let Some(own_id) = record.values.get(&mapping.attribute).and_then(Scalar::as_i64)
        {
            self.id_manifest.insert(&mapping.entity_type, own_id);
        }
        for files in &element.file_annotations {
            let item = files
                .item_id_attribute
                .as_ref()
                .and_then(|attr| record.values.get(attr))
                .and_then(Scalar::as_i64);
            self.file_manifest
                .record(&files.component, &files.file_area, item);
        }

        self.sink.begin_record(&record.values)?;
        Ok(())
    }

    /// Runs the element's query and converts rows into records.
    async fn fetch(
        &mut self,
        id: ElementId,
        parent: &Frame<'_>,
    ) -> Result<Vec<FetchedRecord>, BackupError> {
        let element = self.schema.element(id);
        let Some(query) = element.source.compiled() else {
            return Ok(Vec::new());
        };

        let params = self.resolve_params(element, parent)?;
        let values = query.bind(&params).map_err(|source| BackupError::Bind {
            element: element.name.clone(),
            source,
        })?;
        let result = self
            .tx
            .query(&query.sql, &values)
            .await
            .map_err(|source| BackupError::Query {
                element: element.name.clone(),
                source,
            })?;

        let identity_attr = element.identity_attribute();
        let mut records = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let values: IndexMap<String, Scalar> = element
                .attributes()
                .map(|attr| {
                    let value = row.get_by_name(attr).map(Scalar::from).unwrap_or_default();
                    (attr.to_string(), value)
                })
                .collect();

            if let Some(null_key) = element
                .keys
                .iter()
                .find(|k| values.get(k.as_str()).is_none_or(Scalar::is_null))
            {
                tracing::warn!(
                    element = %element.name,
                    parent = %parent.element,
                    key = %null_key,
                    "skipping record with null key"
                );
                *self
                    .report
                    .skipped_null_keys
                    .entry(self.schema.path(id))
                    .or_default() += 1;
                continue;
            }

            let identity = identity_attr
                .and_then(|attr| values.get(attr))
                .cloned()
                .unwrap_or_default();
            records.push(FetchedRecord { values, identity });
        }
        Ok(records)
    }

    fn resolve_params(
        &self,
        element: &Element,
        frame: &Frame<'_>,
    ) -> Result<HashMap<String, Value>, BackupError> {
        let mut params = HashMap::new();
        for (name, var) in element.source.context_vars() {
            let value = resolve(var, frame, self.job).ok_or_else(|| {
                BackupError::UnresolvedParameter {
                    element: element.name.clone(),
                    parameter: name.to_string(),
                }
            })?;
            params.insert(name.to_string(), value);
        }
        Ok(params)
    }
}
