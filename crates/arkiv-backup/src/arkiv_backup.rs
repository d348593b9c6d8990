//! Arkiv Backup - structural backup and restore of activity data
//!
//! An activity's tables are described once as a tree of elements (see
//! [`schema`]). The tree drives both directions:
//!
//! - [`BackupEngine`] walks it against a database and produces a
//!   [`BackupDocument`]: nested records plus a manifest of every referenced
//!   entity and content area.
//! - [`Restorer`] replays a document into another database, rewriting every
//!   annotated reference through a [`MigrationRegistry`].
//!
//! # Example
//!
//! ```ignore
//! let schema = SchemaFile::load(path)?.build(&settings.table_prefix)?;
//! let engine = BackupEngine::new(connection.clone());
//! let (document, report) = engine.backup_document(&schema, &JobContext::new(42, 7)).await?;
//!
//! let mut registry = InMemoryMigrationRegistry::new();
//! let restored = Restorer::new(target)
//!     .restore(&schema, &document, &RestoreJob::new(), &mut registry)
//!     .await?;
//! ```

mod content;
mod context;
mod document;
mod exporter;
mod importer;
mod registry;
mod scalar;
mod settings;

pub mod schema;

pub use content::{ContentStore, LinkRewriter, StorageCopyError, StorageFailurePolicy};
pub use context::JobContext;
pub use document::{
    BackupDocument, BackupSource, DocumentError, ElementData, FileAreaEntry, FileManifest,
    IdManifest, RecordData, helpers,
};
pub use exporter::{
    BackupEngine, BackupError, BackupReport, BackupSink, DocumentHeader, DocumentSink,
    JsonStreamSink, SinkError,
};
pub use importer::{
    RestoreError, RestoreJob, RestoreResult, RestoreWarning, RestoreWarningKind, Restorer,
};
pub use registry::{InMemoryMigrationRegistry, MigrationRegistry, RegistryError};
pub use scalar::Scalar;
pub use schema::{Schema, SchemaBuilder, SchemaError};
pub use settings::{BackupOptions, EngineSettings, RestoreOptions, SettingsError};
