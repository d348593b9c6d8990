//! Backup document structure
//!
//! A backup document mirrors the element tree: the root element holds exactly
//! one record, each record holds its attribute values and one entry per child
//! element, in schema order. Next to the tree the document carries the id
//! manifest (every referenced entity) and the file manifest (every content
//! area with the items it was stored under).

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scalar::Scalar;

/// Errors while reading a backup document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Written by a newer format revision than this reader understands.
    #[error(
        "backup document version '{document_version}' is newer than the newest supported \
         version '{max_supported}'"
    )]
    TooNew {
        document_version: String,
        max_supported: String,
    },

    #[error("backup document is missing the required 'version' field")]
    MissingVersion,

    #[error("failed to parse backup document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read backup document: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct VersionProbe {
    version: Option<String>,
}

/// A complete backup of one activity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDocument {
    /// Document format version
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub source: BackupSource,
    /// The root element; holds exactly one record
    pub root: ElementData,
    #[serde(default)]
    pub id_manifest: IdManifest,
    #[serde(default)]
    pub file_manifest: FileManifest,
}

impl BackupDocument {
    /// Current format version
    pub const CURRENT_VERSION: &'static str = "1.0";

    /// Parse from JSON bytes, rejecting documents newer than
    /// [`Self::CURRENT_VERSION`].
    pub fn from_slice(data: &[u8]) -> Result<Self, DocumentError> {
        let probe: VersionProbe = serde_json::from_slice(data)?;
        let version = probe.version.ok_or(DocumentError::MissingVersion)?;
        Self::check_version(&version)?;
        Ok(serde_json::from_slice(data)?)
    }

    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        Self::from_slice(json.as_bytes())
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, DocumentError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        Self::from_slice(&raw)
    }

    /// "MAJOR.MINOR"; a document is too new when its major is higher, or the
    /// major matches and its minor is higher.
    fn check_version(version: &str) -> Result<(), DocumentError> {
        fn parse_version(v: &str) -> Option<(u64, u64)> {
            let mut parts = v.splitn(2, '.');
            let major: u64 = parts.next()?.parse().ok()?;
            let minor: u64 = parts.next().unwrap_or("0").parse().ok()?;
            Some((major, minor))
        }

        let (doc_major, doc_minor) = parse_version(version).unwrap_or((u64::MAX, u64::MAX));
        let (our_major, our_minor) = parse_version(Self::CURRENT_VERSION).unwrap_or((1, 0));

        if doc_major > our_major || (doc_major == our_major && doc_minor > our_minor) {
            return Err(DocumentError::TooNew {
                document_version: version.to_owned(),
                max_supported: Self::CURRENT_VERSION.to_owned(),
            });
        }
        Ok(())
    }

    /// Number of records in the whole tree, the root record included.
    pub fn total_records(&self) -> usize {
        self.root.total_records()
    }
}

/// Where and how a backup was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSource {
    /// Driver of the source database (e.g. "sqlite")
    pub driver: String,
    pub activity_id: i64,
    pub course_module_id: i64,
    /// Whether user-data subtrees were walked
    pub include_user_data: bool,
}

/// All records of one element under one parent record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementData {
    pub name: String,
    #[serde(default)]
    pub records: Vec<RecordData>,
}

impl ElementData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
        }
    }

    pub(crate) fn total_records(&self) -> usize {
        self.records
            .iter()
            .map(|r| 1 + r.children.values().map(ElementData::total_records).sum::<usize>())
            .sum()
    }
}

/// One record: attribute values in key-then-data order plus child elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    #[serde(default)]
    pub values: IndexMap<String, Scalar>,
    #[serde(default)]
    pub children: IndexMap<String, ElementData>,
}

impl RecordData {
    pub fn new(values: IndexMap<String, Scalar>) -> Self {
        Self {
            values,
            children: IndexMap::new(),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&Scalar> {
        self.values.get(attribute)
    }

    pub fn child(&self, name: &str) -> Option<&ElementData> {
        self.children.get(name)
    }
}

/// Distinct `(entity type, id)` pairs referenced by a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdManifest(BTreeMap<String, BTreeSet<i64>>);

impl IdManifest {
    pub fn insert(&mut self, entity_type: &str, id: i64) -> bool {
        self.0.entry(entity_type.to_string()).or_default().insert(id)
    }

    pub fn contains(&self, entity_type: &str, id: i64) -> bool {
        self.0.get(entity_type).is_some_and(|ids| ids.contains(&id))
    }

    pub fn ids(&self, entity_type: &str) -> impl Iterator<Item = i64> + '_ {
        self.0.get(entity_type).into_iter().flatten().copied()
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Total number of pairs.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One annotated content area and the items stored under it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAreaEntry {
    pub component: String,
    pub file_area: String,
    /// Per-record item ids; empty for a shared area
    #[serde(default)]
    pub item_ids: BTreeSet<i64>,
}

/// Content areas keyed by `component/file_area`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileManifest(BTreeMap<String, FileAreaEntry>);

impl FileManifest {
    /// Records that `component/file_area` is in use, optionally for `item_id`.
    pub fn record(&mut self, component: &str, file_area: &str, item_id: Option<i64>) {
        let entry = self
            .0
            .entry(format!("{}/{}", component, file_area))
            .or_insert_with(|| FileAreaEntry {
                component: component.to_string(),
                file_area: file_area.to_string(),
                item_ids: BTreeSet::new(),
            });
        if let Some(item_id) = item_id {
            entry.item_ids.insert(item_id);
        }
    }

    pub fn get(&self, area_key: &str) -> Option<&FileAreaEntry> {
        self.0.get(area_key)
    }

    pub fn areas(&self) -> impl Iterator<Item = &FileAreaEntry> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Serialization helpers for backup documents
pub mod helpers {
    use super::*;
    use flate2::Compression;
    use flate2::read::GzDecoder;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

    pub fn to_json(doc: &BackupDocument) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(doc)
    }

    pub fn to_json_compact(doc: &BackupDocument) -> Result<String, serde_json::Error> {
        serde_json::to_string(doc)
    }

    /// Compact JSON, gzip-compressed.
    pub fn to_json_compressed(doc: &BackupDocument) -> Result<Vec<u8>, std::io::Error> {
        let json = to_json_compact(doc)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes())?;
        encoder.finish()
    }

    pub fn from_json_compressed(data: &[u8]) -> Result<BackupDocument, DocumentError> {
        BackupDocument::from_reader(GzDecoder::new(data))
    }

    /// Reads plain or gzip-compressed JSON, whichever `data` holds.
    pub fn read_document(data: &[u8]) -> Result<BackupDocument, DocumentError> {
        if data.starts_with(&GZIP_MAGIC) {
            from_json_compressed(data)
        } else {
            BackupDocument::from_slice(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> BackupDocument {
        let mut values = IndexMap::new();
        values.insert("id".to_string(), Scalar::Integer(42));
        values.insert("name".to_string(), Scalar::from("Quiz"));
        let mut record = RecordData::new(values);
        record
            .children
            .insert("questions".into(), ElementData::new("questions"));

        let mut id_manifest = IdManifest::default();
        id_manifest.insert("user", 7);
        let mut file_manifest = FileManifest::default();
        file_manifest.record("mod_studentquiz", "intro", None);

        BackupDocument {
            version: BackupDocument::CURRENT_VERSION.to_string(),
            created_at: Utc::now(),
            source: BackupSource {
                driver: "sqlite".into(),
                activity_id: 42,
                course_module_id: 5,
                include_user_data: true,
            },
            root: ElementData {
                name: "studentquiz".into(),
                records: vec![record],
            },
            id_manifest,
            file_manifest,
        }
    }

    #[test]
    fn test_document_round_trips_through_gzip() {
        let doc = sample();
        let compressed = helpers::to_json_compressed(&doc).unwrap();
        assert_eq!(helpers::read_document(&compressed).unwrap(), doc);

        let plain = helpers::to_json(&doc).unwrap();
        assert_eq!(helpers::read_document(plain.as_bytes()).unwrap(), doc);
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        json["version"] = serde_json::Value::String("2.0".into());
        let err = BackupDocument::from_json(&json.to_string()).unwrap_err();
        assert!(matches!(err, DocumentError::TooNew { .. }));

        json["version"] = serde_json::Value::String("1.0".into());
        assert!(BackupDocument::from_json(&json.to_string()).is_ok());
    }

    #[test]
    fn test_missing_version_rejected() {
        let err = BackupDocument::from_json(r#"{"root": {"name": "x"}}"#).unwrap_err();
        assert!(matches!(err, DocumentError::MissingVersion));
    }

    #[test]
    fn test_record_values_keep_declared_order() {
        let json = helpers::to_json_compact(&sample()).unwrap();
        let id_at = json.find(r#""id":42"#).unwrap();
        let name_at = json.find(r#""name":"Quiz""#).unwrap();
        assert!(id_at < name_at);
        assert_eq!(sample().total_records(), 1);
    }
}
