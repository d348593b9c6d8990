//! Output sinks for the backup walk
//!
//! The walker reports the tree as a sequence of nested events. A
//! [`DocumentSink`] assembles them into a [`BackupDocument`] in memory; a
//! [`JsonStreamSink`] writes them out as they arrive, producing the same
//! JSON as serializing the assembled document.

use std::io::Write;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use thiserror::Error;

use crate::document::{BackupDocument, BackupSource, ElementData, FileManifest, IdManifest, RecordData};
use crate::scalar::Scalar;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink received {event} out of order")]
    OutOfOrder { event: &'static str },
}

/// Document-level fields written before the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHeader {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub source: BackupSource,
}

impl DocumentHeader {
    pub fn new(source: BackupSource) -> Self {
        Self {
            version: BackupDocument::CURRENT_VERSION.to_string(),
            created_at: Utc::now(),
            source,
        }
    }
}

/// Receives the backup tree as nested events.
///
/// Events arrive as `begin_document`, then the root element, then
/// `finish_document`. Each element is `begin_element`, any number of
/// `begin_record` .. `end_record` pairs, then `end_element`; child elements
/// of a record arrive between its `begin_record` and `end_record`.
pub trait BackupSink: Send {
    fn begin_document(&mut self, header: &DocumentHeader) -> Result<(), SinkError>;
    fn begin_element(&mut self, name: &str) -> Result<(), SinkError>;
    fn begin_record(&mut self, values: &IndexMap<String, Scalar>) -> Result<(), SinkError>;
    fn end_record(&mut self) -> Result<(), SinkError>;
    fn end_element(&mut self) -> Result<(), SinkError>;
    fn finish_document(
        &mut self,
        id_manifest: &IdManifest,
        file_manifest: &FileManifest,
    ) -> Result<(), SinkError>;
}

/// Buffers the whole document in memory.
#[derive(Debug, Default)]
pub struct DocumentSink {
    header: Option<DocumentHeader>,
    stack: Vec<ElementData>,
    root: Option<ElementData>,
    document: Option<BackupDocument>,
}

impl DocumentSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finished document, once `finish_document` has run.
    pub fn into_document(self) -> Option<BackupDocument> {
        self.document
    }
}

impl BackupSink for DocumentSink {
    fn begin_document(&mut self, header: &DocumentHeader) -> Result<(), SinkError> {
        self.header = Some(header.clone());
        Ok(())
    }

    fn begin_element(&mut self, name: &str) -> Result<(), SinkError> {
        self.stack.push(ElementData::new(name));
        Ok(())
    }

    fn begin_record(&mut self, values: &IndexMap<String, Scalar>) -> Result<(), SinkError> {
        let element = self.stack.last_mut().ok_or(SinkError::OutOfOrder {
            event: "begin_record",
        })?;
        element.records.push(RecordData::new(values.clone()));
        Ok(())
    }

    fn end_record(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn end_element(&mut self) -> Result<(), SinkError> {
        let finished = self.stack.pop().ok_or(SinkError::OutOfOrder {
            event: "end_element",
        })?;
        match self.stack.last_mut() {
            Some(parent) => {
                let record = parent.records.last_mut().ok_or(SinkError::OutOfOrder {
                    event: "end_element",
                })?;
                record.children.insert(finished.name.clone(), finished);
            }
            None => self.root = Some(finished),
        }
        Ok(())
    }

    fn finish_document(
        &mut self,
        id_manifest: &IdManifest,
        file_manifest: &FileManifest,
    ) -> Result<(), SinkError> {
        let (Some(header), Some(root)) = (self.header.take(), self.root.take()) else {
            return Err(SinkError::OutOfOrder {
                event: "finish_document",
            });
        };
        self.document = Some(BackupDocument {
            version: header.version,
            created_at: header.created_at,
            source: header.source,
            root,
            id_manifest: id_manifest.clone(),
            file_manifest: file_manifest.clone(),
        });
        Ok(())
    }
}

/// Writes compact JSON record by record.
pub struct JsonStreamSink<W: Write + Send> {
    writer: W,
    /// One entry per open element or record: whether nothing has been
    /// written inside it yet
    first: Vec<bool>,
}

impl<W: Write + Send> JsonStreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            first: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes a separator unless this is the first item of the open container.
    fn separate(&mut self) -> Result<(), SinkError> {
        if let Some(first) = self.first.last_mut() {
            if *first {
                *first = false;
            } else {
                self.writer.write_all(b",")?;
            }
        }
        Ok(())
    }
}

impl<W: Write + Send> BackupSink for JsonStreamSink<W> {
    fn begin_document(&mut self, header: &DocumentHeader) -> Result<(), SinkError> {
        self.writer.write_all(b"{\"version\":")?;
        serde_json::to_writer(&mut self.writer, &header.version)?;
        self.writer.write_all(b",\"created_at\":")?;
        serde_json::to_writer(&mut self.writer, &header.created_at)?;
        self.writer.write_all(b",\"source\":")?;
        serde_json::to_writer(&mut self.writer, &header.source)?;
        self.writer.write_all(b",\"root\":")?;
        Ok(())
    }

    fn begin_element(&mut self, name: &str) -> Result<(), SinkError> {
        if !self.first.is_empty() {
            // Inside a record's children map
            self.separate()?;
            serde_json::to_writer(&mut self.writer, name)?;
            self.writer.write_all(b":")?;
        }
        self.writer.write_all(b"{\"name\":")?;
        serde_json::to_writer(&mut self.writer, name)?;
        self.writer.write_all(b",\"records\":[")?;
        self.first.push(true);
        Ok(())
    }

    fn begin_record(&mut self, values: &IndexMap<String, Scalar>) -> Result<(), SinkError> {
        if self.first.is_empty() {
            return Err(SinkError::OutOfOrder {
                event: "begin_record",
            });
        }
        self.separate()?;
        self.writer.write_all(b"{\"values\":")?;
        serde_json::to_writer(&mut self.writer, values)?;
        self.writer.write_all(b",\"children\":{")?;
        self.first.push(true);
        Ok(())
    }

    fn end_record(&mut self) -> Result<(), SinkError> {
        self.first.pop().ok_or(SinkError::OutOfOrder {
            event: "end_record",
        })?;
        self.writer.write_all(b"}}")?;
        Ok(())
    }

    fn end_element(&mut self) -> Result<(), SinkError> {
        self.first.pop().ok_or(SinkError::OutOfOrder {
            event: "end_element",
        })?;
        self.writer.write_all(b"]}")?;
        Ok(())
    }

    fn finish_document(
        &mut self,
        id_manifest: &IdManifest,
        file_manifest: &FileManifest,
    ) -> Result<(), SinkError> {
        self.writer.write_all(b",\"id_manifest\":")?;
        serde_json::to_writer(&mut self.writer, id_manifest)?;
        self.writer.write_all(b",\"file_manifest\":")?;
        serde_json::to_writer(&mut self.writer, file_manifest)?;
        self.writer.write_all(b"}")?;
        self.writer.flush()?;
        Ok(())
    }
}
