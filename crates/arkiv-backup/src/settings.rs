//! Engine settings
//!
//! ```toml
//! table_prefix = "mdl_"
//!
//! [backup]
//! include_user_data = true
//! pretty_json = false
//!
//! [restore]
//! use_transaction = true
//! defer_self_references = true
//! storage_failure = "keep_original"
//!
//! [restore.reference_policies]
//! user = { policy = "optional", default = 0 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content::StorageFailurePolicy;
use crate::schema::ReferencePolicy;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Prepended to every table name the engine reads or writes
    pub table_prefix: String,
    pub backup: BackupOptions,
    pub restore: RestoreOptions,
}

impl EngineSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    /// Default for the user-data toggle when a job does not set it
    pub include_user_data: bool,
    pub pretty_json: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_user_data: true,
            pretty_json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Write everything in one transaction committed at the end
    pub use_transaction: bool,
    /// Fix up optional references to entities restored later in the same job
    pub defer_self_references: bool,
    pub storage_failure: StorageFailurePolicy,
    /// Overrides the annotated policy for every reference into an entity type
    pub reference_policies: BTreeMap<String, ReferencePolicy>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            use_transaction: true,
            defer_self_references: true,
            storage_failure: StorageFailurePolicy::default(),
            reference_policies: BTreeMap::new(),
        }
    }
}

impl RestoreOptions {
    /// Policy for a reference into `entity_type`, preferring the override.
    pub fn policy_for<'a>(
        &'a self,
        entity_type: &str,
        annotated: &'a ReferencePolicy,
    ) -> &'a ReferencePolicy {
        self.reference_policies.get(entity_type).unwrap_or(annotated)
    }
}
