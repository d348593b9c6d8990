//! Rich content copy and link rewriting on restore

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::MigrationRegistry;
use crate::schema::FileAnnotation;

/// Content of one area could not be copied for one record.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("failed to copy content of {area} (item {item:?}): {message}")]
pub struct StorageCopyError {
    pub area: String,
    pub item: Option<i64>,
    pub message: String,
}

/// What restore does with a record whose content copy failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Write the record with its content unchanged
    #[default]
    KeepOriginal,
    /// Drop the record and its subtree
    DropRecord,
}

/// Copies stored content into the restored activity and rewrites the links
/// embedded in its text.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns `raw` rewritten for the new item. `old_item` and `new_item`
    /// are `None` for areas shared by the whole activity.
    async fn copy_and_remap_content(
        &self,
        area: &FileAnnotation,
        old_item: Option<i64>,
        new_item: Option<i64>,
        raw: &str,
        registry: &dyn MigrationRegistry,
    ) -> Result<String, StorageCopyError>;
}

static LINK_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@@([a-z_][a-z0-9_]*):(\d+)@@").expect("valid regex"));

/// Rewrites `@@<entity_type>:<old_id>@@` tokens through the registry.
///
/// Files themselves are not moved; tokens with no registry entry are kept
/// as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkRewriter;

impl LinkRewriter {
    pub fn new() -> Self {
        Self
    }

    pub fn rewrite(&self, raw: &str, registry: &dyn MigrationRegistry) -> String {
        LINK_TOKEN_REGEX
            .replace_all(raw, |caps: &Captures<'_>| {
                let entity_type = &caps[1];
                let remapped = caps[2]
                    .parse::<i64>()
                    .ok()
                    .and_then(|old| registry.get(entity_type, old));
                match remapped {
                    Some(new_id) => format!("@@{}:{}@@", entity_type, new_id),
                    None => {
                        tracing::debug!(token = &caps[0], "leaving unresolved link token");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }
}

#[async_trait]
impl ContentStore for LinkRewriter {
    async fn copy_and_remap_content(
        &self,
        _area: &FileAnnotation,
        _old_item: Option<i64>,
        _new_item: Option<i64>,
        raw: &str,
        registry: &dyn MigrationRegistry,
    ) -> Result<String, StorageCopyError> {
        Ok(self.rewrite(raw, registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryMigrationRegistry;

    #[test]
    fn test_tokens_rewritten_through_registry() {
        let mut registry = InMemoryMigrationRegistry::new();
        registry.put("studentquiz_question", 7, 70).unwrap();

        let rewritten = LinkRewriter::new().rewrite(
            "<a href=\"@@studentquiz_question:7@@\">q</a> @@user:3@@ @@bad@@",
            &registry,
        );
        assert_eq!(
            rewritten,
            "<a href=\"@@studentquiz_question:70@@\">q</a> @@user:3@@ @@bad@@"
        );
    }

    #[tokio::test]
    async fn test_link_rewriter_as_content_store() {
        let area = FileAnnotation {
            component: "mod_studentquiz".into(),
            file_area: "intro".into(),
            item_id_attribute: None,
        };
        let registry = InMemoryMigrationRegistry::new();
        let store: &dyn ContentStore = &LinkRewriter::new();

        let text = store
            .copy_and_remap_content(&area, None, None, "plain text", &registry)
            .await
            .unwrap();
        assert_eq!(text, "plain text");
    }
}
