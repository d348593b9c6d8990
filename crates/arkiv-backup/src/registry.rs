//! Job-scoped old-id → new-id migration table

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    /// `(entity_type, old_id)` is already mapped to a different id.
    #[error("{entity_type} {old_id} is already mapped to {existing}, cannot remap to {new_id}")]
    Conflict {
        entity_type: String,
        old_id: i64,
        existing: i64,
        new_id: i64,
    },

    #[error("invalid id '{value}' for {entity_type} in mappings")]
    InvalidId { entity_type: String, value: String },

    #[error("failed to parse mappings: {0}")]
    Parse(String),

    #[error("failed to write mappings: {0}")]
    Serialize(String),
}

/// Append-only mapping from `(entity_type, old_id)` to `new_id`.
///
/// Passed explicitly to every restore call; writes for an entity must happen
/// before any record referencing it is restored.
pub trait MigrationRegistry: Send + Sync {
    /// Records a mapping. Repeating an identical mapping is a no-op.
    fn put(&mut self, entity_type: &str, old_id: i64, new_id: i64) -> Result<(), RegistryError>;

    fn get(&self, entity_type: &str, old_id: i64) -> Option<i64>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMigrationRegistry {
    mappings: HashMap<(String, i64), i64>,
}

impl InMemoryMigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads mappings for entities restored outside this job, such as users.
    ///
    /// ```toml
    /// [user]
    /// 7 = 107
    /// 8 = 108
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        let tables: BTreeMap<String, BTreeMap<String, i64>> =
            toml::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))?;

        let mut registry = Self::new();
        for (entity_type, ids) in tables {
            for (old, new_id) in ids {
                let old_id = old.trim().parse().map_err(|_| RegistryError::InvalidId {
                    entity_type: entity_type.clone(),
                    value: old.clone(),
                })?;
                registry.put(&entity_type, old_id, new_id)?;
            }
        }
        Ok(registry)
    }

    /// All mappings of one entity type, sorted by old id.
    pub fn entries(&self, entity_type: &str) -> Vec<(i64, i64)> {
        let mut entries: Vec<(i64, i64)> = self
            .mappings
            .iter()
            .filter(|((entity, _), _)| entity == entity_type)
            .map(|((_, old), new)| (*old, *new))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Writes every mapping in the format read by [`Self::from_toml_str`].
    pub fn to_toml_string(&self) -> Result<String, RegistryError> {
        let mut tables: BTreeMap<&str, BTreeMap<String, i64>> = BTreeMap::new();
        for ((entity_type, old_id), new_id) in &self.mappings {
            tables
                .entry(entity_type.as_str())
                .or_default()
                .insert(old_id.to_string(), *new_id);
        }
        toml::to_string(&tables).map_err(|e| RegistryError::Serialize(e.to_string()))
    }
}

impl MigrationRegistry for InMemoryMigrationRegistry {
    fn put(&mut self, entity_type: &str, old_id: i64, new_id: i64) -> Result<(), RegistryError> {
        let key = (entity_type.to_string(), old_id);
        match self.mappings.get(&key) {
            Some(existing) if *existing == new_id => Ok(()),
            Some(existing) => Err(RegistryError::Conflict {
                entity_type: entity_type.to_string(),
                old_id,
                existing: *existing,
                new_id,
            }),
            None => {
                self.mappings.insert(key, new_id);
                Ok(())
            }
        }
    }

    fn get(&self, entity_type: &str, old_id: i64) -> Option<i64> {
        self.mappings.get(&(entity_type.to_string(), old_id)).copied()
    }

    fn len(&self) -> usize {
        self.mappings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let mut registry = InMemoryMigrationRegistry::new();
        registry.put("user", 7, 107).unwrap();
        registry.put("user", 7, 107).unwrap();

        assert_eq!(registry.get("user", 7), Some(107));
        assert_eq!(registry.get("user", 8), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_remap_rejected() {
        let mut registry = InMemoryMigrationRegistry::new();
        registry.put("user", 7, 107).unwrap();

        assert_eq!(
            registry.put("user", 7, 108),
            Err(RegistryError::Conflict {
                entity_type: "user".into(),
                old_id: 7,
                existing: 107,
                new_id: 108,
            })
        );
        assert_eq!(registry.get("user", 7), Some(107));
    }

    #[test]
    fn test_entity_types_are_separate() {
        let mut registry = InMemoryMigrationRegistry::new();
        registry.put("user", 1, 10).unwrap();
        registry.put("group", 1, 20).unwrap();

        assert_eq!(registry.get("user", 1), Some(10));
        assert_eq!(registry.get("group", 1), Some(20));
        assert_eq!(registry.get("question", 1), None);
    }

    #[test]
    fn test_load_from_toml() {
        let registry = InMemoryMigrationRegistry::from_toml_str(
            r#"
            [user]
            7 = 107
            8 = 108

            [question]
            70 = 700
            "#,
        )
        .unwrap();

        assert_eq!(registry.entries("user"), vec![(7, 107), (8, 108)]);
        assert_eq!(registry.get("question", 70), Some(700));

        let err = InMemoryMigrationRegistry::from_toml_str("[user]\nseven = 1").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidId { .. }));
    }

    #[test]
    fn test_written_mappings_load_back() {
        let mut registry = InMemoryMigrationRegistry::new();
        registry.put("user", 100, 1100).unwrap();
        registry.put("studentquiz_comment", 9, 3).unwrap();

        let text = registry.to_toml_string().unwrap();
        let loaded = InMemoryMigrationRegistry::from_toml_str(&text).unwrap();
        assert_eq!(loaded.entries("user"), vec![(100, 1100)]);
        assert_eq!(loaded.get("studentquiz_comment", 9), Some(3));
        assert_eq!(loaded.len(), 2);
    }
}
