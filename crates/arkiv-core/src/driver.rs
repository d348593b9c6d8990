//! Driver trait and connection settings

use crate::{Connection, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Opens connections for one database engine.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Name the driver is registered under, e.g. "sqlite"
    fn name(&self) -> &'static str;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>>;
}

/// Where a connection points.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Registered driver name
    pub driver: String,
    /// Database name or file path
    pub database: Option<String>,
    /// Driver-specific parameters
    pub params: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            database: None,
            params: HashMap::new(),
        }
    }

    pub fn new_sqlite(database_path: &str) -> Self {
        let mut config = Self::new("sqlite");
        config.database = Some(database_path.to_string());
        config
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// Looks up a parameter; "database" and "path" fall back to the
    /// database field.
    pub fn get_string(&self, key: &str) -> Option<String> {
        if let Some(val) = self.params.get(key) {
            return Some(val.clone());
        }
        match key {
            "database" | "path" => self.database.clone(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_config_path_lookup() {
        let config = ConnectionConfig::new_sqlite("/tmp/site.db").with_param("busy_timeout", 500);
        assert_eq!(config.get_string("path").as_deref(), Some("/tmp/site.db"));
        assert_eq!(config.get_string("busy_timeout").as_deref(), Some("500"));
        assert_eq!(config.get_string("unknown"), None);
    }
}
