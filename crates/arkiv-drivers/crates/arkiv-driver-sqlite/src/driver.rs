//! SQLite driver

use std::sync::Arc;
use std::time::Duration;

use arkiv_core::{ArkivError, Connection, ConnectionConfig, DatabaseDriver, Result};
use async_trait::async_trait;

use crate::SqliteConnection;

/// Opens site databases from a file path.
///
/// Parameters: `path` (or the config's database field) and an optional
/// `busy_timeout` in milliseconds.
#[derive(Debug, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[tracing::instrument(skip(self, config), fields(path = config.get_string("path").as_deref()))]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let path = config.get_string("path").ok_or_else(|| {
            ArkivError::Configuration(
                "SQLite requires a 'path' or 'database' parameter, e.g. /path/to/site.db or :memory:"
                    .into(),
            )
        })?;
        let busy_timeout = config
            .get_string("busy_timeout")
            .map(|ms| {
                ms.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                    ArkivError::Configuration(format!("invalid busy_timeout '{}'", ms))
                })
            })
            .transpose()?;

        let conn = SqliteConnection::open(&path).inspect_err(|e| {
            tracing::error!(error = %e, "failed to open SQLite database");
        })?;
        if let Some(timeout) = busy_timeout {
            conn.set_busy_timeout(timeout)?;
        }
        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_busy_timeout_rejected() {
        let config = ConnectionConfig::new_sqlite(":memory:").with_param("busy_timeout", "soon");
        let err = SqliteDriver::new().connect(&config).await.err();
        assert!(matches!(err, Some(ArkivError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_path_rejected() {
        let config = ConnectionConfig::new("sqlite");
        let err = SqliteDriver::new().connect(&config).await.err();
        assert!(matches!(err, Some(ArkivError::Configuration(_))));
    }
}
