//! Drivers by name

use std::collections::BTreeMap;
use std::sync::Arc;

use arkiv_core::{ArkivError, Connection, ConnectionConfig, DatabaseDriver, Result};

/// Maps the `driver` field of a [`ConnectionConfig`] to the driver that
/// opens it.
pub struct DriverRegistry {
    drivers: BTreeMap<&'static str, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: BTreeMap::new(),
        }
    }

    /// Every driver compiled in through cargo features.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(crate::sqlite::SqliteDriver::new()));

        registry
    }

    /// Registers `driver`, replacing any driver with the same name.
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        tracing::debug!(driver = driver.name(), "registering database driver");
        self.drivers.insert(driver.name(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DatabaseDriver>> {
        self.drivers.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.keys().copied().collect()
    }

    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let driver = self.get(&config.driver).ok_or_else(|| {
            ArkivError::NotFound(format!("No driver registered for '{}'", config.driver))
        })?;
        driver.connect(config).await
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
