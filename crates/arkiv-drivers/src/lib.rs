//! Arkiv Drivers - database driver implementations
//!
//! This crate re-exports the concrete drivers for the traits defined in
//! `arkiv-core`, each behind a cargo feature.

#[cfg(feature = "sqlite")]
pub use arkiv_driver_sqlite as sqlite;

mod registry;

pub use registry::DriverRegistry;

pub use arkiv_core::{
    ArkivError, Connection, ConnectionConfig, DatabaseDriver, QueryResult, Result, Row,
    StatementResult, Transaction, Value,
};
