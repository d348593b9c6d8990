//! Arkiv Core - database abstractions shared by the backup engine and drivers
//!
//! - `DatabaseDriver` opens connections from a `ConnectionConfig`
//! - `Connection` / `Transaction` run statements and queries
//! - `Value`, `Row` and `QueryResult` carry data across the driver boundary
//! - `ArkivError` is the error every driver reports through

mod connection;
mod driver;
mod error;
mod types;

pub use connection::*;
pub use driver::*;
pub use error::*;
pub use types::*;
