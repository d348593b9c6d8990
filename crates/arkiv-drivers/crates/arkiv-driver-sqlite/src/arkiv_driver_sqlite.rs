//! SQLite database driver implementation

mod connection;
mod driver;

pub use connection::{SqliteConnection, SqliteTransaction};
pub use driver::SqliteDriver;
