//! Connection and transaction traits

use crate::{QueryResult, Result, StatementResult, Value};
use async_trait::async_trait;

/// An open database the engine reads from or writes into.
///
/// Placeholders in `sql` are `$1`, `$2`, ... and bind `params` by position.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Driver name, recorded in backup documents
    fn driver_name(&self) -> &str;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// A transaction on a [`Connection`].
///
/// Dropping a transaction without calling `commit` or `rollback` must leave
/// the connection without an open transaction.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;
}
