//! SQLite connection and transaction

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arkiv_core::{
    ArkivError, Connection, QueryResult, Result, Row, StatementResult, Transaction, Value,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection as RusqliteConnection, OpenFlags, params_from_iter};

const MEMORY: &str = ":memory:";

/// A site database. Transactions share the one underlying connection.
pub struct SqliteConnection {
    conn: Arc<Mutex<RusqliteConnection>>,
}

impl SqliteConnection {
    /// Opens or creates the database file at `path`, or a private in-memory
    /// database for `:memory:`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == MEMORY {
            RusqliteConnection::open_in_memory().map_err(|e| {
                ArkivError::Connection(format!("Failed to open in-memory database: {}", e))
            })?
        } else {
            let resolved = resolve_path(path)?;
            if let Some(parent) = resolved.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                return Err(ArkivError::Connection(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }

            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            let conn = RusqliteConnection::open_with_flags(&resolved, flags).map_err(|e| {
                ArkivError::Connection(format!(
                    "Failed to open SQLite database at '{}': {}",
                    resolved.display(),
                    e
                ))
            })?;
            conn.pragma_update(None, "journal_mode", "WAL").map_err(|e| {
                ArkivError::Connection(format!("Failed to set journal mode: {}", e))
            })?;
            conn
        };

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| ArkivError::Connection(format!("Failed to enable foreign keys: {}", e)))?;

        tracing::info!(path = %path, "SQLite database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY)
    }

    /// How long a statement waits on a locked database before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .lock()
            .busy_timeout(timeout)
            .map_err(|e| ArkivError::Configuration(format!("Failed to set busy timeout: {}", e)))
    }

    /// Runs several statements at once, e.g. a table script or fixture.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        tracing::debug!("executing SQL batch");
        let conn = self.conn.lock();
        conn.execute_batch(sql)
            .map_err(|e| ArkivError::Query(format!("Failed to execute batch: {}", e)))
    }
}

/// Expands `~/` and makes relative paths absolute.
fn resolve_path(path: &str) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var_os("HOME").ok_or_else(|| {
                ArkivError::Configuration("Unable to determine HOME directory".into())
            })?;
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    };
    if expanded.is_relative() {
        Ok(std::env::current_dir()?.join(expanded))
    } else {
        Ok(expanded)
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %preview(sql)))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let conn = self.conn.lock();
        run_statement(&conn, sql, params)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %preview(sql)))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.conn.lock();
        run_query(&conn, sql, params)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning SQLite transaction");
        {
            let conn = self.conn.lock();
            // Snapshot at the first read, write lock at the first write
            conn.execute_batch("BEGIN DEFERRED").map_err(|e| {
                ArkivError::Transaction(format!("Failed to begin transaction: {}", e))
            })?;
        }
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            finished: false,
        }))
    }
}

pub struct SqliteTransaction {
    conn: Arc<Mutex<RusqliteConnection>>,
    finished: bool,
}

impl SqliteTransaction {
    fn finish(&mut self, statement: &str) -> Result<()> {
        if self.finished {
            return Err(ArkivError::Transaction("Transaction already finished".into()));
        }
        let conn = self.conn.lock();
        conn.execute_batch(statement)
            .map_err(|e| ArkivError::Transaction(format!("{} failed: {}", statement, e)))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("SQLite transaction dropped while open, rolling back");
            let conn = self.conn.lock();
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %e, "rollback on drop failed");
            }
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("committing SQLite transaction");
        self.finish("COMMIT")
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back SQLite transaction");
        self.finish("ROLLBACK")
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql_preview = %preview(sql), "query in transaction");
        let conn = self.conn.lock();
        run_query(&conn, sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        tracing::debug!(sql_preview = %preview(sql), "statement in transaction");
        let conn = self.conn.lock();
        run_statement(&conn, sql, params)
    }
}

fn preview(sql: &str) -> String {
    sql.chars().take(100).collect()
}

fn run_statement(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<StatementResult> {
    let affected = conn
        .execute(sql, params_from_iter(params.iter().map(to_sql)))
        .map_err(|e| ArkivError::Query(format!("Failed to execute statement: {}", e)))?;

    let is_insert = sql
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"));
    let last_insert_id = (is_insert && affected > 0).then(|| conn.last_insert_rowid());

    tracing::debug!(affected_rows = affected, ?last_insert_id, "statement executed");
    Ok(StatementResult {
        affected_rows: affected as u64,
        last_insert_id,
    })
}

fn run_query(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ArkivError::Query(format!("Failed to prepare query: {}", e)))?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    let mut cursor = stmt
        .query(params_from_iter(params.iter().map(to_sql)))
        .map_err(|e| ArkivError::Query(format!("Failed to execute query: {}", e)))?;
    while let Some(row) = cursor
        .next()
        .map_err(|e| ArkivError::Query(format!("Failed to fetch row: {}", e)))?
    {
        let values = (0..columns.len())
            .map(|idx| {
                row.get_ref(idx)
                    .map(from_sql)
                    .map_err(|e| ArkivError::Query(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        rows.push(Row::new(Arc::clone(&columns), values));
    }

    tracing::debug!(row_count = rows.len(), "query executed");
    Ok(QueryResult { columns, rows })
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}
