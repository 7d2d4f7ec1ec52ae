//! SQLite connection implementation

use async_trait::async_trait;
use conduit_core::{
    ColumnMeta, ConduitError, Connection, IsolationLevel, QueryResult, Result, Row, StatementResult,
    Transaction, Value,
};
use parking_lot::Mutex;
use rusqlite::{Connection as RusqliteConnection, OpenFlags, params_from_iter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// SQLite connection wrapper
///
/// Plain statements share one connection. Each transaction opens its own
/// connection to the same database, so an open transaction never leaks into
/// statements run outside it and several transactions can be open at once.
/// `:memory:` databases are opened as named shared-cache databases so that
/// transaction connections see the same data.
pub struct SqliteConnection {
    conn: Mutex<RusqliteConnection>,
    path: String,
    read_uncommitted: AtomicBool,
    busy_timeout: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl SqliteConnection {
    /// Open a SQLite database
    pub fn open(path: &str) -> Result<Self> {
        tracing::info!(path = %path, "opening SQLite database");
        let expanded_path = if path == ":memory:" {
            format!("file:conduit-memory-{}?mode=memory&cache=shared", uuid::Uuid::new_v4())
        } else {
            Self::expand_path(path)?
        };

        if !expanded_path.starts_with("file:") {
            let file_path = std::path::Path::new(&expanded_path);
            if let Some(parent) = file_path.parent()
                && !parent.exists()
            {
                return Err(ConduitError::Connection(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        let conn = Self::open_raw(&expanded_path)?;

        tracing::info!(path = %expanded_path, "SQLite database connection established");
        Ok(Self {
            conn: Mutex::new(conn),
            path: expanded_path,
            read_uncommitted: AtomicBool::new(false),
            busy_timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn open_raw(path: &str) -> Result<RusqliteConnection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = RusqliteConnection::open_with_flags(path, flags).map_err(|e| {
            ConduitError::Connection(format!("Failed to open SQLite database at '{}': {}", path, e))
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| ConduitError::Connection(format!("Failed to enable foreign keys: {}", e)))?;
        Ok(conn)
    }

    /// A new connection to the same database with this connection's settings
    fn open_dedicated(&self) -> Result<RusqliteConnection> {
        let conn = Self::open_raw(&self.path)?;
        if self.read_uncommitted.load(Ordering::SeqCst) {
            conn.pragma_update(None, "read_uncommitted", true)
                .map_err(|e| ConduitError::Connection(format!("Failed to set isolation level: {}", e)))?;
        }
        if let Some(timeout) = *self.busy_timeout.lock() {
            conn.busy_timeout(timeout)
                .map_err(|e| ConduitError::Connection(format!("Failed to set busy timeout: {}", e)))?;
        }
        Ok(conn)
    }

    /// Apply the engine's isolation level to this connection.
    ///
    /// SQLite is serializable by default and autocommits outside explicit
    /// transactions; only read-uncommitted needs a pragma.
    pub fn apply_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        let read_uncommitted = matches!(level, IsolationLevel::ReadUncommitted);
        self.conn
            .lock()
            .pragma_update(None, "read_uncommitted", read_uncommitted)
            .map_err(|e| ConduitError::Connection(format!("Failed to set isolation level: {}", e)))?;
        self.read_uncommitted.store(read_uncommitted, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn
            .lock()
            .busy_timeout(timeout)
            .map_err(|e| ConduitError::Connection(format!("Failed to set busy timeout: {}", e)))?;
        *self.busy_timeout.lock() = Some(timeout);
        Ok(())
    }

    /// Resolved database path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Execute multiple SQL statements in a batch
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!("executing SQL batch");
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|e| ConduitError::Query(format!("Failed to execute batch: {}", e)))
    }

    /// Expand path to handle ~ (home directory) and relative paths
    fn expand_path(path: &str) -> Result<String> {
        if path.starts_with("file:") {
            return Ok(path.to_string());
        }

        let expanded = conduit_core::paths::expand_home(path)?;
        let result = if expanded.is_relative() {
            std::env::current_dir()
                .map_err(ConduitError::Io)?
                .join(expanded)
        } else {
            expanded
        };

        Ok(result.to_string_lossy().to_string())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConduitError::Connection("SQLite connection is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    fn dialect_id(&self) -> Option<&'static str> {
        Some("sqlite")
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        run_statement(&conn, sql, params)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.ensure_open()?;
        let conn = self.conn.lock();
        run_query(&conn, sql, params)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        tracing::debug!("beginning SQLite transaction");
        let conn = self.open_dedicated()?;
        // DEFERRED takes the write lock only at the first write.
        conn.execute_batch("BEGIN DEFERRED")
            .map_err(|e| ConduitError::Query(format!("Failed to begin transaction: {}", e)))?;
        Ok(Box::new(SqliteTransaction {
            conn: Mutex::new(conn),
            committed: false,
            rolled_back: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(path = %self.path, "closing SQLite connection");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Owns its connection and issues raw `BEGIN DEFERRED` / `COMMIT` /
/// `ROLLBACK` SQL, avoiding rusqlite's borrow-based transaction lifetime.
pub struct SqliteTransaction {
    conn: Mutex<RusqliteConnection>,
    committed: bool,
    rolled_back: bool,
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.rolled_back {
            tracing::warn!("SQLite transaction dropped without commit or rollback, issuing automatic rollback");
            let conn = self.conn.lock();
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %e, "automatic rollback on drop failed");
            }
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("committing SQLite transaction");
        if self.rolled_back {
            return Err(ConduitError::Query("Transaction already rolled back".into()));
        }

        self.conn
            .lock()
            .execute_batch("COMMIT")
            .map_err(|e| ConduitError::Query(format!("Failed to commit transaction: {}", e)))?;

        self.committed = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back SQLite transaction");
        if self.committed {
            return Err(ConduitError::Query("Transaction already committed".into()));
        }

        self.conn
            .lock()
            .execute_batch("ROLLBACK")
            .map_err(|e| ConduitError::Query(format!("Failed to rollback transaction: {}", e)))?;

        self.rolled_back = true;
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing query in SQLite transaction");
        let conn = self.conn.lock();
        run_query(&conn, sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing statement in SQLite transaction");
        let conn = self.conn.lock();
        run_statement(&conn, sql, params)
    }
}

fn run_statement(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<StatementResult> {
    let rusqlite_params = values_to_rusqlite(params);
    let rows_affected = conn
        .execute(sql, params_from_iter(rusqlite_params.iter()))
        .map_err(|e| ConduitError::Query(format!("Failed to execute statement: {}", e)))?;

    tracing::debug!(affected_rows = rows_affected, "statement executed");
    Ok(StatementResult {
        affected_rows: rows_affected as u64,
    })
}

fn run_query(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let start_time = std::time::Instant::now();
    let rusqlite_params = values_to_rusqlite(params);

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ConduitError::Query(format!("Failed to prepare query: {}", e)))?;

    // Declared types come from CREATE TABLE via sqlite3_column_decltype.
    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| ColumnMeta::new(col.name(), col.decl_type().unwrap_or("DYNAMIC"), idx))
        .collect();
    let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut rows = Vec::new();
    let mut query_rows = stmt
        .query(params_from_iter(rusqlite_params.iter()))
        .map_err(|e| ConduitError::Query(format!("Failed to execute query: {}", e)))?;

    while let Some(row) = query_rows
        .next()
        .map_err(|e| ConduitError::Query(format!("Failed to fetch row: {}", e)))?
    {
        let mut values = Vec::with_capacity(column_names.len());
        for i in 0..column_names.len() {
            values.push(rusqlite_to_value(row, i)?);
        }
        rows.push(Row::new(column_names.clone(), values));
    }

    let execution_time_ms = start_time.elapsed().as_millis() as u64;
    tracing::debug!(
        row_count = rows.len(),
        execution_time_ms = execution_time_ms,
        "query executed successfully"
    );
    Ok(QueryResult {
        id: uuid::Uuid::new_v4(),
        columns,
        rows,
        affected_rows: 0,
        execution_time_ms,
    })
}

/// Convert our Value types to rusqlite-compatible types
fn values_to_rusqlite(values: &[Value]) -> Vec<rusqlite::types::Value> {
    values.iter().map(value_to_rusqlite).collect()
}

fn value_to_rusqlite(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Int64(i) => rusqlite::types::Value::Integer(*i),
        Value::Float64(f) => rusqlite::types::Value::Real(*f),
        Value::Decimal(d) => rusqlite::types::Value::Text(d.clone()),
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
        Value::Date(d) => rusqlite::types::Value::Text(d.to_string()),
        Value::Time(t) => rusqlite::types::Value::Text(t.to_string()),
        Value::DateTime(dt) => rusqlite::types::Value::Text(dt.to_string()),
        Value::DateTimeUtc(dt) => rusqlite::types::Value::Text(dt.to_rfc3339()),
        Value::Json(j) => rusqlite::types::Value::Text(j.to_string()),
        Value::Uuid(u) => rusqlite::types::Value::Text(u.to_string()),
        Value::Array(_) => rusqlite::types::Value::Null,
    }
}

/// Convert rusqlite row value to our Value type
fn rusqlite_to_value(row: &rusqlite::Row, idx: usize) -> Result<Value> {
    use rusqlite::types::ValueRef;

    let value_ref = row
        .get_ref(idx)
        .map_err(|e| ConduitError::Query(e.to_string()))?;

    let value = match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).to_string()),
        // Untyped columns can hold text in a BLOB.
        ValueRef::Blob(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Bytes(b.to_vec()),
        },
    };

    Ok(value)
}
