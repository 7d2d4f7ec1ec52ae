//! SQLite driver implementation

use async_trait::async_trait;
use conduit_core::{Connection, ConnectionUrl, DatabaseDriver, EngineOptions, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::SqliteConnection;

/// SQLite database driver
///
/// `sqlite:///relative.db` and `sqlite:////absolute.db` open files,
/// `sqlite://` opens an in-memory database.
pub struct SqliteDriver;

impl SqliteDriver {
    /// Create a new SQLite driver instance
    pub fn new() -> Self {
        tracing::debug!("SQLite driver initialized");
        Self
    }

    /// Database path addressed by `url`
    pub fn database_path(url: &ConnectionUrl) -> String {
        url.database()
            .map(str::to_string)
            .unwrap_or_else(|| ":memory:".to_string())
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["sqlite3"]
    }

    fn display_name(&self) -> &'static str {
        "SQLite"
    }

    #[tracing::instrument(skip(self, url, options), fields(path = url.database()))]
    async fn connect(&self, url: &ConnectionUrl, options: &EngineOptions) -> Result<Arc<dyn Connection>> {
        let path = Self::database_path(url);
        let conn = SqliteConnection::open(&path).inspect_err(|e| {
            tracing::error!(error = %e, "failed to connect to SQLite database");
        })?;

        if let Some(level) = options.isolation_level {
            conn.apply_isolation_level(level)?;
        }
        if let Some(ms) = options.get_u64("busy_timeout_ms") {
            conn.set_busy_timeout(Duration::from_millis(ms))?;
        }

        tracing::info!(path = %path, "SQLite connection created");
        Ok(Arc::new(conn))
    }
}
