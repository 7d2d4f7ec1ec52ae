//! Data-warehouse session adapter
//!
//! Warehouse sessions are not safe for concurrent use, so every access to
//! the handle, including construction and reconnection, goes through one
//! async mutex. Queries queue behind it. A caller holding
//! [`WarehouseConnection::session`] runs further queries through the
//! returned guard, which reuses the held lock.

mod snowsql;

pub use snowsql::{load_snowsql_config, normalize_connection_params};

use crate::base::{BaseConnection, ConnectOptions, Connector};
use crate::cache::QueryCache;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use conduit_core::{ConduitError, DataFrame, Result, SecretsProvider, SecretsSection, paths};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Fields that must be present in the session config, checked in order
const REQUIRED_CONNECTION_PARAMS: &[&str] = &["account", "user"];

/// A live warehouse session
#[async_trait]
pub trait WarehouseSession: Send + Sync {
    /// Run a statement and collect its result
    async fn sql(&self, query: &str) -> Result<DataFrame>;

    async fn close(&self) -> Result<()>;
}

/// Creates warehouse sessions from a flat config map
#[async_trait]
pub trait SessionBuilder: Send + Sync {
    async fn create(&self, config: &BTreeMap<String, String>) -> Result<Arc<dyn WarehouseSession>>;
}

/// Builds warehouse sessions from secrets or the legacy config file
pub struct WarehouseConnector {
    builder: Arc<dyn SessionBuilder>,
    legacy_config: Option<PathBuf>,
}

impl WarehouseConnector {
    pub fn new(builder: Arc<dyn SessionBuilder>) -> Self {
        Self {
            builder,
            legacy_config: None,
        }
    }

    /// Read legacy credentials from `path` instead of `~/.snowsql/config`
    pub fn with_legacy_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_config = Some(path.into());
        self
    }

    fn legacy_config_path(&self) -> Result<PathBuf> {
        match &self.legacy_config {
            Some(path) => Ok(path.clone()),
            None => paths::snowsql_config_file(),
        }
    }

    /// Session config from secrets, falling back to the legacy file
    pub fn session_config(&self, secrets: &SecretsSection, options: &ConnectOptions) -> Result<BTreeMap<String, String>> {
        let mut config = if secrets.is_empty() {
            load_snowsql_config(&self.legacy_config_path()?)?
        } else {
            secrets.to_map()
        };

        for (key, value) in options {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            config.insert(key.clone(), value);
        }

        for param in REQUIRED_CONNECTION_PARAMS {
            if !config.contains_key(*param) {
                return Err(ConduitError::Configuration(format!(
                    "Missing Snowpark connection param: {}",
                    param
                )));
            }
        }
        Ok(config)
    }
}

#[async_trait]
impl Connector for WarehouseConnector {
    type Handle = Arc<dyn WarehouseSession>;

    const KIND: &'static str = "snowpark";
    const DEFAULT_CONNECTION_NAME: &'static str = "snowpark";

    #[tracing::instrument(skip(self, secrets, options))]
    async fn connect(&self, secrets: &SecretsSection, options: &ConnectOptions) -> Result<Self::Handle> {
        let config = self.session_config(secrets, options)?;
        tracing::debug!(account = %config["account"], "creating warehouse session");
        self.builder.create(&config).await
    }
}

/// Warehouse adapter with cached, retried, serialized queries
pub struct WarehouseConnection {
    base: BaseConnection<WarehouseConnector>,
    lock: Mutex<()>,
    cache: QueryCache<DataFrame>,
    retry: RetryPolicy,
}

impl WarehouseConnection {
    pub async fn new(
        name: &str,
        connector: WarehouseConnector,
        secrets: Arc<dyn SecretsProvider>,
        options: ConnectOptions,
    ) -> Result<Self> {
        let lock = Mutex::new(());
        let base = {
            let _guard = lock.lock().await;
            BaseConnection::new(name, connector, secrets, options).await?
        };

        Ok(Self {
            base,
            lock,
            cache: QueryCache::new(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base(&self) -> &BaseConnection<WarehouseConnector> {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn reset(&self) {
        self.base.reset();
    }

    /// Run a read-only statement with the same caching and retry contract
    /// as the SQL adapter.
    ///
    /// Waits for the adapter lock; while holding a session guard, use
    /// [`WarehouseSessionGuard::query`] instead.
    #[tracing::instrument(skip(self, sql), fields(connection = %self.base.name(), sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn query(&self, sql: &str, ttl: Option<Duration>) -> Result<DataFrame> {
        self.cached_query(sql, ttl, false).await
    }

    /// `lock_held` is set when the caller already owns the adapter lock
    async fn cached_query(&self, sql: &str, ttl: Option<Duration>, lock_held: bool) -> Result<DataFrame> {
        self.retry
            .run(
                |_| {
                    self.cache.get_or_try_insert_with(sql, ttl, || async {
                        let _guard = if lock_held { None } else { Some(self.lock.lock().await) };
                        let session = self.base.instance().await?;
                        session.sql(sql).await
                    })
                },
                |_| self.base.reset(),
            )
            .await
    }

    /// Exclusive access to the session until the guard is dropped
    pub async fn session(&self) -> Result<WarehouseSessionGuard<'_>> {
        let guard = self.lock.lock().await;
        let session = self.base.instance().await?;
        Ok(WarehouseSessionGuard {
            conn: self,
            session,
            _guard: guard,
        })
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache(&self) -> &QueryCache<DataFrame> {
        &self.cache
    }

    pub async fn describe(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        self.base.describe().await
    }
}

/// Lock-holding handle returned by [`WarehouseConnection::session`]
///
/// Dereferences to the session that was live when the guard was taken.
pub struct WarehouseSessionGuard<'a> {
    conn: &'a WarehouseConnection,
    session: Arc<dyn WarehouseSession>,
    _guard: MutexGuard<'a, ()>,
}

impl WarehouseSessionGuard<'_> {
    /// Cached, retried query under the lock this guard already holds
    #[tracing::instrument(skip(self, sql), fields(connection = %self.conn.name(), sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn query(&self, sql: &str, ttl: Option<Duration>) -> Result<DataFrame> {
        self.conn.cached_query(sql, ttl, true).await
    }
}

impl Deref for WarehouseSessionGuard<'_> {
    type Target = dyn WarehouseSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}
