//! Named, memoized connection construction
//!
//! [`ConnectionFactory::connection`] resolves a connection name to an adapter
//! kind, builds the adapter on first use and hands out the same instance for
//! later requests with the same kind, name and options.

use crate::base::ConnectOptions;
use crate::retry::RetryPolicy;
use crate::sql::SqlConnection;
use crate::warehouse::{SessionBuilder, WarehouseConnection, WarehouseConnector};
use conduit_core::{ConduitError, DataFrame, ReadOptions, Result, SecretsProvider, TomlSecrets};
use conduit_drivers::{DriverRegistry, missing_dependency_hint};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Names starting with this prefix are read from the environment
const ENV_PREFIX: &str = "env:";

/// Adapter kinds the factory can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Sql,
    Warehouse,
}

impl ConnectionKind {
    pub const SUPPORTED: &'static [&'static str] = &["snowpark", "sql"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Sql => "sql",
            ConnectionKind::Warehouse => "snowpark",
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = ConduitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sql" => Ok(ConnectionKind::Sql),
            "snowpark" | "warehouse" => Ok(ConnectionKind::Warehouse),
            _ => Err(ConduitError::Configuration(format!(
                "Invalid connection '{}'. Supported connection kinds: {}",
                s,
                Self::SUPPORTED.join(", ")
            ))),
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any adapter the factory can hand out
#[derive(Clone)]
pub enum AnyConnection {
    Sql(Arc<SqlConnection>),
    Warehouse(Arc<WarehouseConnection>),
}

impl AnyConnection {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            AnyConnection::Sql(_) => ConnectionKind::Sql,
            AnyConnection::Warehouse(_) => ConnectionKind::Warehouse,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnyConnection::Sql(conn) => conn.name(),
            AnyConnection::Warehouse(conn) => conn.name(),
        }
    }

    pub fn as_sql(&self) -> Option<&Arc<SqlConnection>> {
        match self {
            AnyConnection::Sql(conn) => Some(conn),
            AnyConnection::Warehouse(_) => None,
        }
    }

    pub fn as_warehouse(&self) -> Option<&Arc<WarehouseConnection>> {
        match self {
            AnyConnection::Warehouse(conn) => Some(conn),
            AnyConnection::Sql(_) => None,
        }
    }

    /// Cached, retried read-only query with default read options
    pub async fn query(&self, sql: &str, ttl: Option<Duration>) -> Result<DataFrame> {
        match self {
            AnyConnection::Sql(conn) => conn.query(sql, ttl, &ReadOptions::default()).await,
            AnyConnection::Warehouse(conn) => conn.query(sql, ttl).await,
        }
    }

    pub fn reset(&self) {
        match self {
            AnyConnection::Sql(conn) => conn.reset(),
            AnyConnection::Warehouse(conn) => conn.reset(),
        }
    }

    pub fn on_secrets_changed(&self) -> bool {
        match self {
            AnyConnection::Sql(conn) => conn.base().on_secrets_changed(),
            AnyConnection::Warehouse(conn) => conn.base().on_secrets_changed(),
        }
    }

    pub async fn describe(&self) -> Result<String> {
        match self {
            AnyConnection::Sql(conn) => conn.describe().await,
            AnyConnection::Warehouse(conn) => conn.describe().await,
        }
    }
}

impl std::fmt::Debug for AnyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyConnection")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Bounds on the factory's memo
#[derive(Debug, Clone, Default)]
pub struct MemoPolicy {
    /// Instances older than this are rebuilt on next request
    pub ttl: Option<Duration>,
    /// Oldest instances are evicted beyond this many
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    kind: ConnectionKind,
    name: String,
    options: String,
}

struct MemoEntry {
    connection: AnyConnection,
    created_at: Instant,
}

/// Builds adapters by name and keeps them for reuse
pub struct ConnectionFactory {
    secrets: Arc<dyn SecretsProvider>,
    drivers: Arc<DriverRegistry>,
    session_builder: Option<Arc<dyn SessionBuilder>>,
    legacy_config: Option<PathBuf>,
    retry: RetryPolicy,
    policy: MemoPolicy,
    memo: tokio::sync::Mutex<HashMap<MemoKey, MemoEntry>>,
}

impl ConnectionFactory {
    /// Factory with the default drivers and no warehouse session builder
    pub fn new(secrets: Arc<dyn SecretsProvider>) -> Self {
        Self {
            secrets,
            drivers: Arc::new(DriverRegistry::with_defaults()),
            session_builder: None,
            legacy_config: None,
            retry: RetryPolicy::default(),
            policy: MemoPolicy::default(),
            memo: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = Arc::new(drivers);
        self
    }

    pub fn with_session_builder(mut self, builder: Arc<dyn SessionBuilder>) -> Self {
        self.session_builder = Some(builder);
        self
    }

    /// Legacy warehouse config consulted instead of `~/.snowsql/config`
    pub fn with_legacy_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_config = Some(path.into());
        self
    }

    /// Retry policy given to every adapter the factory builds
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_memo_policy(mut self, policy: MemoPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn secrets(&self) -> &Arc<dyn SecretsProvider> {
        &self.secrets
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Get or build the connection `name`.
    ///
    /// `name` may be `env:VAR` to read it from the environment. Without
    /// `kind`, first-party names (`sql`, `snowpark`) are their own kind and
    /// any other name takes its kind from `[connections.<name>].type`.
    #[tracing::instrument(skip(self, options))]
    pub async fn connection(&self, name: &str, kind: Option<&str>, options: ConnectOptions) -> Result<AnyConnection> {
        let name = resolve_name(name)?;
        let kind = self.resolve_kind(&name, kind)?;
        let key = MemoKey {
            kind,
            name: name.clone(),
            options: serde_json::to_string(&options)?,
        };

        let mut memo = self.memo.lock().await;
        if let Some(ttl) = self.policy.ttl {
            let before = memo.len();
            memo.retain(|_, entry| entry.created_at.elapsed() < ttl);
            if memo.len() < before {
                tracing::debug!(evicted = before - memo.len(), "expired memoized connections");
            }
        }
        if let Some(entry) = memo.get(&key) {
            return Ok(entry.connection.clone());
        }

        let connection = self.build(kind, &name, options).await?;
        tracing::info!(connection = %name, kind = %kind, "connection created");

        memo.insert(
            key,
            MemoEntry {
                connection: connection.clone(),
                created_at: Instant::now(),
            },
        );
        if let Some(max_entries) = self.policy.max_entries {
            while memo.len() > max_entries.max(1) {
                let oldest = memo
                    .iter()
                    .min_by_key(|(_, entry)| entry.created_at)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        memo.remove(&key);
                    }
                    None => break,
                }
            }
        }

        Ok(connection)
    }

    /// Typed shortcut for a SQL connection
    pub async fn sql(&self, name: &str, options: ConnectOptions) -> Result<Arc<SqlConnection>> {
        match self.connection(name, Some("sql"), options).await? {
            AnyConnection::Sql(conn) => Ok(conn),
            AnyConnection::Warehouse(_) => unreachable!("sql kind always builds a SQL connection"),
        }
    }

    /// Typed shortcut for a warehouse connection
    pub async fn warehouse(&self, name: &str, options: ConnectOptions) -> Result<Arc<WarehouseConnection>> {
        match self.connection(name, Some("snowpark"), options).await? {
            AnyConnection::Warehouse(conn) => Ok(conn),
            AnyConnection::Sql(_) => unreachable!("snowpark kind always builds a warehouse connection"),
        }
    }

    /// Forget every memoized connection
    pub async fn clear(&self) {
        self.memo.lock().await.clear();
        tracing::debug!("connection memo cleared");
    }

    pub async fn len(&self) -> usize {
        self.memo.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.memo.lock().await.is_empty()
    }

    /// Reset every memoized connection whose secrets changed.
    ///
    /// Returns how many were reset.
    pub async fn secrets_changed(&self) -> usize {
        let memo = self.memo.lock().await;
        memo.values()
            .filter(|entry| entry.connection.on_secrets_changed())
            .count()
    }

    fn resolve_kind(&self, name: &str, kind: Option<&str>) -> Result<ConnectionKind> {
        if let Some(kind) = kind {
            return kind.parse();
        }
        if ConnectionKind::SUPPORTED.contains(&name) {
            return name.parse();
        }

        match self.secrets.connection_section(name).get_str("type") {
            Some(kind) => kind.parse(),
            None => Err(ConduitError::Configuration(format!(
                "Could not determine the kind of connection '{}'. Set `type` in [connections.{}] or pass a kind explicitly",
                name, name
            ))),
        }
    }

    async fn build(&self, kind: ConnectionKind, name: &str, options: ConnectOptions) -> Result<AnyConnection> {
        let connection = match kind {
            ConnectionKind::Sql => {
                let conn = SqlConnection::new(name, Arc::clone(&self.drivers), Arc::clone(&self.secrets), options)
                    .await?
                    .with_retry_policy(self.retry.clone());
                AnyConnection::Sql(Arc::new(conn))
            }
            ConnectionKind::Warehouse => {
                let builder = self.session_builder.clone().ok_or_else(|| ConduitError::MissingDependency {
                    message: "No warehouse session builder is configured".into(),
                    hint: missing_dependency_hint("snowflake"),
                })?;
                let mut connector = WarehouseConnector::new(builder);
                if let Some(path) = &self.legacy_config {
                    connector = connector.with_legacy_config(path.clone());
                }
                let conn = WarehouseConnection::new(name, connector, Arc::clone(&self.secrets), options)
                    .await?
                    .with_retry_policy(self.retry.clone());
                AnyConnection::Warehouse(Arc::new(conn))
            }
        };
        Ok(connection)
    }
}

fn resolve_name(name: &str) -> Result<String> {
    match name.strip_prefix(ENV_PREFIX) {
        Some(var) => std::env::var(var).map_err(|_| {
            ConduitError::Configuration(format!(
                "Environment variable '{}' holding the connection name is not set",
                var
            ))
        }),
        None => Ok(name.to_string()),
    }
}

static GLOBAL_FACTORY: OnceLock<ConnectionFactory> = OnceLock::new();

/// Process-wide factory, built from the default secrets files on first use
pub fn global() -> &'static ConnectionFactory {
    GLOBAL_FACTORY.get_or_init(|| ConnectionFactory::new(Arc::new(TomlSecrets::load_default())))
}

/// Install `factory` as the process-wide factory. Fails once one exists.
pub fn install_global(factory: ConnectionFactory) -> Result<()> {
    GLOBAL_FACTORY.set(factory).map_err(|_| {
        ConduitError::Configuration("The global connection factory is already initialized".into())
    })
}

/// [`ConnectionFactory::connection`] on the process-wide factory
pub async fn connection(name: &str, kind: Option<&str>, options: ConnectOptions) -> Result<AnyConnection> {
    global().connection(name, kind, options).await
}
