//! SQL engine adapter
//!
//! Credentials come from the `[connections.<name>]` secrets table, either as
//! a complete `url` or as separate `dialect`, `driver`, `username`,
//! `password`, `host`, `port` and `database` fields.

use crate::base::{BaseConnection, ConnectOptions, Connector};
use crate::cache::QueryCache;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use conduit_core::{
    ConduitError, Connection, ConnectionUrl, DataFrame, EngineOptions, IsolationLevel,
    QueryResult, ReadOptions, Result, SecretsProvider, SecretsSection, StatementResult,
    Transaction, Value, read_sql,
};
use conduit_drivers::DriverRegistry;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Fields that must be present when no `url` secret is given, checked in order
const REQUIRED_CONNECTION_PARAMS: &[&str] = &["dialect", "username", "host"];

/// A connected database engine
#[derive(Clone)]
pub struct Engine {
    url: ConnectionUrl,
    options: EngineOptions,
    connection: Arc<dyn Connection>,
}

impl Engine {
    pub fn url(&self) -> &ConnectionUrl {
        &self.url
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Dialect name, e.g. `postgresql`
    pub fn dialect(&self) -> &str {
        self.url.backend_name()
    }

    pub fn is_autocommit(&self) -> bool {
        self.options.is_autocommit()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("url", &self.url.render(true))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Builds [`Engine`]s through the driver registry
pub struct SqlConnector {
    drivers: Arc<DriverRegistry>,
}

impl SqlConnector {
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self { drivers }
    }

    /// Connection URL described by a secrets section
    pub fn url_from_secrets(secrets: &SecretsSection) -> Result<ConnectionUrl> {
        if let Some(raw) = secrets.get_str("url") {
            return ConnectionUrl::parse(&raw);
        }

        for param in REQUIRED_CONNECTION_PARAMS {
            if !secrets.contains(param) {
                return Err(ConduitError::Configuration(format!(
                    "Missing SQL DB connection param: {}",
                    param
                )));
            }
        }

        let dialect = required_str(secrets, "dialect")?;
        let drivername = match secrets.get_str("driver") {
            Some(driver) => format!("{}+{}", dialect, driver),
            None => dialect,
        };

        let port = match secrets.get_str("port") {
            Some(raw) => Some(raw.trim().parse::<u16>().map_err(|_| {
                ConduitError::Configuration(format!(
                    "Invalid SQL DB connection param: port must be an integer, got '{}'",
                    raw
                ))
            })?),
            None => None,
        };

        let mut url = ConnectionUrl::new(drivername)
            .with_username(required_str(secrets, "username")?)
            .with_password(secrets.get_str("password"))
            .with_host(required_str(secrets, "host")?)
            .with_port(port)
            .with_database(secrets.get_str("database"));

        if let Some(query) = secrets.get("query").and_then(toml::Value::as_table) {
            for (key, value) in query {
                if let Some(value) = value.as_str() {
                    url = url.with_query_param(key.clone(), value);
                }
            }
        }

        Ok(url)
    }

    /// Split caller options into `autocommit` and pass-through engine options
    fn engine_options(options: &ConnectOptions) -> Result<EngineOptions> {
        let mut engine_options = EngineOptions::new();
        for (key, value) in options {
            if key == "autocommit" {
                let autocommit = value.as_bool().ok_or_else(|| {
                    ConduitError::Configuration("'autocommit' must be a boolean".into())
                })?;
                if autocommit {
                    engine_options = engine_options.with_isolation_level(IsolationLevel::Autocommit);
                }
            } else {
                engine_options = engine_options.with_option(key.clone(), value.clone());
            }
        }
        Ok(engine_options)
    }
}

fn required_str(secrets: &SecretsSection, key: &str) -> Result<String> {
    secrets.get_str(key).ok_or_else(|| {
        ConduitError::Configuration(format!("Missing SQL DB connection param: {}", key))
    })
}

#[async_trait]
impl Connector for SqlConnector {
    type Handle = Engine;

    const KIND: &'static str = "sql";
    const DEFAULT_CONNECTION_NAME: &'static str = "sql";

    #[tracing::instrument(skip(self, secrets, options))]
    async fn connect(&self, secrets: &SecretsSection, options: &ConnectOptions) -> Result<Engine> {
        let url = Self::url_from_secrets(secrets)?;
        let engine_options = Self::engine_options(options)?;
        let driver = self.drivers.resolve(&url)?;

        tracing::debug!(url = %url.render(true), driver = driver.name(), "creating engine");
        let connection = driver.connect(&url, &engine_options).await?;

        Ok(Engine {
            url,
            options: engine_options,
            connection,
        })
    }

    fn details(&self, engine: &Engine) -> Vec<(&'static str, String)> {
        vec![("Dialect", engine.dialect().to_string())]
    }
}

#[derive(Serialize)]
struct QueryKey<'a> {
    sql: &'a str,
    index_col: &'a [String],
    chunksize: Option<usize>,
    params: Vec<ParamKey<'a>>,
    extra: &'a BTreeMap<String, serde_json::Value>,
}

impl<'a> QueryKey<'a> {
    fn new(sql: &'a str, options: &'a ReadOptions) -> Self {
        Self {
            sql,
            index_col: &options.index_col,
            chunksize: options.chunksize,
            params: options.params.iter().map(ParamKey).collect(),
            extra: &options.extra,
        }
    }
}

/// Parameter as it appears in a cache key.
///
/// Floats are keyed by their bits; JSON has no spelling for NaN or the
/// infinities and would collapse them all to `null`.
struct ParamKey<'a>(&'a Value);

impl Serialize for ParamKey<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Float64(f) => serializer.serialize_newtype_variant("Value", 3, "Float64Bits", &f.to_bits()),
            Value::Array(values) => {
                let values: Vec<ParamKey<'_>> = values.iter().map(ParamKey).collect();
                serializer.serialize_newtype_variant("Value", 13, "Array", &values)
            }
            other => other.serialize(serializer),
        }
    }
}

/// SQL adapter with cached, retried reads and transactional sessions
pub struct SqlConnection {
    base: BaseConnection<SqlConnector>,
    cache: QueryCache<DataFrame>,
    retry: RetryPolicy,
}

impl SqlConnection {
    /// Connect `name` using the registry's drivers.
    ///
    /// Recognized options: `autocommit` (bool). Everything else is passed to
    /// the driver as an engine option.
    pub async fn new(
        name: &str,
        drivers: Arc<DriverRegistry>,
        secrets: Arc<dyn SecretsProvider>,
        options: ConnectOptions,
    ) -> Result<Self> {
        let base = BaseConnection::new(name, SqlConnector::new(drivers), secrets, options).await?;
        Ok(Self {
            base,
            cache: QueryCache::new(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base(&self) -> &BaseConnection<SqlConnector> {
        &self.base
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// The live engine, reconnecting after a reset
    pub async fn instance(&self) -> Result<Engine> {
        self.base.instance().await
    }

    pub fn reset(&self) {
        self.base.reset();
    }

    /// Run a read-only statement.
    ///
    /// Results are cached per statement text, read options and `ttl`;
    /// `None` caches indefinitely. A failed attempt resets the engine and
    /// the statement is retried under the connection's [`RetryPolicy`].
    #[tracing::instrument(skip(self, sql, options), fields(connection = %self.base.name(), sql_preview = %sql.chars().take(100).collect::<String>()))]
    pub async fn query(&self, sql: &str, ttl: Option<Duration>, options: &ReadOptions) -> Result<DataFrame> {
        options.validate()?;
        let key = QueryKey::new(sql, options);

        self.retry
            .run(
                |_| {
                    self.cache.get_or_try_insert_with(&key, ttl, || async {
                        let engine = self.base.instance().await?;
                        read_sql(engine.connection().as_ref(), sql, options).await
                    })
                },
                |_| self.base.reset(),
            )
            .await
    }

    /// Open a transactional session on the current engine.
    ///
    /// Each transaction runs on its own driver connection, so sessions may
    /// overlap and [`query`](Self::query) never reads their uncommitted
    /// work. Work that is not committed is rolled back when the session is
    /// dropped.
    pub async fn session(&self) -> Result<SqlSession> {
        let engine = self.base.instance().await?;
        Ok(SqlSession::new(engine))
    }

    /// Forget every cached query result
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache(&self) -> &QueryCache<DataFrame> {
        &self.cache
    }

    pub async fn describe(&self) -> Result<String> {
        self.base.describe().await
    }
}

/// Scoped unit of work bound to an [`Engine`]
///
/// A transaction begins with the first statement and ends at
/// [`commit`](Self::commit) or [`rollback`](Self::rollback); the next
/// statement begins a new one. Engines in autocommit mode run statements
/// directly.
pub struct SqlSession {
    engine: Engine,
    transaction: Option<Box<dyn Transaction>>,
}

impl SqlSession {
    fn new(engine: Engine) -> Self {
        tracing::debug!(dialect = engine.dialect(), "session opened");
        Self {
            engine,
            transaction: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    async fn take_transaction(&mut self) -> Result<Box<dyn Transaction>> {
        match self.transaction.take() {
            Some(transaction) => Ok(transaction),
            None => self.engine.connection.begin_transaction().await,
        }
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        if self.engine.is_autocommit() {
            return self.engine.connection.execute(sql, params).await;
        }
        let transaction = self.take_transaction().await?;
        let result = transaction.execute(sql, params).await;
        self.transaction = Some(transaction);
        result
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        if self.engine.is_autocommit() {
            return self.engine.connection.query(sql, params).await;
        }
        let transaction = self.take_transaction().await?;
        let result = transaction.query(sql, params).await;
        self.transaction = Some(transaction);
        result
    }

    /// Commit the open transaction, if any
    pub async fn commit(&mut self) -> Result<()> {
        match self.transaction.take() {
            Some(transaction) => transaction.commit().await,
            None => Ok(()),
        }
    }

    /// Roll back the open transaction, if any
    pub async fn rollback(&mut self) -> Result<()> {
        match self.transaction.take() {
            Some(transaction) => transaction.rollback().await,
            None => Ok(()),
        }
    }

    /// Roll back uncommitted work and end the session
    pub async fn close(mut self) -> Result<()> {
        self.rollback().await
    }
}

impl Drop for SqlSession {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            // Dropping the transaction rolls it back.
            tracing::debug!("session closed with uncommitted work");
            self.transaction = None;
        }
    }
}
