//! Key/value stores backing session storage

use async_trait::async_trait;
use conduit_core::{ConduitError, Result};
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Minimal expiring key/value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, expiring after `ttl`
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Remove `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Redis-backed store
///
/// The client is created eagerly but the connection is opened on first use
/// and then shared; multiplexed connections are cheap to clone. A command
/// that fails because the connection broke discards it, and the next
/// command reconnects. Failed commands are not retried.
pub struct RedisStore {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ConduitError::Configuration(format!("Invalid Redis URL '{}': {}", url, e)))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        tracing::debug!("connecting to Redis");
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConduitError::Connection(format!("Failed to connect to Redis: {}", e)))?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn command_failed(&self, command: &str, e: redis::RedisError) -> ConduitError {
        if breaks_connection(&e) {
            tracing::warn!(error = %e, "Redis connection lost, reconnecting on next command");
            *self.connection.lock().await = None;
        }
        ConduitError::Connection(format!("Redis {} failed: {}", command, e))
    }

    /// Whether a connection is currently cached
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }
}

fn breaks_connection(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

#[async_trait]
impl KeyValueStore for RedisStore {
    #[tracing::instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<Option<Vec<u8>>> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.command_failed("GET", e).await),
        }
    }

    #[tracing::instrument(skip(self, value), fields(bytes = value.len()))]
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.command_failed("SET", e).await),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<i64> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        match result {
            Ok(removed) => {
                tracing::debug!(removed, "key deleted");
                Ok(())
            }
            Err(e) => Err(self.command_failed("DEL", e).await),
        }
    }
}

/// In-process store with lazy expiry, for tests and single-node setups
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.retain(|_, (_, expires_at)| *expires_at > Instant::now());
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
