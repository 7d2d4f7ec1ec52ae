//! Database driver trait definition

use crate::{Connection, ConnectionUrl, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Transaction isolation level requested for an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Every statement commits on its own
    Autocommit,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Autocommit => "AUTOCOMMIT",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options used when a driver opens a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Isolation level forced onto every connection, if any
    pub isolation_level: Option<IsolationLevel>,
    /// Driver-specific options, passed through untouched
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_autocommit(&self) -> bool {
        self.isolation_level == Some(IsolationLevel::Autocommit)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(serde_json::Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(serde_json::Value::as_u64)
    }
}

/// Database driver trait
///
/// A driver turns a [`ConnectionUrl`] into a live [`Connection`]. Drivers are
/// registered by dialect name, e.g. `sqlite` or `postgresql`.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Dialect name matched against the URL's backend name
    fn name(&self) -> &'static str;

    /// Other dialect names this driver answers to
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Human-readable driver name
    fn display_name(&self) -> &'static str;

    /// Open a connection to `url`
    async fn connect(&self, url: &ConnectionUrl, options: &EngineOptions) -> Result<Arc<dyn Connection>>;

    /// Test a connection
    async fn test_connection(&self, url: &ConnectionUrl, options: &EngineOptions) -> Result<()> {
        let conn = self.connect(url, options).await?;
        conn.query("SELECT 1", &[]).await?;
        conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_serde_names() {
        let json = serde_json::to_string(&IsolationLevel::Autocommit).unwrap();
        assert_eq!(json, "\"AUTOCOMMIT\"");
        let level: IsolationLevel = serde_json::from_str("\"READ_COMMITTED\"").unwrap();
        assert_eq!(level, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_engine_options_accessors() {
        let options = EngineOptions::new()
            .with_isolation_level(IsolationLevel::Autocommit)
            .with_option("pool_size", serde_json::json!(5))
            .with_option("echo", serde_json::json!(true));

        assert!(options.is_autocommit());
        assert_eq!(options.get_u64("pool_size"), Some(5));
        assert_eq!(options.get_bool("echo"), Some(true));
        assert_eq!(options.get_bool("missing"), None);
    }
}
