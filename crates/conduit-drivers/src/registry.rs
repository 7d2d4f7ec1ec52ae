//! Driver registry for managing available database drivers

use conduit_core::{ConduitError, ConnectionUrl, DatabaseDriver, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Client packages for dialects without a bundled driver
const KNOWN_DRIVER_PACKAGES: &[(&str, &str)] = &[
    ("postgresql", "tokio-postgres"),
    ("postgres", "tokio-postgres"),
    ("mysql", "mysql_async"),
    ("mariadb", "mysql_async"),
    ("mssql", "tiberius"),
    ("duckdb", "duckdb"),
    ("clickhouse", "clickhouse"),
    ("snowflake", "snowflake-api"),
    ("snowpark", "snowflake-api"),
];

const GENERIC_DEPENDENCY_HINT: &str =
    "You may be missing a dependency required to use this connection.";

/// Actionable hint for a dialect whose driver is not available
pub fn missing_dependency_hint(dialect: &str) -> String {
    let dialect = dialect.to_lowercase();
    KNOWN_DRIVER_PACKAGES
        .iter()
        .find(|(name, _)| *name == dialect)
        .map(|(_, package)| {
            format!("You need to install the '{}' package to use this connection.", package)
        })
        .unwrap_or_else(|| GENERIC_DEPENDENCY_HINT.to_string())
}

/// Registry of available database drivers
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DatabaseDriver>>,
    aliases: HashMap<String, String>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Create a registry with all built-in drivers registered
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(crate::sqlite::SqliteDriver::new()));

        registry
    }

    /// Register a new driver under its name and aliases
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        let name = driver.name().to_string();
        tracing::info!(driver = %name, "registering database driver");
        for alias in driver.aliases() {
            self.aliases.insert(alias.to_string(), name.clone());
        }
        self.drivers.insert(name, driver);
    }

    /// Get a driver by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<dyn DatabaseDriver>> {
        let name = name.to_lowercase();
        let canonical = self.aliases.get(&name).unwrap_or(&name);
        let driver = self.drivers.get(canonical).cloned();
        if driver.is_none() {
            tracing::warn!(driver = %name, "driver not found in registry");
        }
        driver
    }

    /// Driver for the URL's backend, or a missing-dependency error
    pub fn resolve(&self, url: &ConnectionUrl) -> Result<Arc<dyn DatabaseDriver>> {
        let backend = url.backend_name();
        self.get(backend).ok_or_else(|| ConduitError::MissingDependency {
            message: format!("No driver available for dialect '{}'", backend),
            hint: missing_dependency_hint(backend),
        })
    }

    /// List all registered driver names
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check if a driver is registered under `name` or an alias
    pub fn has(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.drivers.contains_key(&name) || self.aliases.contains_key(&name)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
