//! Session storage configuration

use crate::installation;
use conduit_core::{ConduitError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub redis_url: String,
    /// Overrides the machine-derived installation id
    pub installation_id: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            installation_id: None,
        }
    }
}

impl StorageConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| ConduitError::Configuration(format!("Invalid session storage config: {}", e)))
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn installation_id(&self) -> String {
        self.installation_id
            .clone()
            .unwrap_or_else(|| installation::installation_id().to_string())
    }
}
