//! Well-known file locations

use crate::{ConduitError, Result};
use std::path::{Path, PathBuf};

pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| ConduitError::Configuration("Unable to determine HOME directory".into()))
}

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| ConduitError::Configuration("Could not determine config directory".into()))
        .map(|p| p.join("conduit"))
}

pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| ConduitError::Configuration("Could not determine data directory".into()))
        .map(|p| p.join("conduit"))
}

/// `~/.conduit/secrets.toml`
pub fn global_secrets_file() -> Result<PathBuf> {
    home_dir().map(|p| p.join(".conduit").join("secrets.toml"))
}

/// `./.conduit/secrets.toml`, relative to the working directory
pub fn project_secrets_file() -> PathBuf {
    Path::new(".conduit").join("secrets.toml")
}

/// `~/.snowsql/config`
pub fn snowsql_config_file() -> Result<PathBuf> {
    home_dir().map(|p| p.join(".snowsql").join("config"))
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().map(|home| home.join(rest));
    }
    if path.starts_with('~') && path != "~" {
        return Err(ConduitError::Configuration(
            "User-specific home directories (~user) are not supported".into(),
        ));
    }
    if path == "~" {
        return home_dir();
    }
    Ok(PathBuf::from(path))
}
