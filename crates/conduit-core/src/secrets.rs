//! Secrets access
//!
//! Connection credentials live in TOML files under `[connections.<name>]`
//! tables. The global file (`~/.conduit/secrets.toml`) is read first and the
//! project file (`./.conduit/secrets.toml`) is merged over it key by key.
//! Missing or malformed files are skipped with a warning; lookups never fail.

use crate::paths;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One `[connections.<name>]` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretsSection {
    values: toml::Table,
}

impl SecretsSection {
    pub fn new(values: toml::Table) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&toml::Value> {
        self.values.get(key)
    }

    /// Scalar value rendered as a string; tables and arrays yield `None`
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(scalar_to_string)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Scalar entries as strings, nested values skipped
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
            .collect()
    }

    pub fn as_table(&self) -> &toml::Table {
        &self.values
    }
}

fn scalar_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

/// Read access to connection secrets
pub trait SecretsProvider: Send + Sync {
    /// The `[connections.<name>]` table, empty when absent or not a table
    fn connection_section(&self, name: &str) -> SecretsSection;
}

/// Secrets loaded from TOML files or an in-memory document
pub struct TomlSecrets {
    sources: Vec<PathBuf>,
    document: RwLock<toml::Table>,
}

impl TomlSecrets {
    /// Load the global and project secrets files.
    pub fn load_default() -> Self {
        let mut sources = Vec::new();
        match paths::global_secrets_file() {
            Ok(path) => sources.push(path),
            Err(e) => tracing::warn!(error = %e, "skipping global secrets file"),
        }
        sources.push(paths::project_secrets_file());
        Self::from_files(sources)
    }

    /// Load `sources` in order, later files overriding earlier ones.
    pub fn from_files(sources: Vec<PathBuf>) -> Self {
        let document = load_sources(&sources);
        Self {
            sources,
            document: RwLock::new(document),
        }
    }

    /// Secrets parsed from an in-memory TOML document.
    ///
    /// A malformed document yields empty secrets.
    pub fn from_toml_str(raw: &str) -> Self {
        let document = raw.parse::<toml::Table>().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring malformed secrets document");
            toml::Table::new()
        });
        Self {
            sources: Vec::new(),
            document: RwLock::new(document),
        }
    }

    pub fn empty() -> Self {
        Self::from_toml_str("")
    }

    /// Re-read the source files, returning whether anything changed.
    ///
    /// In-memory secrets have no sources and never change.
    pub fn reload(&self) -> bool {
        if self.sources.is_empty() {
            return false;
        }
        let fresh = load_sources(&self.sources);
        let mut document = self.document.write();
        if *document == fresh {
            return false;
        }
        *document = fresh;
        tracing::info!("secrets reloaded");
        true
    }

    /// Replace the whole document, e.g. after an external edit.
    pub fn replace(&self, raw: &str) -> bool {
        let Ok(fresh) = raw.parse::<toml::Table>() else {
            tracing::warn!("ignoring malformed secrets document");
            return false;
        };
        let mut document = self.document.write();
        let changed = *document != fresh;
        *document = fresh;
        changed
    }

    /// Top-level value at a dotted path such as `connections.warehouse.type`
    pub fn get(&self, dotted: &str) -> Option<toml::Value> {
        let document = self.document.read();
        let mut parts = dotted.split('.');
        let mut current = document.get(parts.next()?)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current.clone())
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

impl SecretsProvider for TomlSecrets {
    fn connection_section(&self, name: &str) -> SecretsSection {
        let document = self.document.read();
        document
            .get("connections")
            .and_then(toml::Value::as_table)
            .and_then(|connections| connections.get(name))
            .and_then(toml::Value::as_table)
            .cloned()
            .map(SecretsSection::new)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for TomlSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TomlSecrets")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

fn load_sources(sources: &[PathBuf]) -> toml::Table {
    let mut merged = toml::Table::new();
    for path in sources {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read secrets file");
                continue;
            }
        };
        match raw.parse::<toml::Table>() {
            Ok(table) => {
                tracing::debug!(path = %path.display(), "loaded secrets file");
                merge_tables(&mut merged, table);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed secrets file");
            }
        }
    }
    merged
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
