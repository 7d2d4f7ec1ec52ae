//! Legacy `~/.snowsql/config` credentials
//!
//! The file is INI: `[section]` headers, `key = value` or `key: value`
//! entries, full-line comments starting with `#` or `;`, and inline comments
//! starting with ` #`. Keys are case-insensitive. Only the `connections`
//! section is used, with its keys normalized to session config names.

use conduit_core::Result;
use std::collections::BTreeMap;
use std::path::Path;

const CONNECTIONS_SECTION: &str = "connections";

type IniSections = BTreeMap<String, BTreeMap<String, String>>;

/// Normalized `connections` entries from the legacy config at `path`.
///
/// A missing file or a file without a `connections` section yields an
/// empty map.
pub fn load_snowsql_config(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no legacy warehouse config");
            return Ok(BTreeMap::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut sections = parse_ini(&raw);
    let Some(connections) = sections.remove(CONNECTIONS_SECTION) else {
        tracing::debug!(path = %path.display(), "legacy warehouse config has no connections section");
        return Ok(BTreeMap::new());
    };

    tracing::debug!(path = %path.display(), keys = connections.len(), "loaded legacy warehouse config");
    Ok(normalize_connection_params(connections))
}

/// `accountname` → `account`, `username` → `user`, `dbname` → `database`,
/// with surrounding double quotes stripped from values.
pub fn normalize_connection_params(params: BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut normalized: BTreeMap<String, String> = params
        .into_iter()
        .map(|(key, value)| (key.replace("name", ""), value.trim_matches('"').to_string()))
        .collect();

    if let Some(db) = normalized.remove("db") {
        normalized.insert("database".to_string(), db);
    }
    normalized
}

fn parse_ini(raw: &str) -> IniSections {
    let mut sections = IniSections::new();
    let mut current_section: Option<String> = None;
    let mut current_key: Option<String> = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        // Indented lines continue the previous value.
        if line.starts_with(char::is_whitespace)
            && let (Some(section), Some(key)) = (&current_section, &current_key)
            && let Some(value) = sections.get_mut(section).and_then(|s| s.get_mut(key))
        {
            let continuation = strip_inline_comment(trimmed);
            if !continuation.is_empty() {
                value.push('\n');
                value.push_str(continuation);
            }
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current_section = Some(name);
            current_key = None;
            continue;
        }

        let Some(section) = &current_section else {
            tracing::warn!(line = %trimmed, "ignoring entry outside of any section");
            continue;
        };

        let Some(split_at) = trimmed.find(['=', ':']) else {
            tracing::warn!(line = %trimmed, "ignoring malformed config line");
            continue;
        };

        let key = trimmed[..split_at].trim().to_lowercase();
        let value = strip_inline_comment(trimmed[split_at + 1..].trim()).to_string();
        sections
            .entry(section.clone())
            .or_default()
            .insert(key.clone(), value);
        current_key = Some(key);
    }

    sections
}

/// Inline comments must be preceded by whitespace.
fn strip_inline_comment(value: &str) -> &str {
    let mut previous_is_space = false;
    for (idx, ch) in value.char_indices() {
        if ch == '#' && previous_is_space {
            return value[..idx].trim_end();
        }
        previous_is_space = ch.is_whitespace();
    }
    value
}
