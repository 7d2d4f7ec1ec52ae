//! Stable per-installation identifier used to namespace stored sessions

use conduit_core::paths;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];
const PERSISTED_ID_FILE: &str = "installation_id";

static INSTALLATION_ID: OnceLock<String> = OnceLock::new();

/// The installation identifier, computed once per process.
///
/// UUIDv5 of the machine id when one is readable, else a UUID persisted
/// under the data directory, else a random UUID for this process.
pub fn installation_id() -> &'static str {
    INSTALLATION_ID.get_or_init(|| {
        let machine_paths: Vec<PathBuf> = MACHINE_ID_PATHS.iter().map(PathBuf::from).collect();
        let persisted = paths::data_dir().ok().map(|dir| dir.join(PERSISTED_ID_FILE));
        let id = resolve_installation_id(&machine_paths, persisted.as_deref());
        tracing::debug!(installation_id = %id, "installation id resolved");
        id
    })
}

pub(crate) fn resolve_installation_id(machine_id_paths: &[PathBuf], persisted: Option<&Path>) -> String {
    if let Some(machine_id) = machine_id_paths.iter().find_map(|path| read_trimmed(path)) {
        return Uuid::new_v5(&Uuid::NAMESPACE_DNS, machine_id.as_bytes()).to_string();
    }

    if let Some(path) = persisted {
        if let Some(id) = read_trimmed(path).filter(|id| Uuid::parse_str(id).is_ok()) {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        match persist(path, &id) {
            Ok(()) => return id,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not persist installation id"),
        }
    }

    Uuid::new_v4().to_string()
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn persist(path: &Path, id: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, id)
}
