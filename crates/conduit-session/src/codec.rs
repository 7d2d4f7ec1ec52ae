//! Versioned binary encoding of stored sessions
//!
//! A record is `b"CSES"`, a little-endian `u16` schema version, then the
//! bincode-encoded [`SessionRecord`]. State values are kept as JSON text
//! because bincode cannot encode self-describing values.

use conduit_core::{ConduitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"CSES";
const VERSION: u16 = 1;
const HEADER_LEN: usize = MAGIC.len() + std::mem::size_of::<u16>();

/// Everything persisted about one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub main_script_path: String,
    pub command_line: String,
    pub script_run_count: u64,
    pub user_info: BTreeMap<String, Option<String>>,
    /// User-visible session state, each value as JSON text
    pub user_session_state: BTreeMap<String, String>,
}

impl SessionRecord {
    /// Decode the stored state values
    pub fn state_values(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        self.user_session_state
            .iter()
            .map(|(key, raw)| Ok((key.clone(), serde_json::from_str(raw)?)))
            .collect()
    }

    pub fn set_state_values(&mut self, values: BTreeMap<String, serde_json::Value>) -> Result<()> {
        self.user_session_state = values
            .into_iter()
            .map(|(key, value)| Ok((key, serde_json::to_string(&value)?)))
            .collect::<Result<_>>()?;
        Ok(())
    }
}

pub fn encode(record: &SessionRecord) -> Result<Vec<u8>> {
    let body = bincode::serialize(record)
        .map_err(|e| ConduitError::Encoding(format!("failed to encode session record: {}", e)))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<SessionRecord> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(ConduitError::Encoding("not a stored session record".into()));
    }

    let version = u16::from_le_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
    if version != VERSION {
        return Err(ConduitError::Encoding(format!(
            "unsupported session record version {}",
            version
        )));
    }

    bincode::deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| ConduitError::Encoding(format!("failed to decode session record: {}", e)))
}
