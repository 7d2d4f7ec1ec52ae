//! Conduit Session - out-of-process application session storage
//!
//! Sessions are stored under `session_info-{installation_id}-{session_id}`
//! with a one hour expiry. [`RedisSessionStorage`] is the production
//! backend; [`MemoryStore`] serves tests and single-process setups.

mod app_session;
mod codec;
mod config;
mod installation;
mod storage;
mod store;

pub use app_session::{
    AppSession, INTERNAL_KEY_PREFIX, MessageEnqueuedCallback, SessionData, SessionInfo,
    SessionState, UploadedFileManager, UserInfo,
};
pub use codec::{SessionRecord, decode, encode};
pub use config::{DEFAULT_REDIS_URL, StorageConfig};
pub use installation::installation_id;
pub use storage::{KvSessionStorage, RedisSessionStorage, SESSION_TTL, SessionStorage};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
