//! Session storage on top of an expiring key/value store

use crate::app_session::{
    AppSession, MessageEnqueuedCallback, SessionData, SessionInfo, SessionState,
    UploadedFileManager,
};
use crate::codec::{self, SessionRecord};
use crate::config::StorageConfig;
use crate::store::{KeyValueStore, RedisStore};
use async_trait::async_trait;
use conduit_core::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Stored sessions expire one hour after their last save
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Out-of-process persistence of application sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Load a stored session, `None` when absent or expired
    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>>;

    async fn save(&self, session_info: &SessionInfo) -> Result<()>;

    /// Remove a stored session; absent sessions are not an error
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Enumerating stored sessions is not supported; always empty
    async fn list(&self) -> Result<Vec<SessionInfo>> {
        Ok(Vec::new())
    }
}

/// [`SessionStorage`] over any [`KeyValueStore`]
///
/// Restoring a session builds a new [`AppSession`], which needs the
/// uploaded-file manager and message callback to be injected first.
pub struct KvSessionStorage<S> {
    store: S,
    installation_id: String,
    uploaded_file_manager: RwLock<Option<Arc<dyn UploadedFileManager>>>,
    message_enqueued_callback: RwLock<Option<MessageEnqueuedCallback>>,
}

pub type RedisSessionStorage = KvSessionStorage<RedisStore>;

impl RedisSessionStorage {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        tracing::debug!(url = %config.redis_url, "using Redis session storage");
        Ok(Self::new(RedisStore::open(&config.redis_url)?, config.installation_id()))
    }
}

impl<S: KeyValueStore> KvSessionStorage<S> {
    pub fn new(store: S, installation_id: impl Into<String>) -> Self {
        Self {
            store,
            installation_id: installation_id.into(),
            uploaded_file_manager: RwLock::new(None),
            message_enqueued_callback: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn set_uploaded_file_manager(&self, manager: Arc<dyn UploadedFileManager>) {
        *self.uploaded_file_manager.write() = Some(manager);
    }

    pub fn set_message_enqueued_callback(&self, callback: MessageEnqueuedCallback) {
        *self.message_enqueued_callback.write() = Some(callback);
    }

    pub fn session_key(&self, session_id: &str) -> String {
        format!("session_info-{}-{}", self.installation_id, session_id)
    }

    fn serialize_session(&self, session_info: &SessionInfo) -> Result<Vec<u8>> {
        let session = &session_info.session;
        let data = session.session_data();
        let mut record = SessionRecord {
            session_id: session.id().to_string(),
            main_script_path: data.main_script_path.to_string_lossy().into_owned(),
            command_line: data.command_line.clone(),
            script_run_count: session_info.script_run_count,
            user_info: session.user_info().clone(),
            user_session_state: BTreeMap::new(),
        };
        record.set_state_values(session.session_state().filtered_state())?;
        codec::encode(&record)
    }

    /// # Panics
    ///
    /// Panics if the uploaded-file manager or the message callback has not
    /// been set.
    fn deserialize_session(&self, bytes: &[u8]) -> Result<SessionInfo> {
        let record = codec::decode(bytes)?;
        let state = record.state_values()?;

        let uploaded_file_manager = self
            .uploaded_file_manager
            .read()
            .clone()
            .expect("uploaded file manager must be set before restoring sessions");
        let message_enqueued_callback = self
            .message_enqueued_callback
            .read()
            .clone()
            .expect("message enqueued callback must be set before restoring sessions");

        let mut session = AppSession::new(
            SessionData::new(record.main_script_path, record.command_line),
            uploaded_file_manager,
            message_enqueued_callback,
            record.user_info,
        );
        session.set_id(record.session_id);
        replay_state(session.session_state(), state);

        Ok(SessionInfo {
            session: Arc::new(session),
            script_run_count: record.script_run_count,
        })
    }
}

/// Write each persisted entry into `state`, leaving other keys alone
fn replay_state(state: &SessionState, snapshot: BTreeMap<String, serde_json::Value>) {
    for (key, value) in snapshot {
        state.set(key, value);
    }
}

#[async_trait]
impl<S: KeyValueStore> SessionStorage for KvSessionStorage<S> {
    #[tracing::instrument(skip(self))]
    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let Some(bytes) = self.store.get(&self.session_key(session_id)).await? else {
            tracing::debug!("no stored session");
            return Ok(None);
        };
        self.deserialize_session(&bytes).map(Some)
    }

    #[tracing::instrument(skip(self, session_info), fields(session_id = %session_info.session.id()))]
    async fn save(&self, session_info: &SessionInfo) -> Result<()> {
        let bytes = self.serialize_session(session_info)?;
        self.store
            .set_ex(&self.session_key(session_info.session.id()), bytes, SESSION_TTL)
            .await?;
        tracing::debug!("session saved");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, session_id: &str) -> Result<()> {
        self.store.delete(&self.session_key(session_id)).await
    }
}
