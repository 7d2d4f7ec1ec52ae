//! In-memory application session model

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Keys with this prefix are framework-internal and never persisted
pub const INTERNAL_KEY_PREFIX: &str = "$$";

/// Invoked whenever a session queues an outgoing message
pub type MessageEnqueuedCallback = Arc<dyn Fn() + Send + Sync>;

/// User identity attached to a session (e.g. `email`)
pub type UserInfo = BTreeMap<String, Option<String>>;

/// Owns the files uploaded while a session is alive
pub trait UploadedFileManager: Send + Sync {
    /// Release every file uploaded by `session_id`
    fn remove_session_files(&self, session_id: &str);
}

/// Script entry point and invocation of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub main_script_path: PathBuf,
    pub command_line: String,
}

impl SessionData {
    pub fn new(main_script_path: impl Into<PathBuf>, command_line: impl Into<String>) -> Self {
        Self {
            main_script_path: main_script_path.into(),
            command_line: command_line.into(),
        }
    }
}

/// Session-scoped key/value state
#[derive(Debug, Default)]
pub struct SessionState {
    values: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.values.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.values.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Every user-visible entry, skipping internal keys
    pub fn filtered_state(&self) -> BTreeMap<String, serde_json::Value> {
        self.values
            .read()
            .iter()
            .filter(|(key, _)| !key.starts_with(INTERNAL_KEY_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// A live application session
pub struct AppSession {
    id: String,
    session_data: SessionData,
    user_info: UserInfo,
    session_state: SessionState,
    uploaded_file_manager: Arc<dyn UploadedFileManager>,
    message_enqueued_callback: MessageEnqueuedCallback,
}

impl AppSession {
    pub fn new(
        session_data: SessionData,
        uploaded_file_manager: Arc<dyn UploadedFileManager>,
        message_enqueued_callback: MessageEnqueuedCallback,
        user_info: UserInfo,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(session_id = %id, script = %session_data.main_script_path.display(), "app session created");
        Self {
            id,
            session_data,
            user_info,
            session_state: SessionState::new(),
            uploaded_file_manager,
            message_enqueued_callback,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adopt a persisted identifier when restoring a stored session
    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub fn session_data(&self) -> &SessionData {
        &self.session_data
    }

    pub fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    pub fn session_state(&self) -> &SessionState {
        &self.session_state
    }

    /// Signal that a message was queued for the client
    pub fn notify_message_enqueued(&self) {
        (self.message_enqueued_callback)();
    }

    /// Release resources held on behalf of this session
    pub fn shutdown(&self) {
        tracing::debug!(session_id = %self.id, "app session shut down");
        self.uploaded_file_manager.remove_session_files(&self.id);
    }
}

impl std::fmt::Debug for AppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSession")
            .field("id", &self.id)
            .field("session_data", &self.session_data)
            .field("user_info", &self.user_info)
            .field("session_state", &self.session_state)
            .finish_non_exhaustive()
    }
}

/// A session as tracked by the session manager
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session: Arc<AppSession>,
    pub script_run_count: u64,
}

impl SessionInfo {
    pub fn new(session: Arc<AppSession>) -> Self {
        Self {
            session,
            script_run_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingFileManager {
        removed: parking_lot::Mutex<Vec<String>>,
    }

    impl UploadedFileManager for RecordingFileManager {
        fn remove_session_files(&self, session_id: &str) {
            self.removed.lock().push(session_id.to_string());
        }
    }

    #[test]
    fn test_filtered_state_skips_internal_keys() {
        let state = SessionState::new();
        state.set("count", serde_json::json!(3));
        state.set("$$GENERATED_WIDGET_ID-1", serde_json::json!(true));

        assert_eq!(state.len(), 2);
        assert_eq!(
            state.filtered_state(),
            BTreeMap::from([("count".to_string(), serde_json::json!(3))])
        );
    }

    #[test]
    fn test_session_collaborators_are_used() {
        let files = Arc::new(RecordingFileManager::default());
        let enqueued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&enqueued);
        let session = AppSession::new(
            SessionData::new("app.py", "conduit run app.py"),
            files.clone(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            UserInfo::new(),
        );

        session.notify_message_enqueued();
        session.shutdown();

        assert_eq!(enqueued.load(Ordering::SeqCst), 1);
        assert_eq!(*files.removed.lock(), vec![session.id().to_string()]);
    }

    #[test]
    fn test_new_sessions_get_distinct_ids() {
        let files: Arc<dyn UploadedFileManager> = Arc::new(RecordingFileManager::default());
        let callback: MessageEnqueuedCallback = Arc::new(|| {});
        let a = AppSession::new(SessionData::new("a.py", ""), files.clone(), callback.clone(), UserInfo::new());
        let b = AppSession::new(SessionData::new("a.py", ""), files, callback, UserInfo::new());
        assert_ne!(a.id(), b.id());
    }
}
