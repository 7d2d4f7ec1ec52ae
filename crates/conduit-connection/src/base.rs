//! Connection lifecycle shared by every adapter
//!
//! A [`Connector`] knows how to build one kind of client handle from a
//! secrets section and caller options. [`BaseConnection`] owns the handle
//! slot: it connects eagerly on construction, hands out clones of the live
//! handle, and reconnects with the original options after a [`reset`].
//!
//! [`reset`]: BaseConnection::reset

use async_trait::async_trait;
use conduit_core::{Result, SecretsProvider, SecretsSection};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Caller-supplied keyword options for `connect`
pub type ConnectOptions = BTreeMap<String, serde_json::Value>;

/// Secrets section name that defers to the adapter's own default
pub const DEFAULT_NAME: &str = "default";

/// Builds client handles for one adapter kind
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Live client object handed to callers
    type Handle: Clone + Send + Sync + 'static;

    /// Short adapter kind, e.g. `sql`
    const KIND: &'static str;

    /// Secrets section used when the connection is named `default`.
    ///
    /// Must not be empty.
    const DEFAULT_CONNECTION_NAME: &'static str;

    /// Create a fresh handle. Every call produces a new one.
    async fn connect(&self, secrets: &SecretsSection, options: &ConnectOptions) -> Result<Self::Handle>;

    /// Adapter-specific lines for [`BaseConnection::describe`]
    fn details(&self, _handle: &Self::Handle) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Generic lifecycle wrapper around a [`Connector`]'s handle
pub struct BaseConnection<C: Connector> {
    name: String,
    connector: C,
    secrets: Arc<dyn SecretsProvider>,
    options: ConnectOptions,
    handle: RwLock<Option<C::Handle>>,
    /// Serializes reconnection so at most one handle is created at a time
    connect_lock: tokio::sync::Mutex<()>,
    seen_secrets: Mutex<SecretsSection>,
    reset_count: AtomicU64,
}

impl<C: Connector> BaseConnection<C> {
    /// Connect once and keep the handle. Fails if that first connect fails.
    #[tracing::instrument(skip(connector, secrets, options), fields(kind = C::KIND))]
    pub async fn new(
        name: &str,
        connector: C,
        secrets: Arc<dyn SecretsProvider>,
        options: ConnectOptions,
    ) -> Result<Self> {
        let section_name = Self::section_name_for(name);
        let section = secrets.connection_section(section_name);
        let handle = connector.connect(&section, &options).await.inspect_err(|e| {
            tracing::error!(error = %e, "failed to establish connection");
        })?;
        tracing::info!(section = %section_name, "connection established");

        Ok(Self {
            name: name.to_string(),
            connector,
            secrets,
            options,
            handle: RwLock::new(Some(handle)),
            connect_lock: tokio::sync::Mutex::new(()),
            seen_secrets: Mutex::new(section),
            reset_count: AtomicU64::new(0),
        })
    }

    /// Secrets section consulted for the `default` connection name
    pub fn default_connection_name() -> &'static str {
        assert!(
            !C::DEFAULT_CONNECTION_NAME.is_empty(),
            "{} connector does not declare a default connection name",
            C::KIND
        );
        C::DEFAULT_CONNECTION_NAME
    }

    fn section_name_for(name: &str) -> &str {
        if name == DEFAULT_NAME {
            Self::default_connection_name()
        } else {
            name
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the `[connections.<name>]` table this connection reads
    pub fn section_name(&self) -> &str {
        Self::section_name_for(&self.name)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// This connection's secrets, empty when none are configured
    pub fn get_secrets(&self) -> SecretsSection {
        self.secrets.connection_section(self.section_name())
    }

    /// The live handle, reconnecting with the original options if it was reset
    pub async fn instance(&self) -> Result<C::Handle> {
        let current = self.handle.read().clone();
        if let Some(handle) = current {
            return Ok(handle);
        }

        let _guard = self.connect_lock.lock().await;
        let current = self.handle.read().clone();
        if let Some(handle) = current {
            return Ok(handle);
        }

        tracing::debug!(connection = %self.name, kind = C::KIND, "reconnecting");
        let section = self.get_secrets();
        let handle = self.connector.connect(&section, &self.options).await?;
        *self.seen_secrets.lock() = section;
        *self.handle.write() = Some(handle.clone());
        Ok(handle)
    }

    /// Drop the current handle. The next [`instance`](Self::instance) reconnects.
    pub fn reset(&self) {
        if self.handle.write().take().is_some() {
            tracing::debug!(connection = %self.name, kind = C::KIND, "connection reset");
        }
        self.reset_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of times [`reset`](Self::reset) was called
    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Reset the handle if this connection's secrets changed since last seen.
    ///
    /// Returns whether a reset happened.
    pub fn on_secrets_changed(&self) -> bool {
        let current = self.get_secrets();
        let mut seen = self.seen_secrets.lock();
        if *seen == current {
            return false;
        }
        *seen = current;
        drop(seen);

        tracing::info!(connection = %self.name, "secrets changed, resetting connection");
        self.reset();
        true
    }

    /// Markdown summary of this connection
    pub async fn describe(&self) -> Result<String> {
        let handle = self.instance().await?;
        let mut lines = vec![
            "---".to_string(),
            format!("**conduit connection `{}` built from `{}`**", self.name, C::KIND),
        ];
        if !self.get_secrets().is_empty() {
            lines.push(format!("- Configured from `[connections.{}]`", self.section_name()));
        }
        for (label, value) in self.connector.details(&handle) {
            lines.push(format!("- {}: `{}`", label, value));
        }
        lines.push("---".to_string());
        Ok(lines.join("\n"))
    }
}

impl<C: Connector> std::fmt::Debug for BaseConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseConnection")
            .field("name", &self.name)
            .field("kind", &C::KIND)
            .field("connected", &self.is_connected())
            .finish()
    }
}
