//! Actions run by an action chain.
//!
//! An action is configured by one [`ActionConfig`] entry and resolved once into an
//! `Arc<dyn Action>`. Every action must be cancel-safe: a cancelled or failed action
//! leaves no partial output behind.

mod download;
mod process;
mod publish;
mod upload;

pub use download::{ObjectDownloadAction, ObjectDownloadConfig, PathLockGuard, PathLocks};
pub use process::{ExternalProcessAction, ExternalProcessConfig, ENVELOPE_ENV, CORRELATION_ID_ENV};
pub use publish::{NotificationPublishAction, NotificationPublishConfig};
pub use upload::{ObjectUploadAction, ObjectUploadConfig, blob_name_for};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use blob_store::{BlobStore, FsBlobStore, HttpBlobStore, HttpBlobStoreConfig};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use crate::Result;
use crate::config::Secret;
use crate::envelope::Envelope;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Kind of action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    ObjectDownload,
    ObjectUpload,
    NotificationPublish,
    ExternalProcess,
}

/// Failure of a single action.
#[derive(Debug, thiserror::Error)]
#[error("{kind} action '{action}' failed: {message}")]
pub struct ActionError {
    pub kind: ActionKind,
    pub action: String,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl ActionError {
    pub fn new(kind: ActionKind, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a cause. The cause is kept as the source and repeated in the message.
    pub fn wrap<E>(kind: ActionKind, action: impl Into<String>, context: &str, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            action: action.into(),
            message: format!("{context}: {cause}"),
            source: Some(Box::new(cause)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.source.as_deref().and_then(|e| e.downcast_ref::<crate::Error>()),
            Some(crate::Error::Cancelled)
        )
    }
}

/// A single step of an action chain.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Name used in logs, unique within a chain by convention.
    fn name(&self) -> &str;

    /// Handle one envelope.
    ///
    /// # Cancel Safety
    ///
    /// Implementations observe `cancel` at their await points and must not leave
    /// partial files behind when it fires.
    async fn process(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ActionError>;
}

/// Run one action with start, end and error log events.
pub async fn run_action(
    action: &dyn Action,
    envelope: &Envelope,
    cancel: &CancellationToken,
) -> std::result::Result<(), ActionError> {
    let started = Instant::now();
    info!(
        event = "action_started",
        action = action.name(),
        kind = %action.kind(),
        "Action started"
    );

    match action.process(envelope, cancel).await {
        Ok(()) => {
            info!(
                event = "action_completed",
                action = action.name(),
                kind = %action.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Action completed"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                event = "action_failed",
                action = action.name(),
                kind = %action.kind(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "Action failed"
            );
            Err(e)
        }
    }
}

fn default_blob_timeout() -> u64 {
    60
}

/// Blob store connection of a download or upload action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobStoreConfig {
    /// Local directory, containers are sub-directories.
    Local { root: PathBuf },
    /// Azure-Blob-compatible REST endpoint.
    Http {
        account_url: Url,
        sas_token: Secret,
        #[serde(default = "default_blob_timeout")]
        timeout_secs: u64,
    },
}

impl BlobStoreConfig {
    /// Identity of the store, equal to the built store's `describe()`.
    pub fn key(&self) -> String {
        match self {
            Self::Local { root } => format!("local:{}", root.display()),
            Self::Http { account_url, .. } => format!("http:{account_url}"),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn BlobStore>> {
        Ok(match self {
            Self::Local { root } => Arc::new(FsBlobStore::new(root)),
            Self::Http {
                account_url,
                sas_token,
                timeout_secs,
            } => Arc::new(HttpBlobStore::new(HttpBlobStoreConfig {
                timeout_secs: *timeout_secs,
                ..HttpBlobStoreConfig::new(account_url.clone(), sas_token.expose())
            })?),
        })
    }
}

/// Configuration of one action, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    ObjectDownload(ObjectDownloadConfig),
    ObjectUpload(ObjectUploadConfig),
    NotificationPublish(NotificationPublishConfig),
    ExternalProcess(ExternalProcessConfig),
}

impl ActionConfig {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::ObjectDownload(_) => ActionKind::ObjectDownload,
            Self::ObjectUpload(_) => ActionKind::ObjectUpload,
            Self::NotificationPublish(_) => ActionKind::NotificationPublish,
            Self::ExternalProcess(_) => ActionKind::ExternalProcess,
        }
    }
}

/// Resources shared by the actions of all chains.
#[derive(Clone, Default)]
pub struct ActionDeps {
    stores: Arc<DashMap<String, Arc<dyn BlobStore>>>,
    path_locks: PathLocks,
}

impl ActionDeps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store instance, reused by every action whose store config has the
    /// same key.
    pub fn insert_store(&self, store: Arc<dyn BlobStore>) {
        self.stores.insert(store.describe(), store);
    }

    /// Store client for `config`, built on first use and shared afterwards.
    pub fn store(&self, config: &BlobStoreConfig) -> Result<Arc<dyn BlobStore>> {
        let key = config.key();
        if let Some(store) = self.stores.get(&key) {
            return Ok(store.clone());
        }
        let store = config.build()?;
        Ok(self.stores.entry(key).or_insert(store).clone())
    }

    pub fn path_locks(&self) -> &PathLocks {
        &self.path_locks
    }
}

/// Build an action from its configuration.
pub fn build_action(config: ActionConfig, deps: &ActionDeps) -> Result<Arc<dyn Action>> {
    Ok(match config {
        ActionConfig::ObjectDownload(c) => {
            let store = deps.store(&c.store)?;
            Arc::new(ObjectDownloadAction::new(c, store, deps.path_locks.clone()))
        }
        ActionConfig::ObjectUpload(c) => {
            let store = deps.store(&c.store)?;
            Arc::new(ObjectUploadAction::new(c, store))
        }
        ActionConfig::NotificationPublish(c) => Arc::new(NotificationPublishAction::from_config(c)?),
        ActionConfig::ExternalProcess(c) => Arc::new(ExternalProcessAction::new(c)),
    })
}
