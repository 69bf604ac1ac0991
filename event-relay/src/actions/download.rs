//! Download the object named by an envelope subject into a local directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use blob_store::{BlobStore, name_segments};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Action, ActionError, ActionKind, BlobStoreConfig};
use crate::envelope::Envelope;
use crate::utils::AtomicFileWriter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDownloadConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Directory the object is written under, keeping its blob path.
    pub local_download_path: PathBuf,
    pub store: BlobStoreConfig,
}

/// Per-destination async locks.
///
/// Two envelopes addressing the same destination are written one after the other
/// instead of racing on the same staging file. Entries are dropped once unused.
#[derive(Clone, Default)]
pub struct PathLocks {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub async fn lock(&self, path: &Path) -> PathLockGuard {
        let mutex = self.locks.entry(path.to_path_buf()).or_default().clone();
        let guard = mutex.lock_owned().await;
        PathLockGuard {
            guard: Some(guard),
            path: path.to_path_buf(),
            locks: self.locks.clone(),
        }
    }

    /// Number of paths currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct PathLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    path: PathBuf,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub struct ObjectDownloadAction {
    name: String,
    local_download_path: PathBuf,
    store: Arc<dyn BlobStore>,
    locks: PathLocks,
}

impl ObjectDownloadAction {
    pub fn new(config: ObjectDownloadConfig, store: Arc<dyn BlobStore>, locks: PathLocks) -> Self {
        Self {
            name: config
                .name
                .unwrap_or_else(|| ActionKind::ObjectDownload.to_string()),
            local_download_path: config.local_download_path,
            store,
            locks,
        }
    }

    fn fail(&self, context: &str, cause: impl std::error::Error + Send + Sync + 'static) -> ActionError {
        ActionError::wrap(ActionKind::ObjectDownload, &self.name, context, cause)
    }

    /// Local path of a blob. Names with `..`, `.` or empty segments are rejected so
    /// the result always stays below the download directory.
    fn destination(&self, blob_name: &str) -> blob_store::Result<PathBuf> {
        let mut path = self.local_download_path.clone();
        for segment in name_segments(blob_name)? {
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl Action for ObjectDownloadAction {
    fn kind(&self) -> ActionKind {
        ActionKind::ObjectDownload
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<(), ActionError> {
        let blob = envelope
            .blob_ref()
            .map_err(|e| self.fail("parsing subject", e))?;
        let destination = self
            .destination(&blob.name)
            .map_err(|e| self.fail("resolving destination", e))?;

        let _lock = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.fail("waiting for destination", crate::Error::Cancelled)),
            guard = self.locks.lock(&destination) => guard,
        };

        debug!(blob = %blob, destination = %destination.display(), "Downloading object");
        let stream = self
            .store
            .get(&blob.container, &blob.name)
            .await
            .map_err(|e| self.fail(&format!("reading {blob}"), e))?;

        let bytes = AtomicFileWriter::write_stream(&destination, stream, cancel)
            .await
            .map_err(|e| self.fail(&format!("writing {}", destination.display()), e))?;

        info!(
            blob = %blob,
            destination = %destination.display(),
            bytes,
            "Downloaded object"
        );
        Ok(())
    }
}
