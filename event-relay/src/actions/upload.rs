//! Upload the local file described by a filesystem envelope.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use blob_store::{BlobStore, DEFAULT_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Action, ActionError, ActionKind, BlobStoreConfig};
use crate::envelope::Envelope;

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectUploadConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Destination container, lower-cased before use.
    pub container_name: String,
    /// Prefix prepended to the file's path below the watch root.
    #[serde(default)]
    pub file_path: String,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
    /// Tags applied to every uploaded object.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub store: BlobStoreConfig,
}

/// Blob name for a file: `file_path` without trailing `/`, followed by the relative
/// path, with the leading `/` removed.
pub fn blob_name_for(file_path: &str, relative_file_path: &str) -> String {
    format!("{}{}", file_path.trim_end_matches('/'), relative_file_path)
        .trim_start_matches('/')
        .to_string()
}

pub struct ObjectUploadAction {
    name: String,
    container: String,
    file_path: String,
    overwrite: bool,
    tags: HashMap<String, String>,
    store: Arc<dyn BlobStore>,
}

impl ObjectUploadAction {
    pub fn new(config: ObjectUploadConfig, store: Arc<dyn BlobStore>) -> Self {
        Self {
            name: config
                .name
                .unwrap_or_else(|| ActionKind::ObjectUpload.to_string()),
            container: config.container_name.to_lowercase(),
            file_path: config.file_path,
            overwrite: config.overwrite,
            tags: config.tags,
            store,
        }
    }

    fn fail(&self, context: &str, cause: impl std::error::Error + Send + Sync + 'static) -> ActionError {
        ActionError::wrap(ActionKind::ObjectUpload, &self.name, context, cause)
    }

    /// Content type and tags. Failures only produce warnings.
    async fn apply_properties(&self, blob_name: &str) {
        let content_type = mime_guess::from_path(blob_name)
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        if let Err(e) = self
            .store
            .set_content_type(&self.container, blob_name, content_type)
            .await
        {
            warn!(container = %self.container, blob = blob_name, error = %e, "Failed to set content type");
        }

        if !self.tags.is_empty()
            && let Err(e) = self.store.set_tags(&self.container, blob_name, &self.tags).await
        {
            warn!(container = %self.container, blob = blob_name, error = %e, "Failed to set tags");
        }
    }
}

#[async_trait]
impl Action for ObjectUploadAction {
    fn kind(&self) -> ActionKind {
        ActionKind::ObjectUpload
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<(), ActionError> {
        let metadata = envelope
            .file_metadata()
            .map_err(|e| self.fail("reading file metadata", e))?;
        let blob_name = blob_name_for(&self.file_path, &metadata.relative_file_path);
        let source = Path::new(&metadata.full_file_path);

        let upload = async {
            self.store
                .create_container_if_not_exists(&self.container)
                .await?;
            self.store
                .put_file(&self.container, &blob_name, source, self.overwrite)
                .await?;
            Ok::<_, blob_store::Error>(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(self.fail(&format!("uploading {}", source.display()), crate::Error::Cancelled));
            }
            result = upload => {
                result.map_err(|e| self.fail(&format!("uploading {}", source.display()), e))?;
            }
        }

        self.apply_properties(&blob_name).await;

        info!(
            source = %source.display(),
            container = %self.container,
            blob = %blob_name,
            "Uploaded object"
        );
        Ok(())
    }
}
