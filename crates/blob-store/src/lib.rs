//! Object store client.
//!
//! A [`BlobStore`] addresses objects by `(container, name)` pairs, where a name may
//! contain `/` separators. Two implementations are provided:
//!
//! - [`HttpBlobStore`]: Azure-Blob-compatible REST API authenticated by a SAS token.
//! - [`FsBlobStore`]: a local directory where containers are sub-directories.

mod error;
mod fs;
mod http;

pub use error::{Error, Result};
pub use fs::FsBlobStore;
pub use http::{HttpBlobStore, HttpBlobStoreConfig};

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Stream of object content chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Content type used when no better guess is available.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Remote object storage operations consumed by the relay actions.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short description used in log lines (never contains credentials).
    fn describe(&self) -> String;

    /// Open a streaming read of an object.
    async fn get(&self, container: &str, name: &str) -> Result<ByteStream>;

    /// Upload a local file as an object.
    ///
    /// When `overwrite` is false and the object already exists the upload fails with
    /// [`Error::AlreadyExists`].
    async fn put_file(&self, container: &str, name: &str, path: &Path, overwrite: bool)
    -> Result<()>;

    /// Delete an object.
    async fn delete(&self, container: &str, name: &str) -> Result<()>;

    /// List object names in a container starting with `prefix`.
    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>>;

    async fn container_exists(&self, container: &str) -> Result<bool>;

    /// Create a container, succeeding if it already exists.
    async fn create_container_if_not_exists(&self, container: &str) -> Result<()>;

    async fn set_content_type(&self, container: &str, name: &str, content_type: &str)
    -> Result<()>;

    async fn set_tags(&self, container: &str, name: &str, tags: &HashMap<String, String>)
    -> Result<()>;
}

/// Validate an object name and return its `/`-separated segments.
///
/// Rejects empty names, empty segments, `.`/`..` segments and backslashes so that a
/// name can always be mapped onto a relative filesystem path.
pub fn name_segments(name: &str) -> Result<Vec<&str>> {
    let invalid = |reason| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.contains('\\') {
        return Err(invalid("backslashes are not allowed"));
    }

    let segments: Vec<&str> = name.split('/').collect();
    for segment in &segments {
        match *segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            _ => {}
        }
    }
    Ok(segments)
}
