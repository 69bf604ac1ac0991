//! Error types for blob store operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for blob store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Blob not found: {container}/{name}")]
    NotFound { container: String, name: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Blob already exists: {container}/{name}")]
    AlreadyExists { container: String, name: String },

    #[error("Invalid blob name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Unexpected status {status} for {operation}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed XML: {0}")]
    Xml(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error while {op} at {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn io_path(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn not_found(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            container: container.into(),
            name: name.into(),
        }
    }

    /// Whether the error means the object or its container does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ContainerNotFound(_))
    }
}
