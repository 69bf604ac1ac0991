//! Staged write then rename.
//!
//! Content is written to `{final}.tmp` and only renamed onto the final path once
//! everything has been written and synced, so the final name never refers to a
//! partially written file. An uncommitted writer removes its temp file on abort or
//! drop, which keeps it cancel-safe.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::fs::{ensure_parent_dir, remove_file_if_exists};
use crate::{Error, Result};

/// Suffix of the staging file.
pub const TEMP_EXTENSION: &str = ".tmp";

/// Staging path used for `final_path`.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.as_os_str().to_owned();
    name.push(TEMP_EXTENSION);
    PathBuf::from(name)
}

pub struct AtomicFileWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    finished: bool,
}

impl AtomicFileWriter {
    /// Create the parent directory and open the staging file, truncating any
    /// leftover from an earlier crash.
    pub async fn create(final_path: impl Into<PathBuf>) -> Result<Self> {
        let final_path = final_path.into();
        ensure_parent_dir(&final_path).await?;

        let temp_path = temp_path_for(&final_path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| Error::io_path("opening staging file", &temp_path, e))?;

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            bytes_written: 0,
            finished: false,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Other("staging file already closed".to_string()))?;
        file.write_all(buf)
            .await
            .map_err(|e| Error::io_path("writing staging file", &self.temp_path, e))?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Flush, sync and rename the staging file onto the final path, replacing any
    /// previous version.
    pub async fn commit(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| Error::io_path("flushing staging file", &self.temp_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| Error::io_path("syncing staging file", &self.temp_path, e))?;
        }

        tokio::fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| Error::io_path("renaming staging file", &self.final_path, e))?;
        self.finished = true;
        Ok(self.final_path.clone())
    }

    /// Discard the staging file.
    pub async fn abort(mut self) -> Result<()> {
        self.file.take();
        self.finished = true;
        remove_file_if_exists(&self.temp_path).await?;
        Ok(())
    }

    /// Drive a byte stream into `final_path` atomically.
    ///
    /// On a stream error or cancellation the staging file is removed and the final
    /// path is left as it was. Returns the number of bytes written.
    pub async fn write_stream<S, E>(
        final_path: &Path,
        mut stream: S,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Into<Error>,
    {
        let mut writer = Self::create(final_path).await?;

        let copied: Result<()> = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => writer.write_all(&chunk).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
        .await;

        match copied {
            Ok(()) => {
                let written = writer.bytes_written();
                writer.commit().await?;
                Ok(written)
            }
            Err(e) => {
                let temp_path = writer.temp_path().to_path_buf();
                if let Err(cleanup) = writer.abort().await {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove staging file");
                }
                Err(e)
            }
        }
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;

    fn chunks(parts: &[&'static [u8]]) -> Vec<std::result::Result<Bytes, Error>> {
        parts.iter().map(|p| Ok(Bytes::from_static(p))).collect()
    }

    #[test]
    fn test_temp_path_for() {
        assert_eq!(
            temp_path_for(Path::new("/data/img1.png")),
            PathBuf::from("/data/img1.png.tmp")
        );
    }

    #[tokio::test]
    async fn test_commit_creates_final_file() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("nested/out.bin");

        let mut writer = AtomicFileWriter::create(&final_path).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        assert!(!final_path.exists());
        assert!(temp_path_for(&final_path).exists());

        writer.commit().await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello world");
        assert!(!temp_path_for(&final_path).exists());
    }

    #[tokio::test]
    async fn test_drop_removes_staging_file() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("out.bin");

        {
            let mut writer = AtomicFileWriter::create(&final_path).await.unwrap();
            writer.write_all(b"partial").await.unwrap();
        }

        assert!(!final_path.exists());
        assert!(!temp_path_for(&final_path).exists());
    }

    #[tokio::test]
    async fn test_write_stream_replaces_previous_version() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("out.bin");
        tokio::fs::write(&final_path, b"old").await.unwrap();

        let written = AtomicFileWriter::write_stream(
            &final_path,
            stream::iter(chunks(&[b"new ", b"content"])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(written, 11);
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"new content");
    }

    #[tokio::test]
    async fn test_write_stream_error_keeps_previous_version() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("out.bin");
        tokio::fs::write(&final_path, b"old").await.unwrap();

        let mut items = chunks(&[b"partial"]);
        items.push(Err(Error::Other("connection reset".to_string())));

        let err = AtomicFileWriter::write_stream(
            &final_path,
            stream::iter(items),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"old");
        assert!(!temp_path_for(&final_path).exists());
    }

    #[tokio::test]
    async fn test_write_stream_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let final_path = temp_dir.path().join("out.bin");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = AtomicFileWriter::write_stream(
            &final_path,
            stream::pending::<std::result::Result<Bytes, Error>>(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(!final_path.exists());
        assert!(!temp_path_for(&final_path).exists());
    }
}
