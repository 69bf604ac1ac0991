//! Local directory backed object store.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{BlobStore, ByteStream, Error, Result, name_segments};

#[derive(Debug, Clone, Default)]
struct ObjectProperties {
    content_type: Option<String>,
    tags: HashMap<String, String>,
}

/// Object store rooted at a local directory.
///
/// Containers are first-level sub-directories and object names map onto relative
/// paths below them. Content types and tags are kept in memory only.
pub struct FsBlobStore {
    root: PathBuf,
    properties: RwLock<HashMap<(String, String), ObjectProperties>>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            properties: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_path(&self, container: &str) -> Result<PathBuf> {
        let segments = name_segments(container)?;
        if segments.len() != 1 {
            return Err(Error::InvalidName {
                name: container.to_string(),
                reason: "container names cannot contain '/'",
            });
        }
        Ok(self.root.join(container))
    }

    /// Filesystem path of an object.
    pub fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        let mut path = self.container_path(container)?;
        for segment in name_segments(name)? {
            path.push(segment);
        }
        Ok(path)
    }

    /// Content type recorded for an object, if any.
    pub fn content_type(&self, container: &str, name: &str) -> Option<String> {
        self.properties
            .read()
            .get(&(container.to_string(), name.to_string()))
            .and_then(|p| p.content_type.clone())
    }

    /// Tags recorded for an object.
    pub fn tags(&self, container: &str, name: &str) -> HashMap<String, String> {
        self.properties
            .read()
            .get(&(container.to_string(), name.to_string()))
            .map(|p| p.tags.clone())
            .unwrap_or_default()
    }

    async fn ensure_container(&self, container: &str) -> Result<PathBuf> {
        let path = self.container_path(container)?;
        if !fs::try_exists(&path)
            .await
            .map_err(|e| Error::io_path("checking container", &path, e))?
        {
            return Err(Error::ContainerNotFound(container.to_string()));
        }
        Ok(path)
    }

    async fn ensure_object(&self, container: &str, name: &str) -> Result<PathBuf> {
        self.ensure_container(container).await?;
        let path = self.object_path(container, name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(Error::not_found(container, name)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(container, name)),
            Err(e) => Err(Error::io_path("reading object metadata", &path, e)),
        }
    }

    fn update_properties(&self, container: &str, name: &str, f: impl FnOnce(&mut ObjectProperties)) {
        let mut properties = self.properties.write();
        let entry = properties
            .entry((container.to_string(), name.to_string()))
            .or_default();
        f(entry);
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn get(&self, container: &str, name: &str) -> Result<ByteStream> {
        let path = self.ensure_object(container, name).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Error::io_path("opening object", &path, e))?;

        Ok(ReaderStream::new(file).map(|chunk| chunk.map_err(Error::Io)).boxed())
    }

    async fn put_file(
        &self,
        container: &str,
        name: &str,
        path: &Path,
        overwrite: bool,
    ) -> Result<()> {
        self.ensure_container(container).await?;
        let dest = self.object_path(container, name)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io_path("creating object directory", parent, e))?;
        }

        if overwrite {
            fs::copy(path, &dest)
                .await
                .map_err(|e| Error::io_path("copying object", path, e))?;
        } else {
            let mut target = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&dest)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(Error::AlreadyExists {
                        container: container.to_string(),
                        name: name.to_string(),
                    });
                }
                Err(e) => return Err(Error::io_path("creating object", &dest, e)),
            };
            let mut source = fs::File::open(path)
                .await
                .map_err(|e| Error::io_path("opening upload source", path, e))?;
            tokio::io::copy(&mut source, &mut target)
                .await
                .map_err(|e| Error::io_path("copying object", &dest, e))?;
        }

        debug!(container, name, "Stored object");
        Ok(())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        let path = self.ensure_object(container, name).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Error::io_path("deleting object", &path, e))?;
        self.properties
            .write()
            .remove(&(container.to_string(), name.to_string()));
        Ok(())
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let root = self.ensure_container(container).await?;
        let mut names = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Error::io_path("listing container", &dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::io_path("listing container", &dir, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::io_path("listing container", &path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&root) {
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if prefix.is_none_or(|p| name.starts_with(p)) {
                        names.push(name);
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        let path = self.container_path(container)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| Error::io_path("checking container", &path, e))
    }

    async fn create_container_if_not_exists(&self, container: &str) -> Result<()> {
        let path = self.container_path(container)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::io_path("creating container", &path, e))
    }

    async fn set_content_type(&self, container: &str, name: &str, content_type: &str) -> Result<()> {
        self.ensure_object(container, name).await?;
        self.update_properties(container, name, |p| {
            p.content_type = Some(content_type.to_string())
        });
        Ok(())
    }

    async fn set_tags(
        &self,
        container: &str,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        self.ensure_object(container, name).await?;
        self.update_properties(container, name, |p| p.tags = tags.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn read_all(store: &FsBlobStore, container: &str, name: &str) -> Vec<u8> {
        let chunks: Vec<bytes::Bytes> = store
            .get(container, name)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().join("store"));
        let source = temp_dir.path().join("source.bin");
        fs::write(&source, b"payload").await.unwrap();

        store.create_container_if_not_exists("raw").await.unwrap();
        store.put_file("raw", "dir/a.bin", &source, true).await.unwrap();

        assert_eq!(read_all(&store, "raw", "dir/a.bin").await, b"payload");
        assert_eq!(store.list("raw", None).await.unwrap(), vec!["dir/a.bin"]);
        assert_eq!(store.list("raw", Some("other")).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_put_requires_container() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path());
        let source = temp_dir.path().join("source.bin");
        fs::write(&source, b"x").await.unwrap();

        let err = store.put_file("missing", "a", &source, true).await.unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn test_put_without_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().join("store"));
        let source = temp_dir.path().join("source.bin");
        fs::write(&source, b"first").await.unwrap();

        store.create_container_if_not_exists("c").await.unwrap();
        store.put_file("c", "a", &source, false).await.unwrap();

        fs::write(&source, b"second").await.unwrap();
        let err = store.put_file("c", "a", &source, false).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(read_all(&store, "c", "a").await, b"first");

        store.put_file("c", "a", &source, true).await.unwrap();
        assert_eq!(read_all(&store, "c", "a").await, b"second");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path());
        store.create_container_if_not_exists("c").await.unwrap();

        let err = store.get("c", "nope").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_properties() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().join("store"));
        let source = temp_dir.path().join("a.png");
        fs::write(&source, b"png").await.unwrap();
        store.create_container_if_not_exists("c").await.unwrap();
        store.put_file("c", "a.png", &source, true).await.unwrap();

        store.set_content_type("c", "a.png", "image/png").await.unwrap();
        let tags = HashMap::from([("origin".to_string(), "relay".to_string())]);
        store.set_tags("c", "a.png", &tags).await.unwrap();

        assert_eq!(store.content_type("c", "a.png").as_deref(), Some("image/png"));
        assert_eq!(store.tags("c", "a.png"), tags);

        store.delete("c", "a.png").await.unwrap();
        assert!(store.content_type("c", "a.png").is_none());
        assert!(store.set_content_type("c", "a.png", "x").await.is_err());
    }

    #[test]
    fn test_container_name_validation() {
        let store = FsBlobStore::new("/tmp/unused");
        assert!(store.object_path("a/b", "x").is_err());
        assert!(store.object_path("..", "x").is_err());
        assert!(store.object_path("c", "../x").is_err());
    }
}
