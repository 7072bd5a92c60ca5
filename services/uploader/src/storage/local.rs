use super::{validate_key, ObjectStore, StorageError, OUTPUT_PREFIX};
use crate::config::StorageConfig;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Object store laid out as `{root}/{container}/{key}` on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    container: String,
    index_key: String,
}

impl LocalStore {
    /// Create the store, making sure the photo container directory exists
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        validate_key(&config.bucket)?;
        validate_key(&config.index_key)?;

        let store = Self {
            root: config.root_dir.clone(),
            container: config.bucket.clone(),
            index_key: config.index_key.clone(),
        };
        std::fs::create_dir_all(store.container_dir(&store.container))?;

        info!(
            root = %store.root.display(),
            container = %store.container,
            "Local object store initialized"
        );

        Ok(store)
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join(container)
    }

    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(container)?;
        validate_key(key)?;
        Ok(self.container_dir(container).join(key))
    }

    /// Write through a sibling `.part` file so readers never see half an object
    async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(path);
        fs::write(&partial, bytes).await?;
        fs::rename(&partial, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn container(&self) -> &str {
        &self.container
    }

    #[instrument(skip(self, source, progress), fields(container = %container, key = %key))]
    async fn put_file(
        &self,
        container: &str,
        key: &str,
        source: &Path,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, StorageError> {
        let destination = self.object_path(container, key)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(&destination);
        let written = match copy_through(source, &partial, &destination, progress).await {
            Ok(written) => written,
            Err(e) => {
                discard_partial(&partial).await;
                return Err(e.into());
            }
        };

        debug!(path = %destination.display(), bytes = written, "File copied");
        Ok(written)
    }

    #[instrument(skip(self), fields(container = %container, key = %key))]
    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(container, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Matches S3 semantics: deleting a missing object succeeds
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(container = %container))]
    async fn delete_all(&self, container: &str) -> Result<usize, StorageError> {
        validate_key(container)?;
        let dir = self.container_dir(container);
        let removed = clear_dir(&dir).await?;
        info!(container = %container, removed, "Container emptied");
        Ok(removed)
    }

    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>, StorageError> {
        let path = self.object_path(&self.container, key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_output(&self) -> Result<usize, StorageError> {
        let dir = self
            .container_dir(&self.container)
            .join(OUTPUT_PREFIX.trim_end_matches('/'));
        let removed = clear_dir(&dir).await?;
        debug!(removed, "Output area cleared");
        Ok(removed)
    }

    async fn load_index_blob(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.object_path(&self.container, &self.index_key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_index_blob(&self, blob: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(&self.container, &self.index_key)?;
        Self::write_atomically(&path, blob).await
    }
}

/// Chunked copy of `source` into `partial`, renamed to `destination` once complete
async fn copy_through(
    source: &Path,
    partial: &Path,
    destination: &Path,
    progress: &(dyn Fn(u64) + Send + Sync),
) -> std::io::Result<u64> {
    let mut reader = fs::File::open(source).await?;
    let mut writer = fs::File::create(partial).await?;
    let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
    let mut written = 0u64;

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        written += read as u64;
        progress(written);
    }
    writer.flush().await?;
    writer.sync_all().await?;
    drop(writer);

    fs::rename(partial, destination).await?;
    Ok(written)
}

async fn discard_partial(partial: &Path) {
    match fs::remove_file(partial).await {
        Ok(()) => debug!(path = %partial.display(), "Partial copy removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %partial.display(), error = %e, "Failed to remove partial copy"),
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Remove every file below `dir`, keeping `dir` itself. Returns files removed.
async fn clear_dir(dir: &Path) -> Result<usize, StorageError> {
    let mut removed = 0;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else {
                removed += 1;
            }
        }
    }

    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(dir).await?;

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> LocalStore {
        LocalStore::new(&StorageConfig::local(dir)).unwrap()
    }

    fn source_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("root"));
        let source = source_file(dir.path(), "IMG_001.jpg", b"jpeg bytes");

        // A non-empty directory in the way makes the final rename fail
        let destination = dir.path().join("root").join(store.container()).join("abc-IMG_001.jpg");
        std::fs::create_dir_all(&destination).unwrap();
        std::fs::write(destination.join("occupied"), b"x").unwrap();

        let result = store
            .put_file(store.container(), "abc-IMG_001.jpg", &source, &|_| {})
            .await;

        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(!partial_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_put_then_get_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("root"));
        let source = source_file(dir.path(), "IMG_001.jpg", b"jpeg bytes");

        let written = store
            .put_file(store.container(), "abc-IMG_001.jpg", &source, &|_| {})
            .await
            .unwrap();
        assert_eq!(written, 10);

        let fetched = store.get_file("abc-IMG_001.jpg").await.unwrap().unwrap();
        assert_eq!(std::fs::read(fetched).unwrap(), b"jpeg bytes");
        assert!(store.get_file("missing-IMG_001.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("root"));
        let source = source_file(dir.path(), "IMG_001.jpg", b"x");

        store
            .put_file(store.container(), "k.jpg", &source, &|_| {})
            .await
            .unwrap();
        store.delete(store.container(), "k.jpg").await.unwrap();
        store.delete(store.container(), "k.jpg").await.unwrap();

        assert!(store.get_file("k.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_all_only_touches_named_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("root"));
        let source = source_file(dir.path(), "IMG_001.jpg", b"x");

        store.put_file("other", "a.jpg", &source, &|_| {}).await.unwrap();
        store.put_file("other", "b.jpg", &source, &|_| {}).await.unwrap();
        store
            .put_file(store.container(), "keep.jpg", &source, &|_| {})
            .await
            .unwrap();

        assert_eq!(store.delete_all("other").await.unwrap(), 2);
        assert!(store.get_file("keep.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_output_keeps_photos() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir.path().join("root"));
        let source = source_file(dir.path(), "track.gpx", b"<gpx/>");

        store
            .put_file(store.container(), "output/GPX_1_a.gpx", &source, &|_| {})
            .await
            .unwrap();
        store
            .put_file(store.container(), "id-IMG.jpg", &source, &|_| {})
            .await
            .unwrap();

        assert_eq!(store.clear_output().await.unwrap(), 1);
        assert!(store.get_file("output/GPX_1_a.gpx").await.unwrap().is_none());
        assert!(store.get_file("id-IMG.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_index_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        assert!(store.load_index_blob().await.unwrap().is_none());
        store.save_index_blob(b"[]").await.unwrap();
        assert_eq!(store.load_index_blob().await.unwrap().unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let result = store.delete(store.container(), "../escape").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }
}
