//! Object storage backends.
//!
//! [`ObjectStore`] is the byte-level contract every backend implements:
//! copy into a container, remove, fetch, and persist the spatial index blob.
//! A [`Transfer`] binds a backend to exactly one [`UploadRequest`]; its
//! operations consume it, so one transfer can never serve two requests.

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::S3Store;

use crate::config::{StorageConfig, StorageType};
use crate::request::{ObjectAddress, UploadEvent, UploadRequest};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Sub-area of a container reserved for derived artifacts
pub const OUTPUT_PREFIX: &str = "output/";

/// Errors raised by storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store request failed: {0}")]
    Backend(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Request has no assigned container/key")]
    Unaddressed,
}

/// Byte-level operations against a named container and key
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Container holding photo objects and the index blob
    fn container(&self) -> &str;

    /// Copy `source` to `container/key`, reporting bytes written so far
    async fn put_file(
        &self,
        container: &str,
        key: &str,
        source: &Path,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, StorageError>;

    /// Delete `container/key`
    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError>;

    /// Delete every object in `container` and nothing else
    async fn delete_all(&self, container: &str) -> Result<usize, StorageError>;

    /// Materialize the object at `key` in the photo container as a local file
    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>, StorageError>;

    /// Delete every object under the output sub-area of the photo container
    async fn clear_output(&self) -> Result<usize, StorageError>;

    /// Serialized spatial index, `None` when never saved
    async fn load_index_blob(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Overwrite the serialized spatial index
    async fn save_index_blob(&self, blob: &[u8]) -> Result<(), StorageError>;
}

/// Build the backend selected by configuration
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let store: Arc<dyn ObjectStore> = match config.storage_type {
        StorageType::Local => Arc::new(LocalStore::new(config)?),
        StorageType::S3 => Arc::new(S3Store::new(config).await),
    };
    Ok(store)
}

/// Key of `key` inside the output sub-area
pub fn output_key(key: &str) -> String {
    format!("{OUTPUT_PREFIX}{key}")
}

/// One backend bound to one request
pub struct Transfer {
    store: Arc<dyn ObjectStore>,
    request: Arc<UploadRequest>,
}

impl Transfer {
    pub fn new(store: Arc<dyn ObjectStore>, request: Arc<UploadRequest>) -> Self {
        Self { store, request }
    }

    /// Copy the request's file to its container/key.
    ///
    /// Fires progress events during the copy, then exactly one of
    /// [`UploadEvent::Uploaded`] or [`UploadEvent::UploadFailed`].
    pub async fn copy_file(self) -> Result<u64, StorageError> {
        self.copy(false).await
    }

    /// Like [`Transfer::copy_file`], targeting the container's output area
    pub async fn copy_file_to_output(self) -> Result<u64, StorageError> {
        self.copy(true).await
    }

    /// Remove the request's object, firing [`UploadEvent::Removed`] or
    /// [`UploadEvent::RemoveFailed`]
    pub async fn remove_file(self) -> Result<(), StorageError> {
        let result = match self.request.address() {
            Some(address) => self.store.delete(&address.container, &address.key).await,
            None => Err(StorageError::Unaddressed),
        };

        match &result {
            Ok(()) => {
                debug!(address = ?self.request.address(), "Object removed");
                self.request.emit(UploadEvent::Removed);
            }
            Err(e) => {
                warn!(address = ?self.request.address(), error = %e, "Object removal failed");
                self.request.emit(UploadEvent::RemoveFailed(e.to_string()));
            }
        }

        result
    }

    async fn copy(self, to_output: bool) -> Result<u64, StorageError> {
        let result = match self.request.address() {
            Some(ObjectAddress { container, key }) => {
                let key = if to_output { output_key(key) } else { key.clone() };
                let request = &self.request;
                let progress = |bytes: u64| request.emit(UploadEvent::Progress(bytes));
                self.store
                    .put_file(container, &key, request.file(), &progress)
                    .await
            }
            None => Err(StorageError::Unaddressed),
        };

        match &result {
            Ok(bytes) => {
                debug!(address = ?self.request.address(), bytes, "Object stored");
                self.request.emit(UploadEvent::Uploaded);
            }
            Err(e) => {
                warn!(address = ?self.request.address(), error = %e, "Object transfer failed");
                self.request.emit(UploadEvent::UploadFailed(e.to_string()));
            }
        }

        result
    }
}

/// Reject keys that could escape their container
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let escapes = key.is_empty()
        || key.starts_with('/')
        || key.split(['/', '\\']).any(|part| part == "..");
    if escapes {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingStore;
    use parking_lot::Mutex;

    fn addressed_request(file: &Path, key: &str) -> UploadRequest {
        let request = UploadRequest::new(file);
        request.assign_address(ObjectAddress {
            container: "bristol-streetview-photos".to_string(),
            key: key.to_string(),
        });
        request
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("abc123-IMG_002.jpg").is_ok());
        assert!(validate_key("output/GPX_7_ff.gpx").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_output_key() {
        assert_eq!(output_key("GPX_7_abc.gpx"), "output/GPX_7_abc.gpx");
    }

    #[tokio::test]
    async fn test_copy_file_fires_progress_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("IMG_002.jpg");
        std::fs::write(&source, vec![7u8; 1024]).unwrap();

        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&StorageConfig::local(dir.path().join("root"))).unwrap());

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut request = addressed_request(&source, "abc123-IMG_002.jpg");
        let seen = events.clone();
        request.on_event(move |_, event| seen.lock().push(event.clone()));

        let bytes = Transfer::new(store.clone(), Arc::new(request))
            .copy_file()
            .await
            .unwrap();

        assert_eq!(bytes, 1024);
        let events = events.lock();
        assert_eq!(events.last(), Some(&UploadEvent::Uploaded));
        assert!(events.contains(&UploadEvent::Progress(1024)));
        assert!(store.get_file("abc123-IMG_002.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_copy_failure_fires_upload_failed() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut request = addressed_request(Path::new("/tmp/IMG_003.jpg"), "id-IMG_003.jpg");
        let seen = events.clone();
        request.on_event(move |_, event| seen.lock().push(event.clone()));

        let result = Transfer::new(Arc::new(FailingStore::default()), Arc::new(request))
            .copy_file()
            .await;

        assert!(result.is_err());
        assert!(matches!(
            events.lock().as_slice(),
            [UploadEvent::UploadFailed(_)]
        ));
    }

    #[tokio::test]
    async fn test_unaddressed_request_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&StorageConfig::local(dir.path())).unwrap());

        let request = Arc::new(UploadRequest::new(dir.path().join("IMG_004.jpg")));
        let result = Transfer::new(store, request).remove_file().await;

        assert!(matches!(result, Err(StorageError::Unaddressed)));
    }
}
