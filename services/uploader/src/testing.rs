//! Test doubles shared by the module tests.

use crate::config::StorageConfig;
use crate::metadata::{ExtractionError, MetadataExtractor, PhotoMetadata};
use crate::photo_store::{PhotoRecord, PhotoStore, StoreError};
use crate::request::ObjectAddress;
use crate::storage::{LocalStore, ObjectStore, StorageError};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub fn timestamp(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2018, 7, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

pub fn photo_metadata(identity: Option<&str>, latitude: f64, longitude: f64) -> PhotoMetadata {
    PhotoMetadata {
        identity: identity.map(String::from),
        height: 3000,
        width: 4000,
        capture_time: timestamp(23, 12, 31),
        latitude,
        longitude,
        device_serial: Some("12345567".to_string()),
    }
}

/// Write a fake photo into `dir`
pub fn photo_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("jpeg bytes of {name}")).unwrap();
    path
}

/// Extractor answering from a table keyed by file name
#[derive(Default)]
pub struct FixedExtractor {
    by_name: HashMap<String, PhotoMetadata>,
}

impl FixedExtractor {
    pub fn with(mut self, file_name: &str, metadata: PhotoMetadata) -> Self {
        self.by_name.insert(file_name.to_string(), metadata);
        self
    }
}

impl MetadataExtractor for FixedExtractor {
    fn extract(&self, path: &Path) -> Result<PhotoMetadata, ExtractionError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.by_name
            .get(&name)
            .cloned()
            .ok_or_else(|| ExtractionError::UnsupportedFormat(name))
    }
}

#[derive(Debug, Clone, Copy)]
enum InsertBehaviour {
    Accept,
    Rows(u64),
    Fail,
}

/// Photo store keeping records in memory
pub struct InMemoryPhotoStore {
    records: Mutex<Vec<PhotoRecord>>,
    behaviour: InsertBehaviour,
}

impl Default for InMemoryPhotoStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            behaviour: InsertBehaviour::Accept,
        }
    }
}

impl InMemoryPhotoStore {
    /// Every insert raises a database error
    pub fn failing() -> Self {
        Self {
            behaviour: InsertBehaviour::Fail,
            ..Self::default()
        }
    }

    /// Every insert reports `rows` affected without storing anything
    pub fn affecting(rows: u64) -> Self {
        Self {
            behaviour: InsertBehaviour::Rows(rows),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<PhotoRecord> {
        self.records.lock().clone()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.lock().iter().any(|r| r.identity == identity)
    }

    fn matching<F>(&self, what: String, predicate: F) -> Result<Vec<String>, StoreError>
    where
        F: Fn(&PhotoRecord) -> bool,
    {
        let ids: Vec<String> = self
            .records
            .lock()
            .iter()
            .filter(|r| predicate(r))
            .map(|r| r.identity.clone())
            .collect();
        if ids.is_empty() {
            return Err(StoreError::NoMatch(what));
        }
        Ok(ids)
    }
}

#[async_trait]
impl PhotoStore for InMemoryPhotoStore {
    async fn insert(&self, record: &PhotoRecord) -> Result<u64, StoreError> {
        match self.behaviour {
            InsertBehaviour::Fail => Err(StoreError::Database(sqlx::Error::PoolTimedOut)),
            InsertBehaviour::Rows(rows) => Ok(rows),
            InsertBehaviour::Accept => {
                let mut records = self.records.lock();
                if records.iter().any(|r| r.identity == record.identity) {
                    return Ok(0);
                }
                records.push(record.clone());
                Ok(1)
            }
        }
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        let removed = records.len() as u64;
        records.clear();
        Ok(removed)
    }

    async fn get_path(&self, identity: &str) -> Result<ObjectAddress, StoreError> {
        self.records
            .lock()
            .iter()
            .find(|r| r.identity == identity)
            .map(PhotoRecord::address)
            .ok_or_else(|| StoreError::NoMatch(identity.to_string()))
    }

    async fn photos_taken_at(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.matching(format!("({latitude}, {longitude})"), |r| {
            r.latitude == latitude && r.longitude == longitude
        })
    }

    async fn photos_taken_on(&self, time: NaiveDateTime) -> Result<Vec<String>, StoreError> {
        self.matching(time.to_string(), |r| r.capture_time == time)
    }

    async fn photos_uploaded_on(&self, time: NaiveDateTime) -> Result<Vec<String>, StoreError> {
        self.matching(time.to_string(), |r| r.upload_time == time)
    }

    async fn photos_taken_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<String>, StoreError> {
        self.matching(format!("{start}..{end}"), |r| {
            r.capture_time >= start && r.capture_time <= end
        })
    }

    async fn photos_uploaded_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<String>, StoreError> {
        self.matching(format!("{start}..{end}"), |r| {
            r.upload_time >= start && r.upload_time <= end
        })
    }
}

/// Object store that can be told to fail puts and/or deletes.
///
/// The default instance has no backing store and fails everything.
#[derive(Default)]
pub struct FailingStore {
    inner: Option<LocalStore>,
    fail_put: bool,
    fail_delete: bool,
}

impl FailingStore {
    /// Backed by a local store under `root`, failing only the chosen operations
    pub fn wrapping(root: &Path, fail_put: bool, fail_delete: bool) -> Self {
        Self {
            inner: Some(LocalStore::new(&StorageConfig::local(root)).unwrap()),
            fail_put,
            fail_delete,
        }
    }

    fn inner(&self) -> Result<&LocalStore, StorageError> {
        self.inner
            .as_ref()
            .ok_or_else(|| StorageError::Backend("store unavailable".to_string()))
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    fn container(&self) -> &str {
        self.inner
            .as_ref()
            .map(|s| s.container())
            .unwrap_or("bristol-streetview-photos")
    }

    async fn put_file(
        &self,
        container: &str,
        key: &str,
        source: &Path,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, StorageError> {
        if self.fail_put {
            return Err(StorageError::Backend("simulated put failure".to_string()));
        }
        self.inner()?.put_file(container, key, source, progress).await
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError> {
        if self.fail_delete {
            return Err(StorageError::Backend("simulated delete failure".to_string()));
        }
        self.inner()?.delete(container, key).await
    }

    async fn delete_all(&self, container: &str) -> Result<usize, StorageError> {
        self.inner()?.delete_all(container).await
    }

    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>, StorageError> {
        self.inner()?.get_file(key).await
    }

    async fn clear_output(&self) -> Result<usize, StorageError> {
        self.inner()?.clear_output().await
    }

    async fn load_index_blob(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner()?.load_index_blob().await
    }

    async fn save_index_blob(&self, blob: &[u8]) -> Result<(), StorageError> {
        self.inner()?.save_index_blob(blob).await
    }
}
