//! Drives upload requests through store, commit and rollback.
//!
//! ```text
//! submit ──▶ extract ──▶ assign key ──▶ [pool] copy ──▶ [pool] insert record
//!    │                                    │                  │
//!    ▼                                    ▼                  ├─ 1 row ──▶ index + session
//! Rejected                           UploadFailed            ▼
//!                                                     [pool] remove object
//!                                                            │
//!                                               Compensated / CompensationFailed
//! ```
//!
//! Every step after submission runs on the shared [`WorkerPool`], never on the
//! caller's task. Listeners see each event before the state that follows it is
//! published, so a caller woken by [`UploadHandle::wait`] has already observed
//! the full event sequence.

use crate::config::UploaderConfig;
use crate::metadata::{ExtractionError, MetadataExtractor, PhotoMetadata};
use crate::photo_store::{PhotoRecord, PhotoStore, StoreError, RECORD_VERSION};
use crate::request::{
    InvalidTransition, ObjectAddress, UploadEvent, UploadHandle, UploadRequest, UploadState,
};
use crate::session::Session;
use crate::spatial_index::SpatialIndex;
use crate::storage::{ObjectStore, StorageError, Transfer};
use crate::worker_pool::{PoolError, WorkerPool};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Why a request ended somewhere other than a committed record
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Metadata extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("File {file_name} is externally tagged but carries no embedded identity")]
    IdentityRequired { file_name: String },

    #[error("Object key {0} is held by another upload in flight")]
    KeyInFlight(String),

    #[error("Object {0} already belongs to a committed photo")]
    KeyCommitted(ObjectAddress),

    #[error("Could not check ownership of the object key: {0}")]
    KeyCheck(#[source] StoreError),

    #[error("Transfer failed: {0}")]
    Transfer(#[source] StorageError),

    #[error("Record commit failed: {0}")]
    RecordCommit(String),

    #[error("Compensating removal of {address} failed: {source}")]
    Compensation {
        address: ObjectAddress,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    State(#[from] InvalidTransition),
}

/// Failures of coordinator operations themselves
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Submission refused: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Request(#[from] UploadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pool sizing and identity policy
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub externally_tagged_marker: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&UploaderConfig::default())
    }
}

impl From<&UploaderConfig> for CoordinatorSettings {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            externally_tagged_marker: config.externally_tagged_marker.clone(),
        }
    }
}

/// Decide a photo's identity.
///
/// An embedded identity always wins. Without one, a file whose name carries
/// `marker` is refused; anything else gets a fresh random identity.
pub fn derive_identity(
    embedded: Option<&str>,
    file_name: &str,
    marker: &str,
) -> Result<String, UploadError> {
    match embedded {
        Some(identity) if !identity.trim().is_empty() => Ok(identity.trim().to_string()),
        _ if !marker.is_empty() && file_name.contains(marker) => {
            Err(UploadError::IdentityRequired {
                file_name: file_name.to_string(),
            })
        }
        _ => Ok(Uuid::new_v4().simple().to_string()),
    }
}

/// Object key for a photo: `{identity}-{file name}`
pub fn object_key(identity: &str, file_name: &str) -> String {
    format!("{identity}-{file_name}")
}

/// Entry point for uploads, shared by every caller
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    pool: WorkerPool,
    store: Arc<dyn ObjectStore>,
    photos: Arc<dyn PhotoStore>,
    extractor: Arc<dyn MetadataExtractor>,
    index: Arc<SpatialIndex>,
    session: Arc<Session>,
    claims: Arc<Mutex<HashSet<String>>>,
    marker: String,
}

/// Exclusive hold on an object key while a request is between key
/// assignment and its terminal state. Released on drop.
struct KeyClaim {
    claims: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl KeyClaim {
    fn acquire(claims: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        if !claims.lock().insert(key.to_string()) {
            return None;
        }
        Some(Self {
            claims: claims.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for KeyClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.key);
    }
}

impl UploadCoordinator {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn new(
        settings: CoordinatorSettings,
        store: Arc<dyn ObjectStore>,
        photos: Arc<dyn PhotoStore>,
        extractor: Arc<dyn MetadataExtractor>,
        index: Arc<SpatialIndex>,
    ) -> Self {
        let pool = WorkerPool::new(settings.workers, settings.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                pool,
                store,
                photos,
                extractor,
                index,
                session: Arc::new(Session::new()),
                claims: Arc::new(Mutex::new(HashSet::new())),
                marker: settings.externally_tagged_marker,
            }),
        }
    }

    /// Accept a photo for upload.
    ///
    /// Extraction and key assignment happen before this returns; the copy and
    /// everything after it run on the pool. A request refused for its
    /// metadata still yields a handle: it ends in [`UploadState::Rejected`]
    /// after its listeners hear [`UploadEvent::UploadFailed`].
    ///
    /// When the pool refuses the work the request is rejected on the
    /// caller's task before the error is returned, so its listeners still
    /// hear the failure.
    #[instrument(skip(self, request), fields(file = %request.file().display()))]
    pub fn submit(&self, request: UploadRequest) -> Result<UploadHandle, CoordinatorError> {
        if !self.inner.pool.is_accepting() {
            return Err(PoolError::Shutdown.into());
        }

        let request = Arc::new(request);
        let handle = UploadHandle::new(request.clone());

        match self.inner.prepare(&request) {
            Ok(claim) => {
                let inner = self.inner.clone();
                let job = request.clone();
                // A refused job is dropped along with its key claim
                let queued = self
                    .inner
                    .pool
                    .submit(async move { inner.upload(job, claim).await });
                if let Err(e) = queued {
                    refuse(&request, format!("Submission refused: {e}"));
                    return Err(e.into());
                }
                metrics::counter!("uploader.requests.submitted").increment(1);
            }
            Err(err) => self.inner.reject(request, err)?,
        }

        Ok(handle)
    }

    /// Upload a derived artifact into the output area of the photo container.
    ///
    /// The request is addressed under `key` directly and never touches the
    /// record store; success ends in [`UploadState::Exported`].
    pub(crate) fn submit_export(
        &self,
        request: UploadRequest,
        key: String,
    ) -> Result<UploadHandle, CoordinatorError> {
        if !self.inner.pool.is_accepting() {
            return Err(PoolError::Shutdown.into());
        }

        request.assign_address(ObjectAddress {
            container: self.inner.store.container().to_string(),
            key,
        });
        request.advance(UploadState::KeyAssigned).map_err(UploadError::from)?;

        let request = Arc::new(request);
        let handle = UploadHandle::new(request.clone());
        let inner = self.inner.clone();
        self.inner
            .pool
            .submit(async move { inner.export(request).await })?;

        Ok(handle)
    }

    /// Photos committed since startup and not yet exported
    pub fn session(&self) -> Arc<Session> {
        self.inner.session.clone()
    }

    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.inner.index
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    pub fn photos(&self) -> &Arc<dyn PhotoStore> {
        &self.inner.photos
    }

    /// Identities of the photos nearest a point, closest first
    pub fn photos_around(&self, latitude: f64, longitude: f64, max_results: usize) -> Vec<String> {
        self.inner.index.query(latitude, longitude, max_results)
    }

    /// Download the photos nearest a point, closest first.
    ///
    /// Photos whose record or object has gone missing are skipped.
    #[instrument(skip(self))]
    pub async fn fetch_photos_around(
        &self,
        latitude: f64,
        longitude: f64,
        max_results: usize,
    ) -> Result<Vec<PathBuf>, CoordinatorError> {
        let mut files = Vec::new();
        for identity in self.photos_around(latitude, longitude, max_results) {
            let address = match self.inner.photos.get_path(&identity).await {
                Ok(address) => address,
                Err(StoreError::NoMatch(_)) => {
                    warn!(identity = %identity, "Indexed photo has no record");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.inner.store.get_file(&address.key).await? {
                Some(path) => files.push(path),
                None => warn!(identity = %identity, address = %address, "Indexed photo has no object"),
            }
        }
        Ok(files)
    }

    /// Remove every record, every photo object and every index entry
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<(u64, usize), CoordinatorError> {
        let records = self.inner.photos.delete_all().await?;
        let objects = self.inner.store.delete_all(self.inner.store.container()).await?;
        self.inner.index.clear();
        self.inner.session.clear();

        info!(records, objects, "Deleted all photos");
        Ok((records, objects))
    }

    /// Wait until no request is queued or in flight
    pub async fn idle(&self) {
        self.inner.pool.idle().await;
    }

    /// Refuse new submissions and let in-flight requests finish for up to
    /// `grace`. Returns whether everything finished.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.pool.shutdown(grace).await
    }
}

impl Inner {
    fn prepare(&self, request: &UploadRequest) -> Result<KeyClaim, UploadError> {
        let mut metadata = self.extractor.extract(request.file())?;
        request.advance(UploadState::MetadataExtracted)?;
        // Extractors are pluggable, so the position is checked here as well
        metadata.check_position()?;
        check_dimensions(&metadata)?;

        let file_name = request.file_name();
        let identity = derive_identity(metadata.identity.as_deref(), &file_name, &self.marker);
        metadata.identity = identity.as_ref().ok().cloned();
        request.attach_metadata(metadata);
        let identity = identity?;

        let address = ObjectAddress {
            container: self.store.container().to_string(),
            key: object_key(&identity, &file_name),
        };
        let claim = KeyClaim::acquire(&self.claims, &address.key)
            .ok_or_else(|| UploadError::KeyInFlight(address.key.clone()))?;
        debug!(identity = %identity, address = %address, "Assigned object key");
        request.assign_address(address);
        request.advance(UploadState::KeyAssigned)?;
        Ok(claim)
    }

    fn reject(&self, request: Arc<UploadRequest>, err: UploadError) -> Result<(), PoolError> {
        let reason = err.to_string();
        let job = request.clone();
        let notify = reason.clone();
        if let Err(e) = self.pool.submit(async move { refuse(&job, notify) }) {
            refuse(&request, reason);
            return Err(e);
        }
        Ok(())
    }

    /// Fail if a committed record already owns the request's object key
    async fn check_key_free(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let (Some(identity), Some(address)) = (request.identity(), request.address()) else {
            return Ok(());
        };
        match self.photos.get_path(identity).await {
            Ok(existing) if existing == *address => Err(UploadError::KeyCommitted(existing)),
            Ok(_) | Err(StoreError::NoMatch(_)) => Ok(()),
            Err(e) => Err(UploadError::KeyCheck(e)),
        }
    }

    #[instrument(skip_all, fields(address = ?request.address()))]
    async fn upload(self: Arc<Self>, request: Arc<UploadRequest>, claim: KeyClaim) {
        if let Err(err) = self.check_key_free(&request).await {
            drop(claim);
            refuse(&request, err.to_string());
            return;
        }

        if !settle(&request, UploadState::Uploading) {
            return;
        }

        let started = Instant::now();
        match Transfer::new(self.store.clone(), request.clone()).copy_file().await {
            Ok(bytes) => {
                metrics::histogram!("uploader.upload.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                metrics::counter!("uploader.bytes.uploaded").increment(bytes);
                settle(&request, UploadState::Uploaded);

                let inner = self.clone();
                let job = request.clone();
                if let Err(e) = self.pool.spawn(async move { inner.commit(job, claim).await }) {
                    error!(
                        address = ?request.address(),
                        error = %e,
                        "Stored object can no longer be committed"
                    );
                }
            }
            Err(e) => {
                let err = UploadError::Transfer(e);
                warn!(error = %err, "Upload failed");
                metrics::counter!("uploader.uploads.failed").increment(1);
                drop(claim);
                settle(&request, UploadState::UploadFailed);
            }
        }
    }

    #[instrument(skip_all, fields(address = ?request.address()))]
    async fn commit(self: Arc<Self>, request: Arc<UploadRequest>, claim: KeyClaim) {
        if !settle(&request, UploadState::CommittingRecord) {
            return;
        }

        let outcome = match build_record(&request) {
            Ok(record) => match self.photos.insert(&record).await {
                Ok(1) => Ok(record),
                Ok(rows) => Err(UploadError::RecordCommit(format!(
                    "database returned {rows} rows affected"
                ))),
                Err(e) => Err(UploadError::RecordCommit(e.to_string())),
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(record) => {
                if !self
                    .index
                    .insert(&record.identity, record.latitude, record.longitude)
                {
                    error!(identity = %record.identity, "Committed photo left out of the index");
                }
                self.session.push(request.clone());
                // The record now owns the key
                drop(claim);

                request.emit(UploadEvent::RecordCommitted);
                settle(&request, UploadState::RecordCommitted);

                metrics::counter!("uploader.uploads.committed").increment(1);
                info!(identity = %record.identity, "Photo committed");
            }
            Err(err) => {
                warn!(error = %err, "Record rejected, compensating");
                metrics::counter!("uploader.records.rejected").increment(1);

                if !settle(&request, UploadState::RecordRejected) {
                    return;
                }
                request.emit(UploadEvent::RecordFailed(err.to_string()));

                let inner = self.clone();
                let job = request.clone();
                if let Err(e) = self.pool.spawn(async move { inner.compensate(job, claim).await }) {
                    error!(
                        address = ?request.address(),
                        error = %e,
                        "Could not schedule compensation; object orphaned"
                    );
                }
            }
        }
    }

    #[instrument(skip_all, fields(address = ?request.address()))]
    async fn compensate(self: Arc<Self>, request: Arc<UploadRequest>, claim: KeyClaim) {
        // The only edge into Compensating leaves RecordRejected, so this runs once
        if !settle(&request, UploadState::Compensating) {
            return;
        }

        let removed = Transfer::new(self.store.clone(), request.clone()).remove_file().await;
        drop(claim);
        match removed {
            Ok(()) => {
                metrics::counter!("uploader.compensations.succeeded").increment(1);
                info!("Uncommitted object removed");
                settle(&request, UploadState::Compensated);
            }
            Err(source) => {
                let err = UploadError::Compensation {
                    address: request.address().cloned().unwrap_or_else(|| ObjectAddress {
                        container: self.store.container().to_string(),
                        key: String::new(),
                    }),
                    source,
                };
                metrics::counter!("uploader.compensations.failed").increment(1);
                error!(error = %err, "Object orphaned without a record");
                settle(&request, UploadState::CompensationFailed);
            }
        }
    }

    #[instrument(skip_all, fields(address = ?request.address()))]
    async fn export(self: Arc<Self>, request: Arc<UploadRequest>) {
        if !settle(&request, UploadState::Uploading) {
            return;
        }

        match Transfer::new(self.store.clone(), request.clone())
            .copy_file_to_output()
            .await
        {
            Ok(bytes) => {
                metrics::counter!("uploader.exports.stored").increment(1);
                info!(bytes, "Artifact exported");
                settle(&request, UploadState::Uploaded);
                settle(&request, UploadState::Exported);
            }
            Err(e) => {
                warn!(error = %UploadError::Transfer(e), "Export failed");
                metrics::counter!("uploader.exports.failed").increment(1);
                settle(&request, UploadState::UploadFailed);
            }
        }
    }
}

/// Tell the listeners a request was refused and end it in `Rejected`
fn refuse(request: &UploadRequest, reason: String) {
    warn!(file = %request.file().display(), reason = %reason, "Upload request rejected");
    metrics::counter!("uploader.requests.rejected").increment(1);
    request.emit(UploadEvent::UploadFailed(reason));
    settle(request, UploadState::Rejected);
}

/// Apply a transition, logging instead of failing when it is not allowed
fn settle(request: &UploadRequest, next: UploadState) -> bool {
    match request.advance(next) {
        Ok(()) => true,
        Err(e) => {
            error!(file = %request.file().display(), error = %e, "Upload step skipped");
            false
        }
    }
}

/// Pixel dimensions must fit the record's integer columns
fn check_dimensions(metadata: &PhotoMetadata) -> Result<(), UploadError> {
    pixel_count("height", metadata.height)?;
    pixel_count("width", metadata.width)?;
    Ok(())
}

fn pixel_count(what: &str, value: u32) -> Result<i32, UploadError> {
    i32::try_from(value).map_err(|_| {
        UploadError::Extraction(ExtractionError::UnreadableMetadata(format!(
            "{what} of {value} pixels is out of range"
        )))
    })
}

fn build_record(request: &UploadRequest) -> Result<PhotoRecord, UploadError> {
    let incomplete = || UploadError::RecordCommit("request has no metadata or address".to_string());
    let metadata = request.metadata().ok_or_else(incomplete)?;
    let address = request.address().ok_or_else(incomplete)?;
    let identity = metadata.identity.clone().ok_or_else(incomplete)?;
    let record_error = |err: UploadError| UploadError::RecordCommit(err.to_string());
    Ok(PhotoRecord {
        identity,
        height: pixel_count("height", metadata.height).map_err(record_error)?,
        width: pixel_count("width", metadata.width).map_err(record_error)?,
        capture_time: metadata.capture_time,
        upload_time: Utc::now().naive_utc(),
        latitude: metadata.latitude,
        longitude: metadata.longitude,
        device_serial: metadata.device_serial.clone(),
        version: RECORD_VERSION,
        container: address.container.clone(),
        object_key: address.key.clone(),
    })
}
