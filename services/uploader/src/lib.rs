//! Streetview Uploader Service
//!
//! Photo upload pipeline for the Bristol street-view capture rig. Each photo
//! has its EXIF metadata extracted, is copied into a pluggable object store,
//! and is recorded in PostgreSQL. If the record cannot be written, the copied
//! object is removed again, so storage never holds a photo the database does
//! not know about. Committed photos are indexed by position in an R-tree and
//! can be exported as a GPX route.
//!
//! ## Features
//!
//! - **Compensating rollback**: every request ends in a distinct terminal
//!   state, and a failed record commit triggers exactly one removal attempt
//! - **Pluggable storage**: local directory tree or S3 (including MinIO),
//!   selected by configuration
//! - **Geospatial index**: nearest-photo queries, persisted as one blob in
//!   the photo container
//! - **Route export**: the session's committed photos as a GPX track in the
//!   container's output area
//!
//! ## Architecture
//!
//! ```text
//!  Photo files              Object store               PostgreSQL
//! ┌──────────────┐        ┌──────────────────┐       ┌──────────────┐
//! │ IMG_*.jpg    │        │ {id}-{file name} │       │ photos       │
//! └──────────────┘        │ output/GPX_*.gpx │       └──────────────┘
//!        │                │ rtree.tree       │              ▲
//!        ▼                └──────────────────┘              │
//! ┌──────────────┐                ▲   ▲                     │
//! │ Metadata     │                │   │ remove on           │
//! │ Extractor    │                │   │ failed commit       │
//! └──────────────┘                │   │                     │
//!        │                ┌───────┴───┴──────┐              │
//!        ▼                │ Upload           │──────────────┘
//! ┌──────────────┐        │ Coordinator      │
//! │ Upload       │───────▶│  (worker pool)   │
//! │ Request      │        └──────────────────┘
//! └──────────────┘            │          │
//!                             ▼          ▼
//!                     ┌────────────┐ ┌────────────┐
//!                     │ Spatial    │ │ Route      │
//!                     │ Index      │ │ Exporter   │
//!                     └────────────┘ └────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod metadata;
pub mod photo_store;
pub mod request;
pub mod route_exporter;
pub mod session;
pub mod spatial_index;
pub mod storage;
pub mod worker_pool;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use coordinator::{
    derive_identity, object_key, CoordinatorError, CoordinatorSettings, UploadCoordinator,
    UploadError,
};
pub use metadata::{ExifExtractor, ExtractionError, MetadataExtractor, PhotoMetadata};
pub use photo_store::{PgPhotoStore, PhotoRecord, PhotoStore, StoreError};
pub use request::{ObjectAddress, UploadEvent, UploadHandle, UploadRequest, UploadState};
pub use route_exporter::{export_session, ExportError};
pub use session::Session;
pub use spatial_index::{IndexError, SpatialIndex};
pub use storage::{LocalStore, ObjectStore, S3Store, StorageError, Transfer};
pub use worker_pool::{PoolError, WorkerPool};
