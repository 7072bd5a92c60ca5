//! Export of the session's committed photos as a GPX route.

use crate::coordinator::{CoordinatorError, UploadCoordinator};
use crate::request::{UploadHandle, UploadRequest};
use chrono::{TimeZone, Utc};
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No committed photos to export")]
    EmptySession,

    #[error("Photo {0} has no extracted metadata")]
    MissingMetadata(String),

    #[error("Capture time out of range: {0}")]
    Timestamp(String),

    #[error("Failed to write route track: {0}")]
    Serialization(#[from] gpx::errors::GpxError),

    #[error("Failed to stage route track: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Submit(#[from] CoordinatorError),
}

/// Object key of the track for `route_id`
pub fn track_key(route_id: u32) -> String {
    format!("GPX_{route_id}_{}.gpx", Uuid::new_v4().simple())
}

/// Build a single-segment track through the photos, in commit order
pub fn build_track(route_id: u32, photos: &[Arc<UploadRequest>]) -> Result<Gpx, ExportError> {
    let mut segment = TrackSegment::new();
    for photo in photos {
        let metadata = photo
            .metadata()
            .ok_or_else(|| ExportError::MissingMetadata(photo.file_name()))?;

        let captured = Utc.from_utc_datetime(&metadata.capture_time);
        let time = OffsetDateTime::from_unix_timestamp(captured.timestamp())
            .map_err(|e| ExportError::Timestamp(e.to_string()))?;

        let mut point = Waypoint::new(geo_types::Point::new(metadata.longitude, metadata.latitude));
        point.time = Some(time.into());
        point.name = metadata.identity.clone();
        segment.points.push(point);
    }

    let mut track = Track::new();
    track.name = Some(format!("Route {route_id}"));
    track.segments.push(segment);

    Ok(Gpx {
        version: GpxVersion::Gpx11,
        creator: Some("uploader-service".to_string()),
        tracks: vec![track],
        ..Gpx::default()
    })
}

/// Serialize the session into a track and upload it to the output area.
///
/// On success the exported photos leave the session and the staged file is
/// deleted. On failure the session is left untouched so the export can be
/// retried.
#[instrument(skip(coordinator))]
pub fn export_session(
    coordinator: &UploadCoordinator,
    route_id: u32,
) -> Result<UploadHandle, ExportError> {
    let session = coordinator.session();
    let photos = session.snapshot();
    if photos.is_empty() {
        return Err(ExportError::EmptySession);
    }

    let track = build_track(route_id, &photos)?;
    let mut staged = tempfile::Builder::new()
        .prefix(&format!("GPX{route_id}_"))
        .suffix(".gpx")
        .tempfile()?;
    gpx::write(&track, staged.as_file_mut())?;
    staged.as_file_mut().flush()?;
    let staged = staged.into_temp_path();
    debug!(path = %staged.display(), points = photos.len(), "Route track staged");

    let mut request = UploadRequest::new(staged.to_path_buf());
    // Dropping the temp path deletes the staged file
    let staged = Mutex::new(Some(staged));
    request.on_upload_success(move |_| {
        let removed = session.remove_exported(&photos);
        staged.lock().take();
        info!(route_id, photos = removed, "Route exported");
    });

    let handle = coordinator.submit_export(request, track_key(route_id))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::coordinator::CoordinatorSettings;
    use crate::photo_store::PhotoStore;
    use crate::request::UploadState;
    use crate::spatial_index::SpatialIndex;
    use crate::storage::{output_key, LocalStore, ObjectStore};
    use crate::testing::{photo_file, photo_metadata, FailingStore, FixedExtractor, InMemoryPhotoStore};
    use std::path::Path;

    const STOPS: [(&str, f64, f64); 3] = [
        ("IMG_101.jpg", 51.4545, -2.5879),
        ("IMG_102.jpg", 51.4550, -2.5890),
        ("IMG_103.jpg", 51.4561, -2.5902),
    ];

    async fn committed_session(root: &Path, store: Arc<dyn ObjectStore>) -> UploadCoordinator {
        let mut extractor = FixedExtractor::default();
        for (i, (name, lat, lon)) in STOPS.iter().enumerate() {
            extractor = extractor.with(name, photo_metadata(Some(format!("stop{i}").as_str()), *lat, *lon));
        }
        let photos: Arc<dyn PhotoStore> = Arc::new(InMemoryPhotoStore::default());
        let index = Arc::new(SpatialIndex::new(store.clone()));
        let coordinator = UploadCoordinator::new(
            CoordinatorSettings::default(),
            store,
            photos,
            Arc::new(extractor),
            index,
        );

        // One at a time so commit order matches route order
        for (name, _, _) in STOPS {
            let handle = coordinator
                .submit(UploadRequest::new(photo_file(root, name)))
                .unwrap();
            assert_eq!(handle.wait().await, UploadState::RecordCommitted);
        }
        coordinator
    }

    #[tokio::test]
    async fn test_export_uploads_ordered_track_and_clears_session() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&StorageConfig::local(dir.path().join("root"))).unwrap());
        let coordinator = committed_session(dir.path(), store.clone()).await;
        assert_eq!(coordinator.session().len(), 3);

        let handle = export_session(&coordinator, 7).unwrap();
        assert_eq!(handle.wait().await, UploadState::Exported);
        assert_eq!(coordinator.session().len(), 0);
        assert!(!handle.request().file().exists());

        let key = &handle.request().address().unwrap().key;
        assert!(key.starts_with("GPX_7_"));
        let uploaded = store.get_file(&output_key(key)).await.unwrap().unwrap();

        let track = gpx::read(std::fs::File::open(uploaded).unwrap()).unwrap();
        let points = &track.tracks[0].segments[0].points;
        assert_eq!(points.len(), 3);
        for (point, (_, lat, lon)) in points.iter().zip(STOPS) {
            assert!((point.point().y() - lat).abs() < 1e-9);
            assert!((point.point().x() - lon).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_empty_session_is_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&StorageConfig::local(dir.path())).unwrap());
        let coordinator = UploadCoordinator::new(
            CoordinatorSettings::default(),
            store.clone(),
            Arc::new(InMemoryPhotoStore::default()),
            Arc::new(FixedExtractor::default()),
            Arc::new(SpatialIndex::new(store)),
        );

        assert!(matches!(
            export_session(&coordinator, 1),
            Err(ExportError::EmptySession)
        ));
    }

    #[tokio::test]
    async fn test_failed_export_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let healthy: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&StorageConfig::local(&root)).unwrap());
        let coordinator = committed_session(dir.path(), healthy).await;

        // Same session, exported through a backend that refuses every put
        let broken: Arc<dyn ObjectStore> = Arc::new(FailingStore::wrapping(&root, true, false));
        let exporter = UploadCoordinator::new(
            CoordinatorSettings::default(),
            broken.clone(),
            Arc::new(InMemoryPhotoStore::default()),
            Arc::new(FixedExtractor::default()),
            Arc::new(SpatialIndex::new(broken)),
        );
        for photo in coordinator.session().snapshot() {
            exporter.session().push(photo);
        }

        let handle = export_session(&exporter, 9).unwrap();
        assert_eq!(handle.wait().await, UploadState::UploadFailed);
        assert_eq!(exporter.session().len(), 3);
    }
}
