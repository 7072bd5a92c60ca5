//! Photo metadata extraction.
//!
//! The pipeline only needs a handful of attributes from each photo: the
//! embedded unique identity (if the camera wrote one), pixel dimensions,
//! capture time, GPS position and the body serial number. [`ExifExtractor`]
//! reads them with `kamadak-exif`; anything else implementing
//! [`MetadataExtractor`] can be plugged into the coordinator.

use chrono::NaiveDateTime;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while reading photo metadata
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to read photo: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unreadable metadata: {0}")]
    UnreadableMetadata(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Attributes extracted from a photo
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoMetadata {
    /// Identity embedded by the capture device, if any
    pub identity: Option<String>,
    /// Pixel height
    pub height: u32,
    /// Pixel width
    pub width: u32,
    /// Capture time as written by the camera (no zone information)
    pub capture_time: NaiveDateTime,
    /// Latitude in decimal degrees, south negative
    pub latitude: f64,
    /// Longitude in decimal degrees, west negative
    pub longitude: f64,
    /// Camera body serial number
    pub device_serial: Option<String>,
}

impl PhotoMetadata {
    /// Refuse positions that cannot be indexed or persisted
    pub fn check_position(&self) -> Result<(), ExtractionError> {
        if valid_position(self.latitude, self.longitude) {
            return Ok(());
        }
        Err(ExtractionError::UnreadableMetadata(format!(
            "GPS position ({}, {}) out of range",
            self.latitude, self.longitude
        )))
    }
}

/// Finite latitude within ±90° and longitude within ±180°
pub fn valid_position(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Reads identity and geotemporal attributes from a photo file
#[cfg_attr(test, mockall::automock)]
pub trait MetadataExtractor: Send + Sync {
    /// Extract metadata from the file at `path`
    fn extract(&self, path: &Path) -> Result<PhotoMetadata, ExtractionError>;
}

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// EXIF-backed extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifExtractor;

impl MetadataExtractor for ExifExtractor {
    fn extract(&self, path: &Path) -> Result<PhotoMetadata, ExtractionError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let exif_data = exif::Reader::new()
            .read_from_container(&mut reader)
            .map_err(|e| match e {
                exif::Error::Io(io) => ExtractionError::Io(io),
                exif::Error::InvalidFormat(msg) | exif::Error::NotSupported(msg) => {
                    ExtractionError::UnsupportedFormat(msg.to_string())
                }
                other => ExtractionError::UnreadableMetadata(other.to_string()),
            })?;

        let get_str = |tag: exif::Tag| -> Option<String> {
            exif_data
                .get_field(tag, exif::In::PRIMARY)
                .and_then(|f| match f.value {
                    exif::Value::Ascii(ref v) if !v.is_empty() => {
                        let s = String::from_utf8_lossy(&v[0]).trim().to_string();
                        (!s.is_empty()).then_some(s)
                    }
                    _ => None,
                })
        };

        let get_u32 = |tag: exif::Tag| -> Option<u32> {
            exif_data
                .get_field(tag, exif::In::PRIMARY)
                .and_then(|f| f.value.get_uint(0))
        };

        let width = get_u32(exif::Tag::PixelXDimension)
            .or_else(|| get_u32(exif::Tag::ImageWidth))
            .ok_or_else(|| ExtractionError::UnreadableMetadata("missing image width".into()))?;
        let height = get_u32(exif::Tag::PixelYDimension)
            .or_else(|| get_u32(exif::Tag::ImageLength))
            .ok_or_else(|| ExtractionError::UnreadableMetadata("missing image height".into()))?;

        let capture_time = get_str(exif::Tag::DateTimeOriginal)
            .or_else(|| get_str(exif::Tag::DateTime))
            .ok_or_else(|| ExtractionError::UnreadableMetadata("missing capture time".into()))
            .and_then(|s| parse_exif_datetime(&s))?;

        let (latitude, longitude) = parse_exif_gps(&exif_data)
            .ok_or_else(|| ExtractionError::UnreadableMetadata("missing GPS position".into()))?;

        let metadata = PhotoMetadata {
            identity: get_str(exif::Tag::ImageUniqueID),
            height,
            width,
            capture_time,
            latitude,
            longitude,
            device_serial: get_str(exif::Tag::BodySerialNumber),
        };
        metadata.check_position()?;

        debug!(
            path = %path.display(),
            identity = ?metadata.identity,
            latitude = metadata.latitude,
            longitude = metadata.longitude,
            "Extracted photo metadata"
        );

        Ok(metadata)
    }
}

fn parse_exif_datetime(value: &str) -> Result<NaiveDateTime, ExtractionError> {
    NaiveDateTime::parse_from_str(value, EXIF_DATE_FORMAT)
        .map_err(|e| ExtractionError::UnreadableMetadata(format!("bad capture time {value:?}: {e}")))
}

/// Parse GPS latitude/longitude, applying the hemisphere references
fn parse_exif_gps(exif_data: &exif::Exif) -> Option<(f64, f64)> {
    let lat = exif_data.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY)?;
    let lon = exif_data.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY)?;
    let lat_ref = exif_data.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY);
    let lon_ref = exif_data.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY);

    let mut latitude = dms_to_degrees(&lat.value)?;
    let mut longitude = dms_to_degrees(&lon.value)?;

    if lat_ref.is_some_and(|r| r.display_value().to_string().contains('S')) {
        latitude = -latitude;
    }
    if lon_ref.is_some_and(|r| r.display_value().to_string().contains('W')) {
        longitude = -longitude;
    }

    Some((latitude, longitude))
}

fn dms_to_degrees(value: &exif::Value) -> Option<f64> {
    match value {
        exif::Value::Rational(v) if v.len() >= 3 => {
            // A zero denominator would turn the position into NaN or infinity
            if v[..3].iter().any(|r| r.denom == 0) {
                return None;
            }
            let degrees = v[0].to_f64() + v[1].to_f64() / 60.0 + v[2].to_f64() / 3600.0;
            degrees.is_finite().then_some(degrees)
        }
        _ => None,
    }
}
