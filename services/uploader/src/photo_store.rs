use crate::config::DatabaseConfig;
use crate::request::ObjectAddress;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Format/version tag written with every record produced by this service
pub const RECORD_VERSION: i32 = 1;

/// Errors raised by the photo metadata store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("No photos match {0}")]
    NoMatch(String),
}

/// One committed photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PhotoRecord {
    /// Globally unique photo identity
    pub identity: String,
    /// Pixel height
    pub height: i32,
    /// Pixel width
    pub width: i32,
    /// When the photo was taken
    pub capture_time: NaiveDateTime,
    /// When the photo was uploaded
    pub upload_time: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    /// Camera body serial number
    pub device_serial: Option<String>,
    /// Record format/version tag
    pub version: i32,
    /// Container holding the bytes
    pub container: String,
    /// Object key inside the container
    pub object_key: String,
}

impl PhotoRecord {
    pub fn address(&self) -> ObjectAddress {
        ObjectAddress {
            container: self.container.clone(),
            key: self.object_key.clone(),
        }
    }
}

/// Relational store of photo records.
///
/// Every query fails with [`StoreError::NoMatch`] rather than returning an
/// empty result.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Insert a record, returning rows affected (success iff exactly 1)
    async fn insert(&self, record: &PhotoRecord) -> Result<u64, StoreError>;

    /// Delete every record
    async fn delete_all(&self) -> Result<u64, StoreError>;

    /// Container/key of the photo with `identity`
    async fn get_path(&self, identity: &str) -> Result<ObjectAddress, StoreError>;

    /// Identities of photos taken at exactly this coordinate
    async fn photos_taken_at(&self, latitude: f64, longitude: f64)
        -> Result<Vec<String>, StoreError>;

    /// Identities of photos taken at exactly this time
    async fn photos_taken_on(&self, time: NaiveDateTime) -> Result<Vec<String>, StoreError>;

    /// Identities of photos uploaded at exactly this time
    async fn photos_uploaded_on(&self, time: NaiveDateTime) -> Result<Vec<String>, StoreError>;

    /// Identities of photos taken within `[start, end]`
    async fn photos_taken_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<String>, StoreError>;

    /// Identities of photos uploaded within `[start, end]`
    async fn photos_uploaded_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<String>, StoreError>;
}

/// PostgreSQL-backed photo store
pub struct PgPhotoStore {
    pool: PgPool,
}

impl PgPhotoStore {
    /// Create a new photo store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    async fn identities(
        &self,
        sql: &str,
        binds: Binds,
        description: String,
    ) -> Result<Vec<String>, StoreError> {
        let mut query = sqlx::query_scalar::<_, String>(sql);
        query = match binds {
            Binds::Coordinate(latitude, longitude) => query.bind(latitude).bind(longitude),
            Binds::Instant(time) => query.bind(time),
            Binds::Window(start, end) => query.bind(start).bind(end),
        };

        let ids = query.fetch_all(&self.pool).await?;
        non_empty(ids, description)
    }
}

enum Binds {
    Coordinate(f64, f64),
    Instant(NaiveDateTime),
    Window(NaiveDateTime, NaiveDateTime),
}

fn non_empty(ids: Vec<String>, description: String) -> Result<Vec<String>, StoreError> {
    if ids.is_empty() {
        return Err(StoreError::NoMatch(description));
    }
    Ok(ids)
}

#[async_trait]
impl PhotoStore for PgPhotoStore {
    #[instrument(skip(self, record), fields(identity = %record.identity, key = %record.object_key))]
    async fn insert(&self, record: &PhotoRecord) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO photos (
                identity, height, width, capture_time, upload_time,
                latitude, longitude, device_serial, version,
                container, object_key
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9,
                $10, $11
            )
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&record.identity)
        .bind(record.height)
        .bind(record.width)
        .bind(record.capture_time)
        .bind(record.upload_time)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(&record.device_serial)
        .bind(record.version)
        .bind(&record.container)
        .bind(&record.object_key)
        .execute(&self.pool)
        .await?;

        debug!(rows = result.rows_affected(), "Photo record inserted");

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM photos")
            .execute(&self.pool)
            .await?;

        info!(deleted_count = result.rows_affected(), "Deleted all photo records");

        Ok(result.rows_affected())
    }

    async fn get_path(&self, identity: &str) -> Result<ObjectAddress, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT container, object_key FROM photos WHERE identity = $1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(container, key)| ObjectAddress { container, key })
            .ok_or_else(|| StoreError::NoMatch(format!("identity {identity}")))
    }

    async fn photos_taken_at(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.identities(
            "SELECT identity FROM photos WHERE latitude = $1 AND longitude = $2",
            Binds::Coordinate(latitude, longitude),
            format!("coordinate ({latitude}, {longitude})"),
        )
        .await
    }

    async fn photos_taken_on(&self, time: NaiveDateTime) -> Result<Vec<String>, StoreError> {
        self.identities(
            "SELECT identity FROM photos WHERE capture_time = $1",
            Binds::Instant(time),
            format!("capture time {time}"),
        )
        .await
    }

    async fn photos_uploaded_on(&self, time: NaiveDateTime) -> Result<Vec<String>, StoreError> {
        self.identities(
            "SELECT identity FROM photos WHERE upload_time = $1",
            Binds::Instant(time),
            format!("upload time {time}"),
        )
        .await
    }

    async fn photos_taken_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<String>, StoreError> {
        self.identities(
            "SELECT identity FROM photos WHERE capture_time BETWEEN $1 AND $2 ORDER BY capture_time",
            Binds::Window(start, end),
            format!("capture window {start}..{end}"),
        )
        .await
    }

    async fn photos_uploaded_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<String>, StoreError> {
        self.identities(
            "SELECT identity FROM photos WHERE upload_time BETWEEN $1 AND $2 ORDER BY upload_time",
            Binds::Window(start, end),
            format!("upload window {start}..{end}"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_result_is_no_match() {
        let result = non_empty(Vec::new(), "capture time 2017-08-03 13:45:00".to_string());
        match result {
            Err(StoreError::NoMatch(what)) => assert!(what.contains("2017-08-03")),
            other => panic!("Expected NoMatch, got {:?}", other),
        }

        let ids = non_empty(vec!["1234567".to_string()], String::new()).unwrap();
        assert_eq!(ids, vec!["1234567"]);
    }

    #[test]
    fn test_record_address() {
        let record = PhotoRecord {
            identity: "1234570".to_string(),
            height: 1003,
            width: 999,
            capture_time: NaiveDateTime::default(),
            upload_time: NaiveDateTime::default(),
            latitude: 12.5323,
            longitude: 45.56,
            device_serial: Some("12345567".to_string()),
            version: RECORD_VERSION,
            container: "test-bucket".to_string(),
            object_key: "test-key-3".to_string(),
        };

        let address = record.address();
        assert_eq!(address.container, "test-bucket");
        assert_eq!(address.key, "test-key-3");
    }
}
