use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the uploader service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Upload pipeline configuration
    #[serde(default)]
    pub uploader: UploaderConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which object store backs the photo container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Directory tree on the local filesystem
    Local,
    /// S3 (or an S3-compatible store such as MinIO)
    S3,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: StorageType,
    /// Container (bucket) holding every photo object
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the local backend
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Where remote objects are materialized by `get_file`
    #[serde(default = "std::env::temp_dir")]
    pub download_dir: PathBuf,
    /// Key of the serialized spatial index inside the container
    #[serde(default = "default_index_key")]
    pub index_key: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploaderConfig {
    /// Number of pool workers shared by upload, commit and removal jobs
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of queued jobs before submissions are refused
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight requests
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// File name marker of photos that must carry an embedded identity
    #[serde(default = "default_externally_tagged_marker")]
    pub externally_tagged_marker: String,
}

// Default value functions
fn default_service_name() -> String {
    "uploader-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_storage_type() -> StorageType {
    StorageType::Local
}

fn default_bucket() -> String {
    "bristol-streetview-photos".to_string()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_index_key() -> String {
    "rtree.tree".to_string()
}

fn default_region() -> String {
    "eu-west-2".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_externally_tagged_marker() -> String {
    "_E".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "uploader-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(
                config::File::with_name("config/uploader")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/streetview/uploader")
                    .required(false)
            )
            // Override with environment variables
            // UPLOADER__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("UPLOADER")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.uploader.shutdown_grace_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            externally_tagged_marker: default_externally_tagged_marker(),
        }
    }
}

impl StorageConfig {
    /// Local-backend configuration rooted at `root_dir`
    pub fn local(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_type: StorageType::Local,
            bucket: default_bucket(),
            root_dir: root_dir.into(),
            download_dir: std::env::temp_dir(),
            index_key: default_index_key(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}
