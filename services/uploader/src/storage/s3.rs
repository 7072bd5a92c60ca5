use super::{validate_key, ObjectStore, StorageError, OUTPUT_PREFIX};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// S3 allows at most this many keys per DeleteObjects call
const DELETE_BATCH: usize = 1000;

/// S3-backed object store
pub struct S3Store {
    client: S3Client,
    bucket: String,
    config: StorageConfig,
}

impl S3Store {
    /// Create a new S3 store
    pub async fn new(config: &StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    /// Multipart upload for large files, reporting bytes after every part
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: &str,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(backend_error)?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Backend("No upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut sent = 0u64;

        for chunk in data.chunks(self.config.part_size_bytes.max(1)) {
            let part = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await;

            let part = match part {
                Ok(part) => part,
                Err(e) => {
                    // Don't leave an incomplete upload accruing storage
                    if let Err(abort) = self
                        .client
                        .abort_multipart_upload()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .send()
                        .await
                    {
                        warn!(
                            bucket = %bucket,
                            key = %key,
                            upload_id = %upload_id,
                            error = %abort,
                            "Failed to abort multipart upload"
                        );
                    }
                    return Err(backend_error(e));
                }
            };

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(part.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            sent += chunk.len() as u64;
            progress(sent);
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    /// Every key in `bucket` starting with `prefix`
    async fn list_keys(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(String::from))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(backend_error)?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn delete_keys(&self, bucket: &str, keys: Vec<String>) -> Result<usize, StorageError> {
        let total = keys.len();

        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            let response = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(backend_error)?;

            if let Some(error) = response.errors().first() {
                return Err(StorageError::Backend(format!(
                    "Failed to delete {}: {}",
                    error.key().unwrap_or("<unknown>"),
                    error.message().unwrap_or("no message")
                )));
            }
        }

        Ok(total)
    }

    /// Fetch an object's bytes, `None` if the key does not exist
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match response {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(backend_error(e));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .into_bytes();

        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn container(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, source, progress), fields(bucket = %container, key = %key))]
    async fn put_file(
        &self,
        container: &str,
        key: &str,
        source: &Path,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, StorageError> {
        validate_key(key)?;
        let data = tokio::fs::read(source).await?;
        let size = data.len() as u64;
        let content_type = get_content_type(key);

        debug!(size_bytes = size, "Uploading object to S3");

        if data.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(container, key, &data, content_type, progress)
                .await?;
        } else {
            self.simple_upload(container, key, data, content_type).await?;
            progress(size);
        }

        info!(size_bytes = size, "Object uploaded successfully");
        Ok(size)
    }

    #[instrument(skip(self), fields(bucket = %container, key = %key))]
    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await
            .map_err(backend_error)?;

        debug!("Object deleted from S3");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %container))]
    async fn delete_all(&self, container: &str) -> Result<usize, StorageError> {
        let keys = self.list_keys(container, None).await?;
        let removed = self.delete_keys(container, keys).await?;
        info!(removed, "Bucket emptied");
        Ok(removed)
    }

    async fn get_file(&self, key: &str) -> Result<Option<PathBuf>, StorageError> {
        validate_key(key)?;
        let Some(bytes) = self.fetch(key).await? else {
            return Ok(None);
        };

        let path = self.config.download_dir.join(&self.bucket).join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        Ok(Some(path))
    }

    async fn clear_output(&self) -> Result<usize, StorageError> {
        let keys = self.list_keys(&self.bucket, Some(OUTPUT_PREFIX)).await?;
        self.delete_keys(&self.bucket, keys).await
    }

    async fn load_index_blob(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.fetch(&self.config.index_key).await
    }

    async fn save_index_blob(&self, blob: &[u8]) -> Result<(), StorageError> {
        self.simple_upload(
            &self.bucket,
            &self.config.index_key,
            blob.to_vec(),
            "application/json",
        )
        .await
    }
}

fn backend_error<E>(err: E) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::Backend(aws_sdk_s3::error::DisplayErrorContext(err).to_string())
}

/// Get content type from the key's extension
fn get_content_type(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("heic") => "image/heic",
        Some("gpx") => "application/gpx+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_content_type() {
        assert_eq!(get_content_type("abc-IMG_001.jpg"), "image/jpeg");
        assert_eq!(get_content_type("abc-IMG_001.JPEG"), "image/jpeg");
        assert_eq!(get_content_type("output/GPX_7_ab.gpx"), "application/gpx+xml");
        assert_eq!(get_content_type("rtree.tree"), "application/octet-stream");
        assert_eq!(get_content_type("no-extension"), "application/octet-stream");
    }
}
