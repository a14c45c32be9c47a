// pgbasebackup-s3/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use tracing::{debug, instrument, warn};

use super::{MTIME_METADATA_KEY, MULTIPART_THRESHOLD, ObjectStore};
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};

/// Part size for multipart uploads (S3 rejects parts under 5 MiB except the last one).
const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3-compatible storage (AWS S3, DigitalOcean Spaces, MinIO).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Storage {
    pub async fn new(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.force_path_style)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: spaces_config.bucket_name.clone(),
            prefix: spaces_config.folder_prefix.clone(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    async fn put_single(&self, key: &str, data: Bytes, mtime: i64) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(MTIME_METADATA_KEY, mtime.to_string())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("put_object {} failed: {}", key, e)))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, data: Bytes, mtime: i64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .metadata(MTIME_METADATA_KEY, mtime.to_string())
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("create_multipart_upload {} failed: {}", key, e)))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| AppError::Storage(format!("no upload id returned for {}", key)))?
            .to_string();
        debug!(key, upload_id = %upload_id, size = data.len(), "Started multipart upload");

        match self.upload_parts(key, &upload_id, data).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        AppError::Storage(format!("complete_multipart_upload {} failed: {}", key, e))
                    })?;
                Ok(())
            }
            Err(e) => {
                // Incomplete uploads keep billing storage until aborted.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, data: Bytes) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1;

        while offset < data.len() {
            let end = std::cmp::min(offset + MULTIPART_PART_SIZE, data.len());
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.slice(offset..end)))
                .send()
                .await
                .map_err(|e| {
                    AppError::Storage(format!("upload_part {} of {} failed: {}", part_number, key, e))
                })?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(String::from))
                    .build(),
            );
            offset = end;
            part_number += 1;
        }

        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    #[instrument(skip(self, value), fields(bucket = %self.bucket))]
    async fn put_string(&self, key: &str, value: &str) -> Result<()> {
        let key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(value.as_bytes().to_vec()))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("put_object {} failed: {}", key, e)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn put(&self, key: &str, source: &Path, mtime: i64) -> Result<()> {
        let key = self.object_key(key);
        let data = Bytes::from(tokio::fs::read(source).await?);
        debug!(key = %key, size = data.len(), "Uploading object");

        if data.len() as u64 > MULTIPART_THRESHOLD {
            self.put_multipart(&key, data, mtime).await
        } else {
            self.put_single(&key, data, mtime).await
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_string(&self, key: &str) -> Result<String> {
        let key = self.object_key(key);
        let object = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(object) => object,
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    return Err(AppError::NotFound(key));
                }
                return Err(AppError::Storage(format!("get_object {} failed: {}", key, e)));
            }
        };

        let body = object
            .body
            .collect()
            .await
            .map_err(|e| AppError::Storage(format!("reading body of {} failed: {}", key, e)))?;
        Ok(String::from_utf8(body.into_bytes().to_vec())?)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.object_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("delete_object {} failed: {}", key, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaces(prefix: Option<&str>) -> SpacesConfig {
        SpacesConfig {
            endpoint_url: "http://127.0.0.1:9000".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "minio".to_string(),
            secret_access_key: "minio123".to_string(),
            bucket_name: "backups".to_string(),
            folder_prefix: prefix.map(String::from),
            force_path_style: true,
        }
    }

    #[tokio::test]
    async fn test_object_key_applies_folder_prefix() {
        let storage = S3Storage::new(&spaces(Some("pg/"))).await;
        assert_eq!(storage.object_key("LATEST"), "pg/LATEST");
        assert_eq!(storage.object_key("nightly/"), "pg/nightly/");

        let storage = S3Storage::new(&spaces(None)).await;
        assert_eq!(storage.object_key("successful/nightly"), "successful/nightly");
    }
}
