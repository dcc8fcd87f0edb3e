//! S3-compatible object storage bucket.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use tracing::trace;

use super::{StorageBackend, StorageError};

/// Bucket backed by S3 (or any S3-compatible endpoint the ambient AWS
/// config points at).
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub async fn new(bucket: &str, prefix: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::Transport(format!("put {full_key}: {e:?}")))?;
        trace!(key = %full_key, bytes = data.len(), "s3 upload");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let full_key = self.full_key(key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Transport(format!("get {full_key}: {service:?}"))
                }
            })?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transport(format!("read {full_key}: {e:?}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let full_key = self.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::Transport(format!(
                        "head {full_key}: {service:?}"
                    )))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::Transport(format!("delete {full_key}: {e:?}")))?;
        Ok(())
    }
}
