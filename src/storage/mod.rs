//! Object storage for document artifacts.
//!
//! Two independent namespaces: the PHI bucket holds raw uploads under
//! short retention and strict access, the clean bucket holds masked
//! artifacts. The separation is structural (independent settings, so
//! independent credentials and namespaces); no in-process check can
//! substitute for it.

mod local;
mod s3;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{BucketSettings, Settings, StorageKind};

pub use local::LocalStorage;
pub use s3::S3Storage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),

    /// Key rejected before any filesystem or network access.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage transport error: {0}")]
    Transport(String),

    #[error("storage misconfigured: {0}")]
    Config(String),
}

/// Capability set every bucket implementation provides.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str)
        -> Result<(), StorageError>;
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Build a backend from one bucket's settings.
pub async fn backend_for(
    settings: &BucketSettings,
) -> Result<Box<dyn StorageBackend>, StorageError> {
    match settings.kind {
        StorageKind::Local => Ok(Box::new(LocalStorage::new(&settings.path)?)),
        StorageKind::S3 => {
            if settings.bucket.is_empty() {
                return Err(StorageError::Config(
                    "s3 storage requires a bucket name".to_string(),
                ));
            }
            Ok(Box::new(
                S3Storage::new(&settings.bucket, &settings.prefix).await,
            ))
        }
    }
}

/// The PHI/clean bucket pair used by the job runner.
pub struct BucketPair {
    pub phi: Box<dyn StorageBackend>,
    pub clean: Box<dyn StorageBackend>,
}

impl BucketPair {
    pub async fn from_settings(settings: &Settings) -> Result<Self, StorageError> {
        Ok(Self {
            phi: backend_for(&settings.phi_bucket).await?,
            clean: backend_for(&settings.clean_bucket).await?,
        })
    }
}

/// Retryability for the job runner: network and server-side failures
/// may heal, missing inputs and bad keys never do.
impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transport(_) | StorageError::Io(_))
    }
}
