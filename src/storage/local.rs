//! Local filesystem bucket for development and tests.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

use super::{StorageBackend, StorageError};

/// Filesystem-backed bucket rooted at a base directory.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Resolve a key under the base path.
    ///
    /// Keys are validated lexically before touching the filesystem:
    /// absolute paths and any `..` component are rejected so no key can
    /// resolve outside the bucket root.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let relative = Path::new(key);
        if relative.is_absolute() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        trace!(key, bytes = data.len(), "local upload");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
