use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageCacheRepositoryError {
    #[error("io error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("cache entry {0} is corrupted")]
    Corrupted(String),
}

/// Cache key of a remote resource, stable across runs.
pub fn key_for_url(url: &str) -> String {
    hex::encode(Sha256::digest(url.trim().as_bytes()))
}

#[async_trait]
pub trait ImageCacheRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ImageCacheRepositoryError>;

    /// Publish `data` under `key`, returning the path of the stored file.
    async fn set(&self, key: &str, data: &[u8]) -> Result<PathBuf, ImageCacheRepositoryError>;

    async fn remove(&self, key: &str) -> Result<(), ImageCacheRepositoryError>;

    /// Path of a cached entry, counted as an access.
    async fn image_path(&self, key: &str) -> Result<Option<PathBuf>, ImageCacheRepositoryError>;

    fn current_size(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
