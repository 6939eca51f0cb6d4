#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
#[cfg(feature = "s3")]
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("unsupported blob_store root: {0}")]
    UnsupportedRoot(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The blob-store contract: an object store addressed by `/`-separated string
/// keys with prefix-scoped list and delete.
///
/// Index artifacts live under `{IndexBuildID}/{Version}/...`; the recycle
/// loop only ever deletes by prefix.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError>;

    async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;

    /// Deleting an empty prefix is success.
    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), BlobStoreError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), BlobStoreError> {
    if key.trim().is_empty() || key.starts_with('/') || key.contains("..") || key.contains('\\') {
        return Err(BlobStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Opens a blob store from a root:
///
/// - `s3://bucket/prefix` — requires feature "s3" (MinIO via the `VIX_MINIO_*`
///   environment).
/// - anything else — a filesystem directory.
pub async fn open_from_root(root: &str) -> Result<Arc<dyn BlobStore>, BlobStoreError> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return Err(BlobStoreError::UnsupportedRoot(root.to_string()));
    }

    if let Some(rest) = trimmed.strip_prefix("s3://") {
        #[cfg(feature = "s3")]
        {
            return Ok(Arc::new(s3::S3BlobStore::from_env_url(rest).await?));
        }
        #[cfg(not(feature = "s3"))]
        {
            let _ = rest;
            return Err(BlobStoreError::UnsupportedRoot(format!(
                "s3://... requires feature 's3' (got {root:?})"
            )));
        }
    }

    Ok(Arc::new(fs::FsBlobStore::new(trimmed)))
}
