//! Blob store adapter for per-run artifacts.
//!
//! Artifacts are opaque binary objects keyed by `<run-id>/<name>` paths.
//! The production deployment points at an S3-compatible store (MinIO in
//! cluster); tests and local runs use the in-memory backend.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob not found")]
    NotFound,
    #[error("blob store error: {0}")]
    Backend(String),
}

impl BlobStoreError {
    /// Discriminator for not-found errors, so callers never match on
    /// backend-specific error text.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<object_store::Error> for BlobStoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound,
            other => Self::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;

/// Byte stream handed to HTTP responses when serving a blob.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Capability interface over blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream a blob's contents. `NotFound` when the path has never been
    /// written (or has been deleted).
    async fn get(&self, path: &str) -> Result<ByteStream>;

    /// Store a blob, replacing any previous contents at the path.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Remove a blob. Deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Blob store backed by the `object_store` crate.
#[derive(Debug)]
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectBlobStore {
    /// Use an S3-compatible endpoint (MinIO in the cluster deployment).
    pub fn s3_compatible(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_bucket_name(bucket)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .with_region("us-east-1")
            .with_allow_http(true)
            .build()
            .map_err(|e| BlobStoreError::Backend(e.to_string()))?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Keep blobs in process memory. Used by tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn get(&self, path: &str) -> Result<ByteStream> {
        let result = self.store.get(&ObjectPath::from(path)).await?;
        let stream = result
            .into_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Ok(stream)
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&ObjectPath::from(path), PutPayload::from(data))
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }
}
