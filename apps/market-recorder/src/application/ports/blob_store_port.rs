//! Blob Store Port (Driven Port)
//!
//! Interface for the object storage that receives fallback files.

use async_trait::async_trait;
use bytes::Bytes;

/// Object storage error.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// Object key is empty or escapes the store root.
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote store rejected the request.
    #[error("object store request failed: {0}")]
    Remote(String),
}

/// Port for object storage.
#[async_trait]
pub trait BlobStorePort: Send + Sync {
    /// Store `body` under `key`, replacing any existing object.
    async fn put(&self, key: &str, body: Bytes) -> Result<(), BlobStoreError>;

    /// Human-readable location of the store, for logs.
    fn location(&self) -> String;
}
