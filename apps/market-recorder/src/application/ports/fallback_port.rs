//! Fallback Port (Driven Port)
//!
//! Interface for the durable secondary write path taken when the primary
//! store rejects a batch.

use async_trait::async_trait;

use super::BlobStoreError;
use crate::domain::batch::Batch;

/// Fallback write error.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    /// Columnar encoding failed.
    #[error("failed to encode batch: {0}")]
    Encode(String),

    /// Local spool file could not be written or removed.
    #[error("spool file {path}: {source}")]
    Spool {
        /// Spool file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Upload failed; the spool file is kept.
    #[error("upload of {key} failed, local copy kept at {path}: {source}")]
    Upload {
        /// Object key that was attempted.
        key: String,
        /// Retained local file.
        path: String,
        /// Underlying store error.
        #[source]
        source: BlobStoreError,
    },

    /// Blocking encoder task panicked or was cancelled.
    #[error("encoder task failed: {0}")]
    Task(String),
}

/// Port for the durable fallback writer.
#[async_trait]
pub trait FallbackPort: Send + Sync {
    /// Persist `batch` outside the primary store.
    ///
    /// Returns the object key the batch was written under. Errors are
    /// terminal for the batch; callers only log them.
    async fn write(&self, batch: &Batch) -> Result<String, FallbackError>;
}
