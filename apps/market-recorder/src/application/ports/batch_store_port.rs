//! Batch Store Port (Driven Port)
//!
//! Interface for writing one batch of rows into its destination table.

use async_trait::async_trait;

use crate::domain::batch::Batch;

/// Storage error.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A row does not match the batch's column list.
    #[error("row {row} has {actual} values, expected {expected}")]
    RowShape {
        /// Index of the offending row.
        row: usize,
        /// Number of columns.
        expected: usize,
        /// Number of values in the row.
        actual: usize,
    },

    /// Column name is not a safe identifier.
    #[error("invalid column name: {0:?}")]
    InvalidColumn(String),

    /// Error raised by the underlying engine, passed through as-is.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Port for the primary batch store.
///
/// The destination table must already exist; implementations never create it.
#[async_trait]
pub trait BatchStorePort: Send + Sync {
    /// Insert every row of `batch` in one transaction.
    ///
    /// Returns the number of rows written. On error nothing is committed.
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StorageError>;
}
