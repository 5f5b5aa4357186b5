//! Durable fallback path for batches the primary store rejects.

pub mod blob;
pub mod parquet;

pub use blob::{LocalDirBlobStore, S3BlobStore, S3Settings};
pub use parquet::{ParquetFallbackWriter, object_key, schema_for, to_record_batch};
