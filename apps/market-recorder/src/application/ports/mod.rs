//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BatchStorePort`: Transactional multi-row insert into the primary store
//! - `FallbackPort`: Durable secondary write path for failed batches
//! - `BlobStorePort`: Object storage used by the fallback writer

mod batch_store_port;
mod blob_store_port;
mod fallback_port;

pub use batch_store_port::{BatchStorePort, StorageError};
pub use blob_store_port::{BlobStoreError, BlobStorePort};
pub use fallback_port::{FallbackError, FallbackPort};
