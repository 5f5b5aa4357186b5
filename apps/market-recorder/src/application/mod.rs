//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for storage, fallback and object storage.
pub mod ports;

/// Ingestion queues and batch persistence workers.
pub mod services;
