//! Primary storage adapters.

pub mod postgres;

pub use postgres::{MAX_BIND_PARAMS, PgBatchStore, PgStoreConfig, is_unique_violation};
