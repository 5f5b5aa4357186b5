//! Domain Layer - Core market data types and business logic.
//!
//! Pure types with no I/O: instrument symbols and their exchange
//! translations, decoded market events and the storage batches built
//! from them.

/// Canonical symbols, exchanges and the symbol translator.
pub mod symbol;

/// Order-book snapshots, trades and queue keys.
pub mod market_data;

/// Storage batches, columns and table names.
pub mod batch;
