#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Recorder - Crypto Market Data Ingestion
//!
//! Subscribes to a normalized multi-exchange WebSocket stream, routes
//! order-book snapshots and trades into per-instrument queues and persists
//! them in batches to `PostgreSQL`. Batches the database rejects are written
//! as parquet files to object storage.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market data types
//!   - `symbol`: Canonical symbols and per-exchange translation
//!   - `market_data`: Order-book snapshots, trades, queue keys
//!   - `batch`: Column layouts and rows for one table
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Interfaces for the batch store, fallback and blob storage
//!   - `services`: Ingestion queues and batch workers
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: WebSocket consumer, decoder, backoff and heartbeat
//!   - `storage`: `PostgreSQL` batch store
//!   - `fallback`: Parquet writer with S3 or local directory targets
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                                ┌─ queue orderbook/BTC_USDT ─► worker ─┐
//! Upstream WS ─► Consumer ─► Registry                                    ├─► PostgreSQL
//!                                └─ queue trade/BTC_USDT ────► worker ─┘        │ on error
//!                                                                               ▼
//!                                                                     Parquet ─► S3 / dir
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::batch::{Batch, BatchBuilder, Column, ColumnType, TableName, Value};
pub use domain::market_data::{
    EventKind, MarketEvent, OrderBookSnapshot, PriceLevel, QueueKey, Side, Trade,
};
pub use domain::symbol::{CanonicalSymbol, Exchange, SymbolError, SymbolTranslator};

// Ports
pub use application::ports::{
    BatchStorePort, BlobStoreError, BlobStorePort, FallbackError, FallbackPort, StorageError,
};

// Services
pub use application::services::{
    BatchWorker, FlushOutcome, FlushPolicy, FlushThresholds, IngestionChannelRegistry,
    OverflowPolicy, QueueSettings, WorkerConfig, WorkerPool, WorkerStats,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, FallbackTarget, RecorderConfig};

// Adapters
pub use infrastructure::fallback::{LocalDirBlobStore, ParquetFallbackWriter, S3BlobStore};
pub use infrastructure::storage::{PgBatchStore, PgStoreConfig};
pub use infrastructure::upstream::{
    ConnectionState, ConsumerConfig, ConsumerStatus, StreamConsumer, StreamDecoder,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    LogFormat, TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
