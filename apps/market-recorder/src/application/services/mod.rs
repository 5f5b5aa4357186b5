//! Application Services
//!
//! - `registry`: Per-(symbol, kind) ingestion queues
//! - `worker`: Size-or-time batch flushing with fallback routing

pub mod registry;
pub mod worker;

pub use registry::{
    EnqueueError, IngestionChannelRegistry, IngestionQueue, OverflowPolicy, PushOutcome,
    QueueDepth, QueueSettings,
};
pub use worker::{
    BatchWorker, FlushOutcome, FlushPolicy, FlushThresholds, WorkerConfig, WorkerPool, WorkerStats,
};
