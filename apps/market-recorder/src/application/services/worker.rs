//! Batch Persistence Worker
//!
//! One task per ingestion queue. Each cycle it checks the queue against the
//! kind's [`FlushPolicy`], drains at most one threshold's worth of events,
//! and writes them as a single batch. A batch the store rejects is handed
//! to the fallback writer unchanged; it is never requeued.
//!
//! On shutdown the worker keeps flushing until its queue is empty, then
//! returns its [`WorkerStats`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::{IngestionChannelRegistry, IngestionQueue};
use crate::application::ports::{BatchStorePort, FallbackPort};
use crate::domain::batch::{BatchBuilder, InvalidTableName};
use crate::domain::market_data::EventKind;
use crate::infrastructure::metrics;

// =============================================================================
// Flush Policy
// =============================================================================

/// Size-or-time flush trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Queue length that triggers a flush; also the maximum batch size.
    pub size_threshold: usize,
    /// Age of the last flush after which any queued events are flushed.
    pub time_threshold: Duration,
}

impl FlushPolicy {
    /// Create a policy. A zero size threshold is raised to one.
    #[must_use]
    pub fn new(size_threshold: usize, time_threshold: Duration) -> Self {
        Self {
            size_threshold: size_threshold.max(1),
            time_threshold,
        }
    }

    /// Whether a queue of `queue_size` should be flushed now.
    #[must_use]
    pub const fn should_flush(&self, queue_size: usize, since_last_flush: Duration) -> bool {
        queue_size >= self.size_threshold
            || (since_last_flush.as_nanos() > self.time_threshold.as_nanos() && queue_size > 0)
    }
}

/// Per-kind flush policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushThresholds {
    /// Order-book queues.
    pub orderbook: FlushPolicy,
    /// Trade queues.
    pub trade: FlushPolicy,
}

impl Default for FlushThresholds {
    fn default() -> Self {
        Self {
            orderbook: FlushPolicy::new(20_000, Duration::from_secs(30)),
            trade: FlushPolicy::new(10_000, Duration::from_secs(30)),
        }
    }
}

impl FlushThresholds {
    /// Policy for an event kind.
    #[must_use]
    pub const fn for_kind(&self, kind: EventKind) -> FlushPolicy {
        match kind {
            EventKind::OrderBook => self.orderbook,
            EventKind::Trade => self.trade,
        }
    }
}

/// Settings shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Per-kind flush policies.
    pub thresholds: FlushThresholds,
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Order-book levels per side.
    pub book_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thresholds: FlushThresholds::default(),
            poll_interval: Duration::from_millis(100),
            book_depth: 15,
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Result of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Empty,
    /// Rows written to the primary store.
    Stored(usize),
    /// Store failed; rows written to the fallback under this key.
    Fallback {
        /// Rows in the batch.
        rows: usize,
        /// Fallback object key.
        key: String,
    },
    /// Store and fallback both failed.
    Lost(usize),
}

/// Counters reported when a worker exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Batches written to the primary store.
    pub batches_stored: u64,
    /// Rows written to the primary store.
    pub rows_stored: u64,
    /// Batches routed to the fallback writer.
    pub batches_fallback: u64,
    /// Batches lost after a fallback failure.
    pub batches_lost: u64,
}

/// Drains one queue into the batch store.
pub struct BatchWorker {
    queue: Arc<IngestionQueue>,
    builder: BatchBuilder,
    policy: FlushPolicy,
    poll_interval: Duration,
    store: Arc<dyn BatchStorePort>,
    fallback: Arc<dyn FallbackPort>,
    cancel: CancellationToken,
    last_flush: Instant,
    stats: WorkerStats,
}

impl BatchWorker {
    /// Create a worker for `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTableName`] if the queue's symbol cannot name a table.
    pub fn new(
        queue: Arc<IngestionQueue>,
        config: &WorkerConfig,
        store: Arc<dyn BatchStorePort>,
        fallback: Arc<dyn FallbackPort>,
        cancel: CancellationToken,
    ) -> Result<Self, InvalidTableName> {
        let key = queue.key().clone();
        let builder = BatchBuilder::new(key.kind, key.symbol, config.book_depth)?;
        Ok(Self {
            policy: config.thresholds.for_kind(key.kind),
            queue,
            builder,
            poll_interval: config.poll_interval,
            store,
            fallback,
            cancel,
            last_flush: Instant::now(),
            stats: WorkerStats::default(),
        })
    }

    /// Run until cancelled, then drain the queue and return.
    pub async fn run(mut self) -> WorkerStats {
        tracing::debug!(
            queue = %self.queue.key(),
            table = %self.builder.table(),
            size_threshold = self.policy.size_threshold,
            time_threshold_secs = self.policy.time_threshold.as_secs(),
            "Batch worker started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let queue_size = self.queue.len();
            if self
                .policy
                .should_flush(queue_size, self.last_flush.elapsed())
            {
                self.flush(queue_size.min(self.policy.size_threshold)).await;
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        let remaining = self.queue.len();
        if remaining > 0 {
            tracing::info!(
                queue = %self.queue.key(),
                remaining,
                "Draining queue before shutdown"
            );
        }
        while !self.queue.is_empty() {
            self.flush(self.policy.size_threshold).await;
        }

        tracing::debug!(queue = %self.queue.key(), stats = ?self.stats, "Batch worker stopped");
        self.stats
    }

    /// Drain up to `max` events and persist them as one batch.
    pub async fn flush(&mut self, max: usize) -> FlushOutcome {
        let events = self.queue.drain(max);
        let kind = self.queue.key().kind;
        metrics::set_queue_depth(self.queue.key(), self.queue.len());
        if events.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch = self.builder.build(events);
        let rows = batch.len();
        let started = Instant::now();

        let outcome = match self.store.insert_batch(&batch).await {
            Ok(_) => {
                let elapsed = started.elapsed();
                tracing::info!(
                    table = %batch.table,
                    rows,
                    latency_ms = elapsed.as_millis(),
                    "Batch flushed"
                );
                metrics::record_rows_flushed(kind, rows);
                metrics::record_flush_duration(kind, elapsed);
                self.stats.batches_stored += 1;
                self.stats.rows_stored += u64::try_from(rows).unwrap_or(u64::MAX);
                FlushOutcome::Stored(rows)
            }
            Err(e) => {
                tracing::warn!(
                    table = %batch.table,
                    rows,
                    error = %e,
                    "Batch insert failed, routing to fallback"
                );
                metrics::record_fallback_batch(kind);
                match self.fallback.write(&batch).await {
                    Ok(key) => {
                        tracing::warn!(table = %batch.table, rows, key = %key, "Batch written to fallback");
                        self.stats.batches_fallback += 1;
                        FlushOutcome::Fallback { rows, key }
                    }
                    Err(fallback_err) => {
                        tracing::error!(
                            table = %batch.table,
                            rows,
                            error = %fallback_err,
                            "Fallback write failed, batch lost"
                        );
                        metrics::record_fallback_failure(kind);
                        self.stats.batches_lost += 1;
                        FlushOutcome::Lost(rows)
                    }
                }
            }
        };

        self.last_flush = Instant::now();
        outcome
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Handles of every spawned worker.
pub struct WorkerPool {
    handles: Vec<(String, JoinHandle<WorkerStats>)>,
}

impl WorkerPool {
    /// Spawn one worker per registry queue.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTableName`] if any queue cannot name a table; no
    /// workers are spawned in that case.
    pub fn spawn(
        registry: &IngestionChannelRegistry,
        config: &WorkerConfig,
        store: &Arc<dyn BatchStorePort>,
        fallback: &Arc<dyn FallbackPort>,
        cancel: &CancellationToken,
    ) -> Result<Self, InvalidTableName> {
        let workers = registry
            .queues()
            .map(|queue| {
                BatchWorker::new(
                    Arc::clone(queue),
                    config,
                    Arc::clone(store),
                    Arc::clone(fallback),
                    cancel.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let handles = workers
            .into_iter()
            .map(|worker| {
                let name = worker.queue.key().to_string();
                (name, tokio::spawn(worker.run()))
            })
            .collect();

        Ok(Self { handles })
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to finish and sum their stats.
    pub async fn join(self) -> WorkerStats {
        let (names, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut total = WorkerStats::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(stats) => {
                    total.batches_stored += stats.batches_stored;
                    total.rows_stored += stats.rows_stored;
                    total.batches_fallback += stats.batches_fallback;
                    total.batches_lost += stats.batches_lost;
                }
                Err(e) => tracing::error!(queue = %name, error = %e, "Batch worker panicked"),
            }
        }
        total
    }
}

// =============================================================================
// Tests
// =============================================================================
