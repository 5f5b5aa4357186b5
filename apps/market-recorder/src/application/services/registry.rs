//! Ingestion Channel Registry
//!
//! Owns one FIFO queue per (canonical symbol, event kind). The stream
//! consumer is the only producer and each queue has exactly one persistence
//! worker draining it.
//!
//! # Capacity
//!
//! Queues are unbounded by default so a storage outage never loses events
//! before they reach the fallback path. A capacity can be configured
//! together with an [`OverflowPolicy`]:
//!
//! - `Block`: the producer waits for the worker to drain, which in turn
//!   back-pressures the socket reader
//! - `DropOldest`: the oldest queued event is discarded and counted
//!
//! Either way a warning is logged once each time a queue crosses its
//! high-water mark.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::market_data::{EventKind, MarketEvent, QueueKey};
use crate::domain::symbol::CanonicalSymbol;
use crate::infrastructure::metrics;

// =============================================================================
// Settings
// =============================================================================

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait until the worker frees space.
    #[default]
    Block,
    /// Discard the oldest queued event.
    DropOldest,
}

impl OverflowPolicy {
    /// Parse a policy name (`block`, `drop_oldest`).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "block" => Some(Self::Block),
            "drop_oldest" => Some(Self::DropOldest),
            _ => None,
        }
    }

    /// Policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
        }
    }
}

/// Per-queue settings.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Maximum queued events (`None` = unbounded).
    pub capacity: Option<usize>,
    /// Behavior when `capacity` is reached.
    pub overflow: OverflowPolicy,
    /// Queue length that triggers a warning.
    pub high_water_mark: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Block,
            high_water_mark: 50_000,
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Event appended.
    Enqueued,
    /// Event appended after discarding the oldest one.
    DroppedOldest,
}

/// Single-producer, single-consumer FIFO of market events.
#[derive(Debug)]
pub struct IngestionQueue {
    key: QueueKey,
    settings: QueueSettings,
    items: Mutex<VecDeque<MarketEvent>>,
    space: Notify,
    above_high_water: AtomicBool,
    dropped: AtomicU64,
}

impl IngestionQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(key: QueueKey, settings: QueueSettings) -> Self {
        Self {
            key,
            settings,
            items: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            above_high_water: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Key of this queue.
    #[must_use]
    pub const fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Current number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Events discarded by the `DropOldest` policy so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append an event.
    ///
    /// Only waits when the queue is bounded, full and the policy is `Block`.
    pub async fn push(&self, event: MarketEvent) -> PushOutcome {
        let mut event = Some(event);
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            // Register before checking so a drain between check and await is not missed.
            notified.as_mut().enable();

            {
                let mut items = self.items.lock();
                let full = self
                    .settings
                    .capacity
                    .is_some_and(|capacity| items.len() >= capacity);

                if !full || self.settings.overflow == OverflowPolicy::DropOldest {
                    let outcome = if full {
                        items.pop_front();
                        PushOutcome::DroppedOldest
                    } else {
                        PushOutcome::Enqueued
                    };
                    if let Some(event) = event.take() {
                        items.push_back(event);
                    }
                    let len = items.len();
                    drop(items);

                    if outcome == PushOutcome::DroppedOldest {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::record_event_dropped(metrics::DropReason::QueueOverflow);
                    }
                    self.check_high_water(len);
                    return outcome;
                }
            }

            notified.await;
        }
    }

    /// Remove up to `max` events from the front, in arrival order.
    #[must_use]
    pub fn drain(&self, max: usize) -> Vec<MarketEvent> {
        let drained: Vec<MarketEvent> = {
            let mut items = self.items.lock();
            let n = max.min(items.len());
            items.drain(..n).collect()
        };
        if !drained.is_empty() {
            self.space.notify_waiters();
            self.check_high_water(self.len());
        }
        drained
    }

    fn check_high_water(&self, len: usize) {
        let mark = self.settings.high_water_mark;
        if mark == 0 {
            return;
        }
        if len >= mark {
            if !self.above_high_water.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    queue = %self.key,
                    len,
                    high_water_mark = mark,
                    "Ingestion queue above high-water mark"
                );
            }
        } else if len < mark / 2 {
            self.above_high_water.store(false, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Enqueue failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// No queue is registered for the event's symbol and kind.
    #[error("no ingestion queue for {0}")]
    NoQueue(QueueKey),
}

/// Snapshot of one queue for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDepth {
    /// Queue key.
    pub key: QueueKey,
    /// Queued events.
    pub len: usize,
}

/// Owned set of ingestion queues, fixed at startup.
#[derive(Debug, Default)]
pub struct IngestionChannelRegistry {
    queues: BTreeMap<QueueKey, Arc<IngestionQueue>>,
}

impl IngestionChannelRegistry {
    /// One queue for every symbol and kind.
    #[must_use]
    pub fn new(symbols: &[CanonicalSymbol], kinds: &[EventKind], settings: QueueSettings) -> Self {
        let queues = symbols
            .iter()
            .flat_map(|symbol| {
                kinds
                    .iter()
                    .map(move |&kind| QueueKey::new(symbol.clone(), kind))
            })
            .map(|key| {
                let queue = Arc::new(IngestionQueue::new(key.clone(), settings));
                (key, queue)
            })
            .collect();
        Self { queues }
    }

    /// Queue for a key.
    #[must_use]
    pub fn get(&self, key: &QueueKey) -> Option<Arc<IngestionQueue>> {
        self.queues.get(key).cloned()
    }

    /// All queues, ordered by key.
    pub fn queues(&self) -> impl Iterator<Item = &Arc<IngestionQueue>> {
        self.queues.values()
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no queues are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Route an event to its queue.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::NoQueue`] when the event's symbol or kind is
    /// not tracked. The event is dropped and a warning logged.
    pub async fn enqueue(&self, event: MarketEvent) -> Result<PushOutcome, EnqueueError> {
        let key = event.queue_key();
        let Some(queue) = self.queues.get(&key) else {
            tracing::warn!(
                queue = %key,
                exchange = %event.exchange(),
                "No ingestion queue for event, dropping"
            );
            metrics::record_event_dropped(metrics::DropReason::NoQueue);
            return Err(EnqueueError::NoQueue(key));
        };
        Ok(queue.push(event).await)
    }

    /// Current depth of every queue.
    #[must_use]
    pub fn depths(&self) -> Vec<QueueDepth> {
        self.queues
            .values()
            .map(|q| QueueDepth {
                key: q.key().clone(),
                len: q.len(),
            })
            .collect()
    }

    /// Total queued events across all queues.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::market_data::{Side, Trade};
    use crate::domain::symbol::Exchange;

    fn btc() -> CanonicalSymbol {
        CanonicalSymbol::parse("BTC_USDT").unwrap()
    }

    fn trade(symbol: &CanonicalSymbol, id: u64) -> MarketEvent {
        MarketEvent::Trade(Trade {
            exchange: Exchange::Binance,
            symbol: symbol.clone(),
            trade_id: id.to_string(),
            price: Decimal::ONE,
            amount: Decimal::ONE,
            side: Side::Sell,
            timestamp: Utc::now(),
            local_timestamp: Utc::now(),
        })
    }

    fn trade_id(event: &MarketEvent) -> &str {
        match event {
            MarketEvent::Trade(t) => &t.trade_id,
            MarketEvent::OrderBook(_) => panic!("expected trade"),
        }
    }

    fn registry(settings: QueueSettings) -> IngestionChannelRegistry {
        IngestionChannelRegistry::new(&[btc()], &EventKind::ALL, settings)
    }

    #[test]
    fn registry_has_queue_per_symbol_and_kind() {
        let eth = CanonicalSymbol::parse("ETH_USDT").unwrap();
        let registry =
            IngestionChannelRegistry::new(&[btc(), eth.clone()], &EventKind::ALL, QueueSettings::default());
        assert_eq!(registry.len(), 4);
        assert!(registry.get(&QueueKey::new(eth, EventKind::OrderBook)).is_some());
    }

    #[tokio::test]
    async fn enqueue_routes_by_key() {
        let registry = registry(QueueSettings::default());
        registry.enqueue(trade(&btc(), 1)).await.unwrap();

        let trades = registry.get(&QueueKey::new(btc(), EventKind::Trade)).unwrap();
        let books = registry.get(&QueueKey::new(btc(), EventKind::OrderBook)).unwrap();
        assert_eq!(trades.len(), 1);
        assert!(books.is_empty());
        assert_eq!(registry.total_len(), 1);
    }

    #[tokio::test]
    async fn enqueue_without_queue_is_dropped() {
        let registry = registry(QueueSettings::default());
        let unknown = CanonicalSymbol::unmapped("pepeusdt");
        let err = registry.enqueue(trade(&unknown, 1)).await.unwrap_err();
        assert_eq!(err, EnqueueError::NoQueue(QueueKey::new(unknown, EventKind::Trade)));
        assert_eq!(registry.total_len(), 0);
    }

    #[tokio::test]
    async fn drain_takes_from_front_in_order() {
        let queue = IngestionQueue::new(QueueKey::new(btc(), EventKind::Trade), QueueSettings::default());
        for id in 0..5 {
            queue.push(trade(&btc(), id)).await;
        }

        let first = queue.drain(3);
        assert_eq!(first.iter().map(trade_id).collect::<Vec<_>>(), ["0", "1", "2"]);
        let rest = queue.drain(10);
        assert_eq!(rest.iter().map(trade_id).collect::<Vec<_>>(), ["3", "4"]);
        assert!(queue.drain(10).is_empty());
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest() {
        let settings = QueueSettings {
            capacity: Some(2),
            overflow: OverflowPolicy::DropOldest,
            high_water_mark: 0,
        };
        let queue = IngestionQueue::new(QueueKey::new(btc(), EventKind::Trade), settings);
        assert_eq!(queue.push(trade(&btc(), 1)).await, PushOutcome::Enqueued);
        assert_eq!(queue.push(trade(&btc(), 2)).await, PushOutcome::Enqueued);
        assert_eq!(queue.push(trade(&btc(), 3)).await, PushOutcome::DroppedOldest);

        assert_eq!(queue.dropped(), 1);
        let ids: Vec<String> = queue.drain(10).iter().map(|e| trade_id(e).to_string()).collect();
        assert_eq!(ids, ["2", "3"]);
    }

    #[tokio::test]
    async fn block_waits_for_drain() {
        let settings = QueueSettings {
            capacity: Some(1),
            overflow: OverflowPolicy::Block,
            high_water_mark: 0,
        };
        let queue = Arc::new(IngestionQueue::new(QueueKey::new(btc(), EventKind::Trade), settings));
        queue.push(trade(&btc(), 1)).await;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(trade(&btc(), 2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "push should block while full");

        let drained = queue.drain(1);
        assert_eq!(trade_id(&drained[0]), "1");

        let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume after drain")
            .unwrap();
        assert_eq!(outcome, PushOutcome::Enqueued);
        assert_eq!(trade_id(&queue.drain(1)[0]), "2");
    }

    #[test]
    fn overflow_policy_parsing() {
        assert_eq!(OverflowPolicy::from_str_case_insensitive("BLOCK"), Some(OverflowPolicy::Block));
        assert_eq!(
            OverflowPolicy::from_str_case_insensitive("drop-oldest"),
            Some(OverflowPolicy::DropOldest)
        );
        assert_eq!(OverflowPolicy::from_str_case_insensitive("spill"), None);
    }

    proptest! {
        #[test]
        fn drains_preserve_arrival_order(
            count in 0usize..200,
            chunks in prop::collection::vec(1usize..50, 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let queue = IngestionQueue::new(QueueKey::new(btc(), EventKind::Trade), QueueSettings::default());
            runtime.block_on(async {
                for id in 0..count {
                    queue.push(trade(&btc(), id as u64)).await;
                }
            });

            let mut seen = Vec::new();
            for chunk in chunks.iter().cycle().take(count + chunks.len()) {
                seen.extend(queue.drain(*chunk).iter().map(|e| trade_id(e).to_string()));
            }
            let expected: Vec<String> = (0..count).map(|id| id.to_string()).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
