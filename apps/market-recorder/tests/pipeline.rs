//! Pipeline Integration Tests
//!
//! Drives events through the registry and batch workers into recording
//! store and fallback doubles.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use market_recorder::application::ports::{
    BatchStorePort, FallbackError, FallbackPort, StorageError,
};
use market_recorder::application::services::{
    BatchWorker, FlushOutcome, FlushPolicy, FlushThresholds, IngestionChannelRegistry,
    QueueSettings, WorkerConfig, WorkerPool,
};
use market_recorder::domain::batch::{Batch, Value};
use market_recorder::domain::market_data::{
    EventKind, MarketEvent, OrderBookSnapshot, PriceLevel, QueueKey, Side, Trade,
};
use market_recorder::domain::symbol::{CanonicalSymbol, Exchange};

// =============================================================================
// Doubles
// =============================================================================

#[derive(Default)]
struct RecordingStore {
    batches: Mutex<Vec<Batch>>,
}

impl RecordingStore {
    fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl BatchStorePort for RecordingStore {
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StorageError> {
        self.batches.lock().push(batch.clone());
        Ok(batch.len() as u64)
    }
}

struct FailingStore;

#[async_trait]
impl BatchStorePort for FailingStore {
    async fn insert_batch(&self, _batch: &Batch) -> Result<u64, StorageError> {
        Err(StorageError::Backend("connection refused".into()))
    }
}

#[derive(Default)]
struct RecordingFallback {
    batches: Mutex<Vec<Batch>>,
    fail: bool,
}

#[async_trait]
impl FallbackPort for RecordingFallback {
    async fn write(&self, batch: &Batch) -> Result<String, FallbackError> {
        self.batches.lock().push(batch.clone());
        if self.fail {
            return Err(FallbackError::Encode("disk full".to_string()));
        }
        Ok(format!("{}/{}/test.parquet", batch.kind, batch.symbol))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn btc() -> CanonicalSymbol {
    CanonicalSymbol::parse("BTC_USDT").unwrap()
}

fn trade(id: u32) -> MarketEvent {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    MarketEvent::Trade(Trade {
        exchange: Exchange::Binance,
        symbol: btc(),
        trade_id: id.to_string(),
        price: dec!(64000.5),
        amount: dec!(0.01),
        side: Side::Buy,
        timestamp: ts,
        local_timestamp: ts,
    })
}

fn book() -> MarketEvent {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    MarketEvent::OrderBook(OrderBookSnapshot {
        exchange: Exchange::Coinbase,
        symbol: btc(),
        timestamp: ts,
        local_timestamp: ts,
        bids: vec![PriceLevel::new(dec!(63999), dec!(2))],
        asks: vec![PriceLevel::new(dec!(64001), dec!(1.5))],
    })
}

fn registry() -> Arc<IngestionChannelRegistry> {
    Arc::new(IngestionChannelRegistry::new(
        &[btc()],
        &[EventKind::OrderBook, EventKind::Trade],
        QueueSettings::default(),
    ))
}

fn config(size: usize, time: Duration) -> WorkerConfig {
    WorkerConfig {
        thresholds: FlushThresholds {
            orderbook: FlushPolicy::new(size, time),
            trade: FlushPolicy::new(size, time),
        },
        poll_interval: Duration::from_millis(100),
        book_depth: 2,
    }
}

fn trade_worker(
    registry: &IngestionChannelRegistry,
    config: &WorkerConfig,
    store: Arc<dyn BatchStorePort>,
    fallback: Arc<dyn FallbackPort>,
) -> BatchWorker {
    let queue = registry
        .get(&QueueKey::new(btc(), EventKind::Trade))
        .unwrap();
    BatchWorker::new(queue, config, store, fallback, CancellationToken::new()).unwrap()
}

fn trade_ids(batch: &Batch) -> Vec<String> {
    let idx = batch.column_names().position(|c| c == "trade_id").unwrap();
    batch
        .rows
        .iter()
        .map(|row| match &row[idx] {
            Value::Text(id) => id.clone(),
            other => panic!("unexpected trade id {other:?}"),
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn trade_lands_in_its_table() {
    let registry = registry();
    let store = Arc::new(RecordingStore::default());
    let fallback = Arc::new(RecordingFallback::default());
    let mut worker = trade_worker(
        &registry,
        &config(10, Duration::from_secs(30)),
        store.clone(),
        fallback.clone(),
    );

    registry.enqueue(trade(1)).await.unwrap();
    assert_eq!(worker.flush(10).await, FlushOutcome::Stored(1));

    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].table.as_str(), "trade_btc_usdt");
    assert_eq!(
        batches[0].column_names().collect::<Vec<_>>(),
        [
            "exchange",
            "symbol",
            "trade_id",
            "price",
            "amount",
            "side",
            "timestamp",
            "local_timestamp"
        ]
    );
    assert_eq!(batches[0].rows[0][0], Value::Text("binance".to_string()));
    assert!(fallback.batches.lock().is_empty());
}

#[tokio::test]
async fn failed_insert_goes_to_fallback_once() {
    let registry = registry();
    let fallback = Arc::new(RecordingFallback::default());
    let mut worker = trade_worker(
        &registry,
        &config(10, Duration::from_secs(30)),
        Arc::new(FailingStore),
        fallback.clone(),
    );

    for id in 1..=3 {
        registry.enqueue(trade(id)).await.unwrap();
    }
    let outcome = worker.flush(10).await;

    assert_eq!(
        outcome,
        FlushOutcome::Fallback {
            rows: 3,
            key: "trade/BTC_USDT/test.parquet".to_string()
        }
    );
    let written = fallback.batches.lock().clone();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].table.as_str(), "trade_btc_usdt");
    assert_eq!(trade_ids(&written[0]), ["1", "2", "3"]);
    assert_eq!(registry.total_len(), 0, "failed events are not requeued");
}

#[tokio::test]
async fn fallback_failure_loses_the_batch() {
    let registry = registry();
    let fallback = Arc::new(RecordingFallback {
        fail: true,
        ..RecordingFallback::default()
    });
    let mut worker = trade_worker(
        &registry,
        &config(10, Duration::from_secs(30)),
        Arc::new(FailingStore),
        fallback.clone(),
    );

    registry.enqueue(trade(1)).await.unwrap();
    assert_eq!(worker.flush(10).await, FlushOutcome::Lost(1));
    assert_eq!(fallback.batches.lock().len(), 1);
    assert_eq!(registry.total_len(), 0);
}

#[tokio::test]
async fn empty_queue_flushes_nothing() {
    let registry = registry();
    let store = Arc::new(RecordingStore::default());
    let mut worker = trade_worker(
        &registry,
        &config(10, Duration::from_secs(30)),
        store.clone(),
        Arc::new(RecordingFallback::default()),
    );

    assert_eq!(worker.flush(10).await, FlushOutcome::Empty);
    assert!(store.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn size_threshold_triggers_flush() {
    let registry = registry();
    let store = Arc::new(RecordingStore::default());
    let store_port: Arc<dyn BatchStorePort> = store.clone();
    let fallback: Arc<dyn FallbackPort> = Arc::new(RecordingFallback::default());
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(
        &registry,
        &config(3, Duration::from_secs(30)),
        &store_port,
        &fallback,
        &cancel,
    )
    .unwrap();

    for id in 1..=2 {
        registry.enqueue(trade(id)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.batches().is_empty(), "below threshold and fresh");

    registry.enqueue(trade(3)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(trade_ids(&batches[0]), ["1", "2", "3"]);

    cancel.cancel();
    pool.join().await;
}

#[tokio::test(start_paused = true)]
async fn time_threshold_flushes_partial_batch() {
    let registry = registry();
    let store = Arc::new(RecordingStore::default());
    let store_port: Arc<dyn BatchStorePort> = store.clone();
    let fallback: Arc<dyn FallbackPort> = Arc::new(RecordingFallback::default());
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(
        &registry,
        &config(1_000, Duration::from_secs(30)),
        &store_port,
        &fallback,
        &cancel,
    )
    .unwrap();

    registry.enqueue(trade(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(store.batches().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let batches = store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);

    cancel.cancel();
    pool.join().await;
}

#[tokio::test(start_paused = true)]
async fn oversized_queue_is_flushed_in_threshold_chunks() {
    let registry = registry();
    let store = Arc::new(RecordingStore::default());
    let store_port: Arc<dyn BatchStorePort> = store.clone();
    let fallback: Arc<dyn FallbackPort> = Arc::new(RecordingFallback::default());
    let cancel = CancellationToken::new();

    for id in 1..=7 {
        registry.enqueue(trade(id)).await.unwrap();
    }
    let pool = WorkerPool::spawn(
        &registry,
        &config(3, Duration::from_secs(30)),
        &store_port,
        &fallback,
        &cancel,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let batches = store.batches();
    assert!(batches.len() >= 2);
    assert!(batches.iter().all(|b| b.len() <= 3));

    cancel.cancel();
    pool.join().await;

    let ids: Vec<String> = store.batches().iter().flat_map(trade_ids).collect();
    let expected: Vec<String> = (1..=7).map(|id: u32| id.to_string()).collect();
    assert_eq!(ids, expected, "events stored in arrival order");
}

#[tokio::test]
async fn shutdown_drains_every_queue() {
    let registry = registry();
    let store = Arc::new(RecordingStore::default());
    let store_port: Arc<dyn BatchStorePort> = store.clone();
    let fallback: Arc<dyn FallbackPort> = Arc::new(RecordingFallback::default());
    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(
        &registry,
        &config(1_000, Duration::from_secs(3600)),
        &store_port,
        &fallback,
        &cancel,
    )
    .unwrap();
    assert_eq!(pool.len(), 2);

    for id in 1..=5 {
        registry.enqueue(trade(id)).await.unwrap();
    }
    registry.enqueue(book()).await.unwrap();

    cancel.cancel();
    let stats = pool.join().await;

    assert_eq!(stats.rows_stored, 6);
    assert_eq!(stats.batches_stored, 2);
    assert_eq!(registry.total_len(), 0);

    let mut tables: Vec<String> = store
        .batches()
        .iter()
        .map(|b| b.table.as_str().to_string())
        .collect();
    tables.sort();
    assert_eq!(tables, ["orderbook_btc_usdt", "trade_btc_usdt"]);
}

#[tokio::test]
async fn untracked_symbol_is_rejected() {
    let registry = registry();
    let ts = Utc::now();
    let event = MarketEvent::Trade(Trade {
        exchange: Exchange::Binance,
        symbol: CanonicalSymbol::parse("DOGE_USDT").unwrap(),
        trade_id: "9".to_string(),
        price: dec!(0.1),
        amount: dec!(100),
        side: Side::Sell,
        timestamp: ts,
        local_timestamp: ts,
    });

    assert!(registry.enqueue(event).await.is_err());
    assert_eq!(registry.total_len(), 0);
}
