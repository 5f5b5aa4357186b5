//! Market Recorder Binary
//!
//! Starts the market data recorder.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-recorder
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL`: `PostgreSQL` connection string
//! - `RECORDER_FALLBACK_BUCKET` or `RECORDER_FALLBACK_DIR`: fallback target
//!
//! ## Optional
//! - `RECORDER_FALLBACK_ENDPOINT`: S3-compatible endpoint (GCS: <https://storage.googleapis.com> with HMAC keys)
//! - `RECORDER_UPSTREAM_URL`: Normalized stream endpoint
//! - `RECORDER_SYMBOLS`: Canonical instruments, e.g. `BTC_USDT,ETH_USDT`
//! - `RECORDER_EXCHANGES`: Venues, e.g. `binance,coinbase`
//! - `RECORDER_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-recorder)
//! - `RECORDER_LOG_FORMAT`: `text` or `json` (default: text)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_recorder::application::ports::{BatchStorePort, BlobStorePort, FallbackPort};
use market_recorder::application::services::{IngestionChannelRegistry, WorkerPool};
use market_recorder::domain::symbol::SymbolTranslator;
use market_recorder::infrastructure::config::{FallbackTarget, RecorderConfig};
use market_recorder::infrastructure::fallback::{
    LocalDirBlobStore, ParquetFallbackWriter, S3BlobStore,
};
use market_recorder::infrastructure::health::{HealthServer, HealthServerState};
use market_recorder::infrastructure::storage::PgBatchStore;
use market_recorder::infrastructure::telemetry;
use market_recorder::infrastructure::upstream::{ConsumerConfig, StreamConsumer};
use market_recorder::init_metrics;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for the consumer to close its socket.
const CONSUMER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Market Recorder");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = RecorderConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let translator = Arc::new(
        SymbolTranslator::new(config.symbols.iter().cloned(), config.exchanges.iter().copied())
            .context("invalid symbol mapping")?,
    );
    let registry = Arc::new(IngestionChannelRegistry::new(
        &config.symbols,
        &config.kinds,
        config.queue,
    ));

    // Storage
    let store = Arc::new(
        PgBatchStore::connect(&config.database)
            .await
            .context("failed to create PostgreSQL pool")?,
    );
    let blob: Arc<dyn BlobStorePort> = match &config.fallback.target {
        FallbackTarget::S3(settings) => Arc::new(S3BlobStore::new(settings)),
        FallbackTarget::LocalDir(root) => Arc::new(LocalDirBlobStore::new(root.clone())),
    };
    let fallback: Arc<dyn FallbackPort> = Arc::new(ParquetFallbackWriter::new(
        blob,
        config.fallback.spool_dir.clone(),
    ));

    // Workers stop after the consumer so queued events are drained.
    let shutdown_token = CancellationToken::new();
    let worker_token = CancellationToken::new();

    let store_port: Arc<dyn BatchStorePort> = store.clone();
    let workers = WorkerPool::spawn(
        &registry,
        &config.worker,
        &store_port,
        &fallback,
        &worker_token,
    )
    .context("invalid table name")?;

    let consumer_config = ConsumerConfig {
        url: config.upstream_url.clone(),
        kinds: config.kinds.clone(),
        book_depth: config.book_depth,
        snapshot_interval: config.snapshot_interval.clone(),
        reconnect: config.reconnect,
        heartbeat: config.heartbeat,
    };
    let consumer = Arc::new(StreamConsumer::new(
        consumer_config,
        Arc::clone(&translator),
        Arc::clone(&registry),
        shutdown_token.clone(),
    )?);

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        consumer.status(),
        Arc::clone(&registry),
    ));
    let health_server = HealthServer::new(config.health_port, health_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let consumer_handle = tokio::spawn(Arc::clone(&consumer).run());

    tracing::info!(
        queues = registry.len(),
        workers = workers.len(),
        "Market recorder ready"
    );

    await_shutdown(shutdown_token).await;

    match tokio::time::timeout(CONSUMER_SHUTDOWN_TIMEOUT, consumer_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Consumer task failed"),
        Err(_) => tracing::warn!("Consumer did not stop in time"),
    }

    tracing::info!(
        queued = registry.total_len(),
        "Draining ingestion queues"
    );
    worker_token.cancel();
    let stats = workers.join().await;
    tracing::info!(
        batches_stored = stats.batches_stored,
        rows_stored = stats.rows_stored,
        batches_fallback = stats.batches_fallback,
        batches_lost = stats.batches_lost,
        "Workers stopped"
    );

    store.close().await;

    tracing::info!("Market recorder stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RecorderConfig) {
    let symbols: Vec<&str> = config.symbols.iter().map(|s| s.as_str()).collect();
    let exchanges: Vec<&str> = config.exchanges.iter().map(|e| e.as_str()).collect();
    let kinds: Vec<&str> = config.kinds.iter().map(|k| k.as_str()).collect();

    tracing::info!(
        symbols = ?symbols,
        exchanges = ?exchanges,
        kinds = ?kinds,
        book_depth = config.book_depth,
        health_port = config.health_port,
        fallback = %config.fallback.target.describe(),
        "Configuration loaded"
    );
    tracing::debug!(
        upstream_url = %config.upstream_url,
        orderbook_flush_size = config.worker.thresholds.orderbook.size_threshold,
        trade_flush_size = config.worker.thresholds.trade.size_threshold,
        queue_capacity = ?config.queue.capacity,
        overflow = config.queue.overflow.as_str(),
        "Pipeline settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
