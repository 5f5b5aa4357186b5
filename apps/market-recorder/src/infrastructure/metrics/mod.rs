//! Prometheus Metrics Module
//!
//! Exposes recorder metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ingestion**: messages received, decode errors, unmapped symbols,
//!   dropped events, reconnects
//! - **Queues**: per-queue depth
//! - **Persistence**: rows flushed, flush latency, fallback batches and
//!   fallback failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder, so
//! library code and tests can call them freely.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market_data::{EventKind, QueueKey};
use crate::domain::symbol::Exchange;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the one already installed.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ingestion
    describe_counter!(
        "recorder_messages_received_total",
        "Decoded events received from the upstream stream"
    );
    describe_counter!(
        "recorder_decode_errors_total",
        "Upstream frames dropped because they could not be decoded"
    );
    describe_counter!(
        "recorder_unmapped_symbols_total",
        "Events whose wire symbol has no canonical mapping"
    );
    describe_counter!(
        "recorder_events_dropped_total",
        "Events dropped before reaching a batch"
    );
    describe_counter!(
        "recorder_reconnects_total",
        "Upstream reconnection attempts"
    );

    // Queues
    describe_gauge!(
        "recorder_queue_depth",
        "Events waiting in an ingestion queue"
    );

    // Persistence
    describe_counter!(
        "recorder_rows_flushed_total",
        "Rows written to the primary store"
    );
    describe_histogram!(
        "recorder_flush_seconds",
        "Latency of successful batch inserts"
    );
    describe_counter!(
        "recorder_fallback_batches_total",
        "Batches routed to the fallback writer"
    );
    describe_counter!(
        "recorder_fallback_failures_total",
        "Batches lost because the fallback write failed"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No queue for the event's symbol and kind.
    NoQueue,
    /// Bounded queue full under the drop-oldest policy.
    QueueOverflow,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NoQueue => "no_queue",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}

/// Record a decoded upstream event.
pub fn record_message_received(exchange: Exchange, kind: EventKind) {
    counter!(
        "recorder_messages_received_total",
        "exchange" => exchange.as_str(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an undecodable frame.
pub fn record_decode_error() {
    counter!("recorder_decode_errors_total").increment(1);
}

/// Record an event with an unmapped wire symbol.
pub fn record_unmapped_symbol(exchange: Exchange) {
    counter!(
        "recorder_unmapped_symbols_total",
        "exchange" => exchange.as_str()
    )
    .increment(1);
}

/// Record a dropped event.
pub fn record_event_dropped(reason: DropReason) {
    counter!(
        "recorder_events_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("recorder_reconnects_total").increment(1);
}

/// Update the depth gauge of a queue.
pub fn set_queue_depth(key: &QueueKey, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    let depth = depth as f64;
    gauge!(
        "recorder_queue_depth",
        "symbol" => key.symbol.as_str().to_string(),
        "kind" => key.kind.as_str()
    )
    .set(depth);
}

/// Record rows written to the primary store.
pub fn record_rows_flushed(kind: EventKind, rows: usize) {
    counter!(
        "recorder_rows_flushed_total",
        "kind" => kind.as_str()
    )
    .increment(u64::try_from(rows).unwrap_or(u64::MAX));
}

/// Record the latency of a successful insert.
pub fn record_flush_duration(kind: EventKind, duration: Duration) {
    histogram!(
        "recorder_flush_seconds",
        "kind" => kind.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a batch routed to the fallback writer.
pub fn record_fallback_batch(kind: EventKind) {
    counter!(
        "recorder_fallback_batches_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a batch lost after a fallback failure.
pub fn record_fallback_failure(kind: EventKind) {
    counter!(
        "recorder_fallback_failures_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::NoQueue.as_str(), "no_queue");
        assert_eq!(DropReason::QueueOverflow.as_str(), "queue_overflow");
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        let key = QueueKey::new(
            crate::domain::symbol::CanonicalSymbol::parse("BTC_USDT").unwrap(),
            EventKind::Trade,
        );
        record_message_received(Exchange::Binance, EventKind::Trade);
        record_event_dropped(DropReason::NoQueue);
        set_queue_depth(&key, 42);
        record_flush_duration(EventKind::Trade, Duration::from_millis(5));
    }
}
