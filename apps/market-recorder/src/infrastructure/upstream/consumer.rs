//! Stream Consumer
//!
//! Owns the single upstream WebSocket. It subscribes once per connection
//! with every tracked exchange, symbol and data type encoded into the
//! `options` query parameter, decodes each text frame and pushes the
//! resulting events into the [`IngestionChannelRegistry`].
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//!                                   \-> ShutDown (cancellation)
//! ```
//!
//! Transport failures never escape [`StreamConsumer::run`]: they are logged,
//! counted and answered with the [`ReconnectPolicy`] delay. Cancellation
//! stops reading immediately; whatever is queued stays in the registry for
//! the batch workers to drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, Decoded, StreamDecoder};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use super::messages::{SubscriptionFilter, book_snapshot_data_type};
use super::reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
use crate::application::services::IngestionChannelRegistry;
use crate::domain::market_data::EventKind;
use crate::domain::symbol::SymbolTranslator;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Upstream closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No frame arrived within the heartbeat timeout.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Subscription request could not be encoded.
    #[error("invalid subscription: {0}")]
    Subscription(#[from] serde_json::Error),
}

// =============================================================================
// Configuration
// =============================================================================

/// Stream consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upstream WebSocket endpoint, without the `options` parameter.
    pub url: String,
    /// Event kinds to subscribe to.
    pub kinds: Vec<EventKind>,
    /// Order-book levels per side.
    pub book_depth: usize,
    /// Snapshot interval suffix, e.g. `0ms` or `100ms`.
    pub snapshot_interval: String,
    /// Backoff settings.
    pub reconnect: ReconnectConfig,
    /// Liveness settings.
    pub heartbeat: HeartbeatConfig,
}

impl ConsumerConfig {
    /// Settings with default reconnect and heartbeat behavior.
    #[must_use]
    pub fn new(url: impl Into<String>, kinds: Vec<EventKind>, book_depth: usize) -> Self {
        Self {
            url: url.into(),
            kinds,
            book_depth,
            snapshot_interval: "0ms".to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Build the subscription filters: one entry per tracked exchange.
#[must_use]
pub fn subscription_filters(
    translator: &SymbolTranslator,
    kinds: &[EventKind],
    book_depth: usize,
    snapshot_interval: &str,
) -> Vec<SubscriptionFilter> {
    let data_types: Vec<String> = kinds
        .iter()
        .map(|kind| match kind {
            EventKind::Trade => "trade".to_string(),
            EventKind::OrderBook => book_snapshot_data_type(book_depth, snapshot_interval),
        })
        .collect();

    translator
        .exchanges()
        .iter()
        .map(|exchange| SubscriptionFilter {
            exchange: exchange.as_str().to_string(),
            symbols: translator
                .outbound_symbols(*exchange)
                .into_iter()
                .map(str::to_string)
                .collect(),
            data_types: data_types.clone(),
        })
        .collect()
}

/// Append the URL-encoded filters to `base` as the `options` parameter.
///
/// # Errors
///
/// Returns an error if the filters cannot be serialized.
pub fn subscription_url(
    base: &str,
    filters: &[SubscriptionFilter],
) -> Result<String, ConsumerError> {
    let json = serde_json::to_string(filters)?;
    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{base}{separator}options={}",
        urlencoding::encode(&json)
    ))
}

// =============================================================================
// Status
// =============================================================================

/// Connection state of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not started or between attempts.
    Disconnected = 0,
    /// Opening the socket.
    Connecting = 1,
    /// Socket open and reading.
    Connected = 2,
    /// Waiting out a backoff delay.
    Reconnecting = 3,
    /// Cancelled; will not reconnect.
    ShutDown = 4,
}

impl ConnectionState {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShutDown => "shut_down",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::ShutDown,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free view of the consumer, shared with the health endpoint.
#[derive(Debug)]
pub struct ConsumerStatus {
    state: AtomicU8,
    messages_received: AtomicU64,
    events_enqueued: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
    last_message_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for ConsumerStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            messages_received: AtomicU64::new(0),
            events_enqueued: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_message_at: RwLock::new(None),
        }
    }
}

impl ConsumerStatus {
    /// Create a status in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Text frames received.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Events handed to the registry.
    #[must_use]
    pub fn events_enqueued(&self) -> u64 {
        self.events_enqueued.load(Ordering::Relaxed)
    }

    /// Frames or array elements dropped by the decoder.
    #[must_use]
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Reconnect attempts since start.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Receipt time of the last text frame.
    #[must_use]
    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        *self.last_message_at.read()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Upstream stream consumer.
pub struct StreamConsumer {
    config: ConsumerConfig,
    url: String,
    decoder: StreamDecoder,
    registry: Arc<IngestionChannelRegistry>,
    status: Arc<ConsumerStatus>,
    cancel: CancellationToken,
}

impl StreamConsumer {
    /// Create a consumer for every instrument and exchange in `translator`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription request cannot be encoded.
    pub fn new(
        config: ConsumerConfig,
        translator: Arc<SymbolTranslator>,
        registry: Arc<IngestionChannelRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, ConsumerError> {
        let filters = subscription_filters(
            &translator,
            &config.kinds,
            config.book_depth,
            &config.snapshot_interval,
        );
        let url = subscription_url(&config.url, &filters)?;
        Ok(Self {
            decoder: StreamDecoder::new(translator, config.book_depth),
            url,
            config,
            registry,
            status: Arc::new(ConsumerStatus::new()),
            cancel,
        })
    }

    /// Shared status handle.
    #[must_use]
    pub fn status(&self) -> Arc<ConsumerStatus> {
        Arc::clone(&self.status)
    }

    /// Full subscription URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Read until cancelled, reconnecting on every failure.
    pub async fn run(self: Arc<Self>) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let result = self.connect_and_run(&mut policy).await;
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = result {
                tracing::warn!(error = %e, "Upstream connection lost");
            }
            self.status.set_state(ConnectionState::Reconnecting);
            self.status.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_reconnect();

            let backoff = policy.next_delay();
            match backoff {
                Backoff::Exponential { retry, delay } => tracing::info!(
                    retry,
                    delay_secs = delay.as_secs_f64(),
                    "Reconnecting to upstream"
                ),
                Backoff::Cooldown { failures, delay } => tracing::warn!(
                    failures,
                    delay_secs = delay.as_secs_f64(),
                    "Too many upstream failures, cooling down"
                ),
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(backoff.delay()) => {}
            }
        }

        self.status.set_state(ConnectionState::ShutDown);
        tracing::info!(
            messages = self.status.messages_received(),
            reconnects = self.status.reconnects(),
            "Stream consumer stopped"
        );
    }

    /// One connection: connect, then read until failure or cancellation.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), ConsumerError> {
        self.status.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "Connecting to upstream stream");

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = connect => result?,
        };

        self.status.set_state(ConnectionState::Connected);
        policy.reset();
        tracing::info!(url = %self.config.url, "Upstream connected");

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Best effort; the process is exiting.
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                action = heartbeat.tick() => match action {
                    HeartbeatAction::SendPing => {
                        write.send(Message::Ping(Vec::new().into())).await?;
                    }
                    HeartbeatAction::TimedOut(silent) => {
                        return Err(ConsumerError::HeartbeatTimeout(silent));
                    }
                },
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_activity();
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.record_activity();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "Upstream sent close frame");
                            return Err(ConsumerError::ConnectionClosed);
                        }
                        Some(Ok(_)) => heartbeat.record_activity(),
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(ConsumerError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// Decode one frame and enqueue its events. Never fails.
    async fn handle_text(&self, text: &str) {
        self.status.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.status.last_message_at.write() = Some(Utc::now());

        let decoded = match self.decoder.decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.record_decode_error(&e, text);
                return;
            }
        };

        for item in decoded {
            match item {
                Ok(Decoded::Event(event)) => {
                    metrics::record_message_received(event.exchange(), event.kind());
                    // Unroutable events are logged and counted by the registry.
                    if self.registry.enqueue(event).await.is_ok() {
                        self.status.events_enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(Decoded::Ignored(kind)) => {
                    tracing::trace!(message_type = %kind, "Ignoring message");
                }
                Err(e) => self.record_decode_error(&e, text),
            }
        }
    }

    fn record_decode_error(&self, error: &CodecError, text: &str) {
        self.status.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_decode_error();
        let preview: String = text.chars().take(200).collect();
        tracing::warn!(error = %error, frame = %preview, "Dropping undecodable message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::symbol::{CanonicalSymbol, Exchange};

    fn translator() -> SymbolTranslator {
        let instruments = ["BTC_USDT", "ETH_USDT"].map(|s| CanonicalSymbol::parse(s).unwrap());
        SymbolTranslator::new(instruments, [Exchange::Binance, Exchange::Coinbase]).unwrap()
    }

    #[test]
    fn filters_cover_every_exchange() {
        let filters = subscription_filters(
            &translator(),
            &[EventKind::OrderBook, EventKind::Trade],
            15,
            "0ms",
        );
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].exchange, "binance");
        assert_eq!(filters[0].symbols, vec!["btcusdt", "ethusdt"]);
        assert_eq!(filters[0].data_types, vec!["book_snapshot_15_0ms", "trade"]);
        assert_eq!(filters[1].exchange, "coinbase");
        assert_eq!(filters[1].symbols, vec!["BTC-USD", "ETH-USD"]);
    }

    #[test]
    fn url_carries_encoded_options() {
        let filters = subscription_filters(&translator(), &[EventKind::Trade], 15, "0ms");
        let url = subscription_url("ws://localhost:8001/ws-stream-normalized", &filters).unwrap();

        let (base, query) = url.split_once("?options=").unwrap();
        assert_eq!(base, "ws://localhost:8001/ws-stream-normalized");
        assert!(!query.contains('{'));

        let decoded = urlencoding::decode(query).unwrap();
        let round: Vec<SubscriptionFilter> = serde_json::from_str(&decoded).unwrap();
        assert_eq!(round, filters);
    }

    #[test]
    fn url_appends_to_existing_query() {
        let url = subscription_url("ws://host/stream?token=x", &[]).unwrap();
        assert_eq!(url, "ws://host/stream?token=x&options=%5B%5D");
    }

    #[test]
    fn status_starts_disconnected() {
        let status = ConsumerStatus::new();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        assert!(!status.is_connected());
        status.set_state(ConnectionState::Connected);
        assert!(status.is_connected());
        assert_eq!(status.state().to_string(), "connected");
    }
}
