//! Normalized Stream Message Types
//!
//! Wire format types for the upstream normalized market-data stream and its
//! subscription request.
//!
//! # Inbound Messages
//!
//! Every message is a JSON object with a `type` discriminator:
//!
//! ```json
//! {"type":"book_snapshot","exchange":"binance","symbol":"BTCUSDT",
//!  "bids":[{"price":67000.5,"amount":1.2}],"asks":[[67001,0.4]],
//!  "timestamp":"2024-05-01T12:00:00.123Z","localTimestamp":"2024-05-01T12:00:00.130Z"}
//! {"type":"trade","exchange":"coinbase","symbol":"BTC-USD","id":"T1",
//!  "price":"67000.5","amount":0.01,"side":"buy","timestamp":1714564800123,
//!  "localTimestamp":1714564800130}
//! ```
//!
//! Other types (`book_change`, `disconnect`, ...) are recognized and skipped.
//!
//! # Timestamps
//!
//! Producers mix ISO-8601 strings and epoch-millisecond numbers; both are
//! accepted by [`WireTimestamp`] and normalized to UTC.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::Side;

// =============================================================================
// Timestamps
// =============================================================================

/// Timestamp as sent on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    /// Epoch milliseconds, integral.
    Millis(i64),
    /// Epoch milliseconds with a fractional part.
    FractionalMillis(f64),
    /// ISO-8601 / RFC 3339 text.
    Text(String),
}

impl WireTimestamp {
    /// Convert to a UTC instant.
    ///
    /// Text without an offset is taken as UTC.
    #[must_use]
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            Self::FractionalMillis(ms) => {
                if !ms.is_finite() {
                    return None;
                }
                #[allow(clippy::cast_possible_truncation)]
                let micros = (ms * 1_000.0).round() as i64;
                Utc.timestamp_micros(micros).single()
            }
            Self::Text(text) => parse_timestamp_text(text),
        }
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
        .or_else(|| {
            // Numeric strings are epoch millis.
            trimmed
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        })
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Order-book level, as `{price, amount}` or `[price, amount]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireLevel {
    /// Object form.
    Object {
        /// Level price.
        price: Decimal,
        /// Level size.
        amount: Decimal,
    },
    /// Array form.
    Pair(Decimal, Decimal),
}

impl WireLevel {
    /// `(price, amount)`.
    #[must_use]
    pub const fn parts(&self) -> (Decimal, Decimal) {
        match self {
            Self::Object { price, amount } | Self::Pair(price, amount) => (*price, *amount),
        }
    }
}

/// Trade identifier, text or number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireTradeId {
    /// Text id.
    Text(String),
    /// Numeric id.
    Number(u64),
}

impl WireTradeId {
    /// Id as text.
    #[must_use]
    pub fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// `book_snapshot` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshotMessage {
    /// Upstream exchange id.
    pub exchange: String,
    /// Wire symbol.
    pub symbol: String,
    /// Bid levels, best first.
    #[serde(default)]
    pub bids: Vec<WireLevel>,
    /// Ask levels, best first.
    #[serde(default)]
    pub asks: Vec<WireLevel>,
    /// Exchange timestamp.
    pub timestamp: WireTimestamp,
    /// Local receipt timestamp.
    #[serde(default, alias = "datetime")]
    pub local_timestamp: Option<WireTimestamp>,
}

/// `trade` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeMessage {
    /// Upstream exchange id.
    pub exchange: String,
    /// Wire symbol.
    pub symbol: String,
    /// Trade id.
    pub id: Option<WireTradeId>,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub amount: Decimal,
    /// Aggressor side; `null` and unknown values mean [`Side::Unknown`].
    #[serde(default)]
    pub side: Option<Side>,
    /// Exchange timestamp.
    pub timestamp: WireTimestamp,
    /// Local receipt timestamp.
    #[serde(default, alias = "datetime")]
    pub local_timestamp: Option<WireTimestamp>,
}

/// Any inbound message, discriminated by `type`.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// Order-book snapshot.
    BookSnapshot(BookSnapshotMessage),
    /// Trade.
    Trade(TradeMessage),
    /// Recognized envelope of a type this recorder does not store.
    Other(String),
}

// =============================================================================
// Subscription Request
// =============================================================================

/// One entry of the `options` subscription array.
///
/// # Wire Format (JSON)
/// ```json
/// {"exchange":"binance","symbols":["btcusdt"],"dataTypes":["trade","book_snapshot_15_0ms"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilter {
    /// Upstream exchange id.
    pub exchange: String,
    /// Wire symbols.
    pub symbols: Vec<String>,
    /// Data type names.
    pub data_types: Vec<String>,
}

/// Data type name for order-book snapshots of `depth` levels.
#[must_use]
pub fn book_snapshot_data_type(depth: usize, interval: &str) -> String {
    format!("book_snapshot_{depth}_{interval}")
}
