//! Market Data Events
//!
//! Normalized order-book snapshots and trades, as produced by the stream
//! decoder and consumed by the persistence workers. Timestamps are already
//! canonical UTC instants; prices and sizes are exact decimals.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::symbol::{CanonicalSymbol, Exchange};

// =============================================================================
// Event Kind
// =============================================================================

/// Category of market-data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Order-book snapshot.
    #[serde(alias = "book_snapshot")]
    OrderBook,
    /// Individual trade.
    Trade,
}

impl EventKind {
    /// Both kinds, in table-creation order.
    pub const ALL: [Self; 2] = [Self::OrderBook, Self::Trade];

    /// Table prefix and fallback path segment.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OrderBook => "orderbook",
            Self::Trade => "trade",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognized event kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0:?}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orderbook" | "order_book" | "book_snapshot" => Ok(Self::OrderBook),
            "trade" | "trades" => Ok(Self::Trade),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

// =============================================================================
// Order Book
// =============================================================================

/// One side of one price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Size resting at the price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Top-of-book snapshot, best level first on both sides.
///
/// `bids` and `asks` hold at most the configured depth; levels the
/// exchange did not send are simply absent and render as nulls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookSnapshot {
    /// Source exchange.
    pub exchange: Exchange,
    /// Canonical instrument.
    pub symbol: CanonicalSymbol,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
    /// Local receipt timestamp.
    pub local_timestamp: DateTime<Utc>,
    /// Bid levels, best first.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best first.
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// Bid level `i`, if present.
    #[must_use]
    pub fn bid(&self, i: usize) -> Option<&PriceLevel> {
        self.bids.get(i)
    }

    /// Ask level `i`, if present.
    #[must_use]
    pub fn ask(&self, i: usize) -> Option<&PriceLevel> {
        self.asks.get(i)
    }
}

// =============================================================================
// Trade
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buyer was the aggressor.
    Buy,
    /// Seller was the aggressor.
    Sell,
    /// Not reported by the exchange.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Side {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Unknown => "unknown",
        }
    }
}

/// Single executed trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    /// Source exchange.
    pub exchange: Exchange,
    /// Canonical instrument.
    pub symbol: CanonicalSymbol,
    /// Identifier unique within (exchange, symbol).
    pub trade_id: String,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity.
    pub amount: Decimal,
    /// Aggressor side.
    pub side: Side,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
    /// Local receipt timestamp.
    pub local_timestamp: DateTime<Utc>,
}

// =============================================================================
// Market Event
// =============================================================================

/// Key of one ingestion queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    /// Canonical instrument.
    pub symbol: CanonicalSymbol,
    /// Event kind.
    pub kind: EventKind,
}

impl QueueKey {
    /// Create a new key.
    #[must_use]
    pub const fn new(symbol: CanonicalSymbol, kind: EventKind) -> Self {
        Self { symbol, kind }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.symbol)
    }
}

/// A decoded upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    /// Order-book snapshot.
    OrderBook(OrderBookSnapshot),
    /// Trade.
    Trade(Trade),
}

impl MarketEvent {
    /// Event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::OrderBook(_) => EventKind::OrderBook,
            Self::Trade(_) => EventKind::Trade,
        }
    }

    /// Canonical instrument.
    #[must_use]
    pub const fn symbol(&self) -> &CanonicalSymbol {
        match self {
            Self::OrderBook(book) => &book.symbol,
            Self::Trade(trade) => &trade.symbol,
        }
    }

    /// Source exchange.
    #[must_use]
    pub const fn exchange(&self) -> Exchange {
        match self {
            Self::OrderBook(book) => book.exchange,
            Self::Trade(trade) => trade.exchange,
        }
    }

    /// Queue this event belongs to.
    #[must_use]
    pub fn queue_key(&self) -> QueueKey {
        QueueKey::new(self.symbol().clone(), self.kind())
    }
}
