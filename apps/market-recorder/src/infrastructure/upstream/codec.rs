//! Stream Decoder
//!
//! Turns one upstream text frame into typed market events. The exchange and
//! wire symbol of every message are translated to canonical form and all
//! timestamps are normalized here, so nothing downstream branches on wire
//! representations.
//!
//! A frame is either a single message object or an array of them.

use std::sync::Arc;

use chrono::Utc;

use super::messages::{
    BookSnapshotMessage, StreamMessage, TradeMessage, WireLevel, WireTimestamp,
};
use crate::domain::market_data::{MarketEvent, OrderBookSnapshot, PriceLevel, Trade};
use crate::domain::symbol::{CanonicalSymbol, Exchange, SymbolError, SymbolTranslator};
use crate::infrastructure::metrics;

/// Decoder errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message has no `type` field.
    #[error("message has no type")]
    MissingType,

    /// Required field is absent or null.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Timestamp could not be interpreted.
    #[error("invalid timestamp in {field}: {value:?}")]
    InvalidTimestamp {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: WireTimestamp,
    },

    /// Exchange id is unknown.
    #[error(transparent)]
    Symbol(#[from] SymbolError),

    /// Frame is neither an object nor an array.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Result of decoding one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A storable event.
    Event(MarketEvent),
    /// A message type that is not stored.
    Ignored(String),
}

/// Decoder bound to a symbol translator and book depth.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    translator: Arc<SymbolTranslator>,
    book_depth: usize,
}

impl StreamDecoder {
    /// Create a decoder that keeps at most `book_depth` levels per side.
    #[must_use]
    pub const fn new(translator: Arc<SymbolTranslator>, book_depth: usize) -> Self {
        Self {
            translator,
            book_depth,
        }
    }

    /// Decode a text frame.
    ///
    /// Each message in an array frame is decoded on its own, so a malformed
    /// element only drops itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object or array. Errors for
    /// individual messages are returned in place of that message.
    pub fn decode(&self, text: &str) -> Result<Vec<Result<Decoded, CodecError>>, CodecError> {
        let trimmed = text.trim();
        if trimmed.starts_with('[') {
            let values: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
            Ok(values
                .into_iter()
                .map(|value| self.decode_value(value))
                .collect())
        } else if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            Ok(vec![self.decode_value(value)])
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}..."
            )))
        }
    }

    /// Decode one message object.
    ///
    /// # Errors
    ///
    /// Returns an error if the message has no `type`, names an unknown
    /// exchange, lacks a required field or carries an unreadable timestamp.
    pub fn decode_value(&self, value: serde_json::Value) -> Result<Decoded, CodecError> {
        match parse_message(value)? {
            StreamMessage::BookSnapshot(msg) => self.book(msg).map(Decoded::Event),
            StreamMessage::Trade(msg) => self.trade(msg).map(Decoded::Event),
            StreamMessage::Other(kind) => Ok(Decoded::Ignored(kind)),
        }
    }

    fn book(&self, msg: BookSnapshotMessage) -> Result<MarketEvent, CodecError> {
        let exchange: Exchange = msg.exchange.parse()?;
        let symbol = self.canonical(exchange, &msg.symbol);
        let timestamp = to_utc("timestamp", &msg.timestamp)?;
        let local_timestamp = local_or_now(msg.local_timestamp.as_ref())?;

        let levels = |side: &[WireLevel]| -> Vec<PriceLevel> {
            side.iter()
                .take(self.book_depth)
                .map(|level| {
                    let (price, size) = level.parts();
                    PriceLevel::new(price, size)
                })
                .collect()
        };

        Ok(MarketEvent::OrderBook(OrderBookSnapshot {
            exchange,
            symbol,
            timestamp,
            local_timestamp,
            bids: levels(&msg.bids),
            asks: levels(&msg.asks),
        }))
    }

    fn trade(&self, msg: TradeMessage) -> Result<MarketEvent, CodecError> {
        let exchange: Exchange = msg.exchange.parse()?;
        let symbol = self.canonical(exchange, &msg.symbol);
        let trade_id = msg.id.ok_or(CodecError::MissingField("id"))?.into_string();
        let timestamp = to_utc("timestamp", &msg.timestamp)?;
        let local_timestamp = local_or_now(msg.local_timestamp.as_ref())?;

        Ok(MarketEvent::Trade(Trade {
            exchange,
            symbol,
            trade_id,
            price: msg.price,
            amount: msg.amount,
            side: msg.side.unwrap_or_default(),
            timestamp,
            local_timestamp,
        }))
    }

    fn canonical(&self, exchange: Exchange, wire: &str) -> CanonicalSymbol {
        if self.translator.lookup_inbound(exchange, wire).is_none() {
            metrics::record_unmapped_symbol(exchange);
        }
        self.translator.translate_inbound(exchange, wire)
    }
}

fn parse_message(value: serde_json::Value) -> Result<StreamMessage, CodecError> {
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();

    match kind.as_str() {
        "book_snapshot" => Ok(StreamMessage::BookSnapshot(serde_json::from_value(value)?)),
        "trade" => Ok(StreamMessage::Trade(serde_json::from_value(value)?)),
        _ => Ok(StreamMessage::Other(kind)),
    }
}

fn to_utc(
    field: &'static str,
    value: &WireTimestamp,
) -> Result<chrono::DateTime<Utc>, CodecError> {
    value.to_utc().ok_or_else(|| CodecError::InvalidTimestamp {
        field,
        value: value.clone(),
    })
}

// Receipt time defaults to now when the producer omits it.
fn local_or_now(value: Option<&WireTimestamp>) -> Result<chrono::DateTime<Utc>, CodecError> {
    value.map_or_else(|| Ok(Utc::now()), |v| to_utc("localTimestamp", v))
}

// =============================================================================
// Tests
// =============================================================================
