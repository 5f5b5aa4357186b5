//! Instrument Symbols
//!
//! Canonical instrument identifiers and the per-exchange translation to and
//! from the wire symbols used by the upstream stream.
//!
//! # Canonical Form
//!
//! A [`CanonicalSymbol`] is `BASE_QUOTE`, upper-cased and underscore
//! delimited (`BTC_USDT`). It is the queue key and the table-name suffix
//! for every downstream component.
//!
//! # Exchange Rules
//!
//! | Exchange | Rule | `BTC_USDT` |
//! |----------|------|------------|
//! | binance, binance-us, binance-futures | merged lower-case | `btcusdt` |
//! | bybit | merged upper-case | `BTCUSDT` |
//! | coinbase | hyphenated, USDT quoted as USD | `BTC-USD` |
//! | okex | hyphenated | `BTC-USDT` |
//! | poloniex | underscore-joined | `BTC_USDT` |
//! | hyperliquid | base only | `BTC` |

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while parsing symbols or building the translator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Symbol string is not of the form `BASE<sep>QUOTE`.
    #[error("invalid instrument symbol: {0:?}")]
    InvalidSymbol(String),

    /// Exchange identifier is not one of the supported venues.
    #[error("unknown exchange: {0:?}")]
    UnknownExchange(String),

    /// Two instruments format to the same wire symbol on one exchange.
    #[error("{exchange}: {first} and {second} both map to wire symbol {wire:?}")]
    Collision {
        /// Exchange on which the collision occurs.
        exchange: Exchange,
        /// Colliding wire symbol.
        wire: String,
        /// Instrument registered first.
        first: CanonicalSymbol,
        /// Instrument that collided.
        second: CanonicalSymbol,
    },

    /// Instrument is not tracked on the exchange.
    #[error("{symbol} is not tracked on {exchange}")]
    NotTracked {
        /// Exchange that was queried.
        exchange: Exchange,
        /// Instrument that was queried.
        symbol: CanonicalSymbol,
    },
}

// =============================================================================
// Canonical Symbol
// =============================================================================

/// Normalized instrument key, `BASE_QUOTE` upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalSymbol(String);

impl CanonicalSymbol {
    /// Build a symbol from its base and quote assets.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::InvalidSymbol`] if either asset is empty or
    /// contains anything other than ASCII letters and digits.
    pub fn new(base: &str, quote: &str) -> Result<Self, SymbolError> {
        let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(base) || !valid(quote) {
            return Err(SymbolError::InvalidSymbol(format!("{base}_{quote}")));
        }
        Ok(Self(format!(
            "{}_{}",
            base.to_ascii_uppercase(),
            quote.to_ascii_uppercase()
        )))
    }

    /// Parse `BTC_USDT`, `btc-usdt` or `BTC/USDT`.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::InvalidSymbol`] if the string has no single
    /// separator or either side is not alphanumeric.
    pub fn parse(s: &str) -> Result<Self, SymbolError> {
        let trimmed = s.trim();
        let mut parts = trimmed.split(['_', '-', '/']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) => Self::new(base, quote),
            _ => Err(SymbolError::InvalidSymbol(trimmed.to_string())),
        }
    }

    /// Wrap a wire symbol that has no canonical mapping.
    ///
    /// The string is kept exactly as received so that the unmapped instrument
    /// stays visible in logs; it never matches a registered queue.
    #[must_use]
    pub fn unmapped(wire: &str) -> Self {
        Self(wire.to_string())
    }

    /// Base asset (`BTC` for `BTC_USDT`).
    #[must_use]
    pub fn base(&self) -> &str {
        self.0.split_once('_').map_or(self.0.as_str(), |(b, _)| b)
    }

    /// Quote asset (`USDT` for `BTC_USDT`).
    #[must_use]
    pub fn quote(&self) -> &str {
        self.0.split_once('_').map_or("", |(_, q)| q)
    }

    /// The canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased form used in table names and object keys.
    #[must_use]
    pub fn to_lowercase(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CanonicalSymbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// Exchange
// =============================================================================

/// Venues known to the upstream normalized stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Exchange {
    /// Binance spot.
    Binance,
    /// Binance US.
    BinanceUs,
    /// Binance USD-M futures.
    BinanceFutures,
    /// Bybit.
    Bybit,
    /// Coinbase.
    Coinbase,
    /// OKX.
    Okex,
    /// Poloniex.
    Poloniex,
    /// Hyperliquid perpetuals.
    Hyperliquid,
}

impl Exchange {
    /// All supported venues.
    pub const ALL: [Self; 8] = [
        Self::Binance,
        Self::BinanceUs,
        Self::BinanceFutures,
        Self::Bybit,
        Self::Coinbase,
        Self::Okex,
        Self::Poloniex,
        Self::Hyperliquid,
    ];

    /// Identifier used by the upstream stream.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::BinanceUs => "binance-us",
            Self::BinanceFutures => "binance-futures",
            Self::Bybit => "bybit",
            Self::Coinbase => "coinbase",
            Self::Okex => "okex",
            Self::Poloniex => "poloniex",
            Self::Hyperliquid => "hyperliquid",
        }
    }

    /// Format a base/quote pair as this exchange's wire symbol.
    #[must_use]
    pub fn format(&self, base: &str, quote: &str) -> String {
        let base_upper = base.to_ascii_uppercase();
        let quote_upper = quote.to_ascii_uppercase();
        match self {
            Self::Binance | Self::BinanceUs | Self::BinanceFutures => {
                format!("{base_upper}{quote_upper}").to_ascii_lowercase()
            }
            Self::Bybit => format!("{base_upper}{quote_upper}"),
            Self::Coinbase => {
                let quote = if quote_upper == "USDT" {
                    "USD"
                } else {
                    quote_upper.as_str()
                };
                format!("{base_upper}-{quote}")
            }
            Self::Okex => format!("{base_upper}-{quote_upper}"),
            Self::Poloniex => format!("{base_upper}_{quote_upper}"),
            Self::Hyperliquid => base_upper,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == lower)
            .ok_or_else(|| SymbolError::UnknownExchange(s.to_string()))
    }
}

// =============================================================================
// Translator
// =============================================================================

/// Bidirectional canonical/wire symbol mapping, fixed at startup.
#[derive(Debug, Clone)]
pub struct SymbolTranslator {
    instruments: Vec<CanonicalSymbol>,
    exchanges: Vec<Exchange>,
    outbound: HashMap<(Exchange, CanonicalSymbol), String>,
    // Keyed by the upper-cased wire symbol so lookups ignore case.
    inbound: HashMap<(Exchange, String), CanonicalSymbol>,
}

impl SymbolTranslator {
    /// Build the mapping for every instrument on every exchange.
    ///
    /// Duplicate instruments or exchanges are ignored; order is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::Collision`] if two instruments produce the
    /// same wire symbol on one exchange.
    pub fn new(
        instruments: impl IntoIterator<Item = CanonicalSymbol>,
        exchanges: impl IntoIterator<Item = Exchange>,
    ) -> Result<Self, SymbolError> {
        let mut unique_instruments: Vec<CanonicalSymbol> = Vec::new();
        for symbol in instruments {
            if !unique_instruments.contains(&symbol) {
                unique_instruments.push(symbol);
            }
        }
        let mut unique_exchanges: Vec<Exchange> = Vec::new();
        for exchange in exchanges {
            if !unique_exchanges.contains(&exchange) {
                unique_exchanges.push(exchange);
            }
        }

        let mut outbound = HashMap::new();
        let mut inbound: HashMap<(Exchange, String), CanonicalSymbol> = HashMap::new();

        for &exchange in &unique_exchanges {
            for symbol in &unique_instruments {
                let wire = exchange.format(symbol.base(), symbol.quote());
                let key = (exchange, wire.to_ascii_uppercase());
                if let Some(first) = inbound.get(&key) {
                    return Err(SymbolError::Collision {
                        exchange,
                        wire,
                        first: first.clone(),
                        second: symbol.clone(),
                    });
                }
                inbound.insert(key, symbol.clone());
                outbound.insert((exchange, symbol.clone()), wire);
            }
        }

        Ok(Self {
            instruments: unique_instruments,
            exchanges: unique_exchanges,
            outbound,
            inbound,
        })
    }

    /// Tracked instruments in configuration order.
    #[must_use]
    pub fn instruments(&self) -> &[CanonicalSymbol] {
        &self.instruments
    }

    /// Tracked exchanges in configuration order.
    #[must_use]
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Wire symbol for a tracked instrument.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError::NotTracked`] if the pair was not configured.
    pub fn translate_outbound(
        &self,
        exchange: Exchange,
        symbol: &CanonicalSymbol,
    ) -> Result<&str, SymbolError> {
        self.outbound
            .get(&(exchange, symbol.clone()))
            .map(String::as_str)
            .ok_or_else(|| SymbolError::NotTracked {
                exchange,
                symbol: symbol.clone(),
            })
    }

    /// Wire symbols to subscribe to on `exchange`, in instrument order.
    #[must_use]
    pub fn outbound_symbols(&self, exchange: Exchange) -> Vec<&str> {
        self.instruments
            .iter()
            .filter_map(|s| self.translate_outbound(exchange, s).ok())
            .collect()
    }

    /// Canonical symbol for an inbound wire symbol.
    ///
    /// Unknown symbols are returned unchanged and logged.
    #[must_use]
    pub fn translate_inbound(&self, exchange: Exchange, wire: &str) -> CanonicalSymbol {
        if let Some(symbol) = self.lookup_inbound(exchange, wire) {
            return symbol.clone();
        }
        tracing::warn!(
            exchange = %exchange,
            wire_symbol = wire,
            "Unmapped inbound symbol"
        );
        CanonicalSymbol::unmapped(wire)
    }

    /// Reverse lookup without the unmapped fallback.
    #[must_use]
    pub fn lookup_inbound(&self, exchange: Exchange, wire: &str) -> Option<&CanonicalSymbol> {
        self.inbound
            .get(&(exchange, wire.trim().to_ascii_uppercase()))
    }
}

// =============================================================================
// Tests
// =============================================================================
