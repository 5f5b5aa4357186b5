//! Storage Batches
//!
//! A [`Batch`] is the unit handed to storage and, on failure, to the
//! fallback writer: a destination table, an ordered column list and rows of
//! typed values in that column order.
//!
//! # Table Layout
//!
//! - `orderbook_<symbol>`: `exchange, symbol, timestamp, local_timestamp`,
//!   then `bid_{i}_px, bid_{i}_sz, ask_{i}_px, ask_{i}_sz` for each level
//! - `trade_<symbol>`: `exchange, symbol, trade_id, price, amount, side,
//!   timestamp, local_timestamp`

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::market_data::{EventKind, MarketEvent, OrderBookSnapshot, Trade};
use crate::domain::symbol::CanonicalSymbol;

// =============================================================================
// Columns and Values
// =============================================================================

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Text.
    Text,
    /// Nullable exact numeric.
    Numeric,
    /// UTC timestamp.
    Timestamp,
}

/// Named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type.
    pub kind: ColumnType,
}

impl Column {
    fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Text value.
    Text(String),
    /// Numeric value; `None` is SQL `NULL`.
    Numeric(Option<Decimal>),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
}

// =============================================================================
// Table Names
// =============================================================================

/// Validated destination table name, `<kind>_<symbol lower-case>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

/// Error for a table name that is not a safe identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid table name: {0:?}")]
pub struct InvalidTableName(pub String);

impl TableName {
    /// Table for an event kind and instrument.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTableName`] if the symbol does not reduce to
    /// `[a-z0-9_]`, e.g. an unmapped wire symbol.
    pub fn for_kind(kind: EventKind, symbol: &CanonicalSymbol) -> Result<Self, InvalidTableName> {
        Self::parse(&format!("{}_{}", kind.as_str(), symbol.to_lowercase()))
    }

    /// Validate an arbitrary identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTableName`] unless the name is non-empty, at most 63
    /// bytes and only lower-case ASCII letters, digits and underscores.
    pub fn parse(name: &str) -> Result<Self, InvalidTableName> {
        if is_safe_identifier(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(InvalidTableName(name.to_string()))
        }
    }

    /// The table name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case ASCII identifier that fits PostgreSQL's 63-byte limit.
#[must_use]
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

// =============================================================================
// Batch
// =============================================================================

/// Rows destined for one table in one insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Event kind of every row.
    pub kind: EventKind,
    /// Instrument of every row.
    pub symbol: CanonicalSymbol,
    /// Destination table.
    pub table: TableName,
    /// Column order shared by every row.
    pub columns: Vec<Column>,
    /// Row values, in column order.
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Turns drained events into storage batches for one queue.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    kind: EventKind,
    symbol: CanonicalSymbol,
    table: TableName,
    columns: Vec<Column>,
    book_depth: usize,
}

impl BatchBuilder {
    /// Builder for the queue `(kind, symbol)` with `book_depth` levels per side.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTableName`] if the symbol cannot name a table.
    pub fn new(
        kind: EventKind,
        symbol: CanonicalSymbol,
        book_depth: usize,
    ) -> Result<Self, InvalidTableName> {
        let table = TableName::for_kind(kind, &symbol)?;
        let columns = match kind {
            EventKind::OrderBook => orderbook_columns(book_depth),
            EventKind::Trade => trade_columns(),
        };
        Ok(Self {
            kind,
            symbol,
            table,
            columns,
            book_depth,
        })
    }

    /// Destination table.
    #[must_use]
    pub const fn table(&self) -> &TableName {
        &self.table
    }

    /// Column list shared by every batch from this builder.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Assemble one batch, preserving event order.
    ///
    /// Events of the other kind are skipped; the registry never routes them
    /// here.
    #[must_use]
    pub fn build(&self, events: Vec<MarketEvent>) -> Batch {
        let rows = events
            .into_iter()
            .filter_map(|event| match (self.kind, event) {
                (EventKind::OrderBook, MarketEvent::OrderBook(book)) => {
                    Some(orderbook_row(&book, self.book_depth))
                }
                (EventKind::Trade, MarketEvent::Trade(trade)) => Some(trade_row(trade)),
                _ => None,
            })
            .collect();

        Batch {
            kind: self.kind,
            symbol: self.symbol.clone(),
            table: self.table.clone(),
            columns: self.columns.clone(),
            rows,
        }
    }
}

fn orderbook_columns(depth: usize) -> Vec<Column> {
    let mut columns = vec![
        Column::new("exchange", ColumnType::Text),
        Column::new("symbol", ColumnType::Text),
        Column::new("timestamp", ColumnType::Timestamp),
        Column::new("local_timestamp", ColumnType::Timestamp),
    ];
    for i in 0..depth {
        columns.push(Column::new(format!("bid_{i}_px"), ColumnType::Numeric));
        columns.push(Column::new(format!("bid_{i}_sz"), ColumnType::Numeric));
        columns.push(Column::new(format!("ask_{i}_px"), ColumnType::Numeric));
        columns.push(Column::new(format!("ask_{i}_sz"), ColumnType::Numeric));
    }
    columns
}

fn trade_columns() -> Vec<Column> {
    vec![
        Column::new("exchange", ColumnType::Text),
        Column::new("symbol", ColumnType::Text),
        Column::new("trade_id", ColumnType::Text),
        Column::new("price", ColumnType::Numeric),
        Column::new("amount", ColumnType::Numeric),
        Column::new("side", ColumnType::Text),
        Column::new("timestamp", ColumnType::Timestamp),
        Column::new("local_timestamp", ColumnType::Timestamp),
    ]
}

fn orderbook_row(book: &OrderBookSnapshot, depth: usize) -> Vec<Value> {
    let mut row = Vec::with_capacity(4 + depth * 4);
    row.push(Value::Text(book.exchange.as_str().to_string()));
    row.push(Value::Text(book.symbol.as_str().to_string()));
    row.push(Value::Timestamp(book.timestamp));
    row.push(Value::Timestamp(book.local_timestamp));
    for i in 0..depth {
        let bid = book.bid(i);
        let ask = book.ask(i);
        row.push(Value::Numeric(bid.map(|l| l.price)));
        row.push(Value::Numeric(bid.map(|l| l.size)));
        row.push(Value::Numeric(ask.map(|l| l.price)));
        row.push(Value::Numeric(ask.map(|l| l.size)));
    }
    row
}

fn trade_row(trade: Trade) -> Vec<Value> {
    vec![
        Value::Text(trade.exchange.as_str().to_string()),
        Value::Text(trade.symbol.as_str().to_string()),
        Value::Text(trade.trade_id),
        Value::Numeric(Some(trade.price)),
        Value::Numeric(Some(trade.amount)),
        Value::Text(trade.side.as_str().to_string()),
        Value::Timestamp(trade.timestamp),
        Value::Timestamp(trade.local_timestamp),
    ]
}
