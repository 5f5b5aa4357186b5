//! Parquet Fallback Writer
//!
//! Last line of defense for a batch the primary store rejected. The batch is
//! encoded as one ZSTD-compressed parquet file in a local spool directory,
//! uploaded to `{kind}/{symbol}/{timestamp}.parquet` and then removed. If the
//! upload fails the spool file stays on disk and the error is returned; it
//! is not retried.
//!
//! # Column Mapping
//!
//! | Column type | Arrow type |
//! |-------------|------------|
//! | Text        | `Utf8` |
//! | Numeric     | `Decimal128(38, 12)`, nullable |
//! | Timestamp   | `Timestamp(Microsecond, "UTC")` |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Decimal128Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;

use crate::application::ports::{BlobStorePort, FallbackError, FallbackPort};
use crate::domain::batch::{Batch, ColumnType, Value};
use crate::domain::market_data::EventKind;
use crate::domain::symbol::CanonicalSymbol;

/// Decimal precision of numeric columns.
pub const DECIMAL_PRECISION: u8 = 38;

/// Decimal scale of numeric columns.
pub const DECIMAL_SCALE: i8 = 12;

const ZSTD_LEVEL: i32 = 3;

/// Object key for a fallback file uploaded at `at`.
#[must_use]
pub fn object_key(kind: EventKind, symbol: &CanonicalSymbol, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}.parquet",
        kind.as_str(),
        symbol.as_str(),
        at.format("%Y%m%dT%H%M%S%.3fZ")
    )
}

/// Fallback writer backed by a blob store.
pub struct ParquetFallbackWriter {
    blob: Arc<dyn BlobStorePort>,
    spool_dir: PathBuf,
}

impl ParquetFallbackWriter {
    /// Create a writer that spools into `spool_dir`.
    #[must_use]
    pub fn new(blob: Arc<dyn BlobStorePort>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            blob,
            spool_dir: spool_dir.into(),
        }
    }

    /// Spool directory.
    #[must_use]
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    fn spool_path(&self, batch: &Batch, at: DateTime<Utc>) -> PathBuf {
        self.spool_dir.join(format!(
            "{}_{}_{}_{}.parquet",
            batch.kind.as_str(),
            batch.symbol.to_lowercase(),
            at.format("%Y%m%dT%H%M%S%3f"),
            uuid::Uuid::new_v4().simple()
        ))
    }
}

#[async_trait]
impl FallbackPort for ParquetFallbackWriter {
    /// Returns the object key, or an empty string for an empty batch.
    async fn write(&self, batch: &Batch) -> Result<String, FallbackError> {
        if batch.is_empty() {
            return Ok(String::new());
        }

        let now = Utc::now();
        let key = object_key(batch.kind, &batch.symbol, now);
        let path = self.spool_path(batch, now);

        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(|source| spool_error(&self.spool_dir, source))?;

        let record_batch = to_record_batch(batch)?;
        let encode_path = path.clone();
        tokio::task::spawn_blocking(move || write_parquet(&encode_path, &record_batch))
            .await
            .map_err(|e| FallbackError::Task(e.to_string()))??;

        let body = tokio::fs::read(&path)
            .await
            .map_err(|source| spool_error(&path, source))?;
        let size_bytes = body.len();

        if let Err(source) = self.blob.put(&key, Bytes::from(body)).await {
            return Err(FallbackError::Upload {
                key,
                path: path.display().to_string(),
                source,
            });
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove spool file");
        }

        tracing::info!(
            key = %key,
            location = %self.blob.location(),
            rows = batch.len(),
            size_bytes,
            "Fallback file uploaded"
        );
        Ok(key)
    }
}

fn spool_error(path: &Path, source: std::io::Error) -> FallbackError {
    FallbackError::Spool {
        path: path.display().to_string(),
        source,
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Arrow schema for a batch's column list.
#[must_use]
pub fn schema_for(batch: &Batch) -> SchemaRef {
    let fields: Vec<Field> = batch
        .columns
        .iter()
        .map(|column| {
            let data_type = match column.kind {
                ColumnType::Text => DataType::Utf8,
                ColumnType::Numeric => DataType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE),
                ColumnType::Timestamp => {
                    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
                }
            };
            Field::new(&column.name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

/// Convert a batch into one Arrow record batch.
///
/// # Errors
///
/// Returns [`FallbackError::Encode`] if a value does not match its column
/// type or a decimal does not fit the column's precision.
pub fn to_record_batch(batch: &Batch) -> Result<RecordBatch, FallbackError> {
    let schema = schema_for(batch);
    let arrays = batch
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let cells = batch.rows.iter().map(|row| row.get(idx));
            let array: ArrayRef = match column.kind {
                ColumnType::Text => Arc::new(
                    cells
                        .map(|cell| match cell {
                            Some(Value::Text(s)) => Ok(Some(s.as_str())),
                            other => Err(mismatch(&column.name, other)),
                        })
                        .collect::<Result<StringArray, _>>()?,
                ),
                ColumnType::Numeric => Arc::new(
                    cells
                        .map(|cell| match cell {
                            Some(Value::Numeric(None)) => Ok(None),
                            Some(Value::Numeric(Some(d))) => decimal_to_i128(*d)
                                .map(Some)
                                .ok_or_else(|| {
                                    FallbackError::Encode(format!(
                                        "{d} does not fit column {}",
                                        column.name
                                    ))
                                }),
                            other => Err(mismatch(&column.name, other)),
                        })
                        .collect::<Result<Decimal128Array, _>>()?
                        .with_precision_and_scale(DECIMAL_PRECISION, DECIMAL_SCALE)
                        .map_err(|e| FallbackError::Encode(e.to_string()))?,
                ),
                ColumnType::Timestamp => Arc::new(
                    cells
                        .map(|cell| match cell {
                            Some(Value::Timestamp(ts)) => Ok(Some(ts.timestamp_micros())),
                            other => Err(mismatch(&column.name, other)),
                        })
                        .collect::<Result<TimestampMicrosecondArray, _>>()?
                        .with_timezone("UTC"),
                ),
            };
            Ok(array)
        })
        .collect::<Result<Vec<_>, FallbackError>>()?;

    RecordBatch::try_new(schema, arrays).map_err(|e| FallbackError::Encode(e.to_string()))
}

fn mismatch(column: &str, value: Option<&Value>) -> FallbackError {
    FallbackError::Encode(format!("column {column}: unexpected value {value:?}"))
}

/// Fixed-point mantissa at [`DECIMAL_SCALE`], rounding extra digits.
fn decimal_to_i128(value: Decimal) -> Option<i128> {
    let scale = u32::try_from(DECIMAL_SCALE).ok()?;
    let rounded = value.round_dp(scale);
    10i128
        .checked_pow(scale - rounded.scale())
        .and_then(|factor| rounded.mantissa().checked_mul(factor))
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<(), FallbackError> {
    write_or_remove(path, |file| encode_parquet(file, batch))
}

/// Create `path` and fill it; a partly written file is removed on failure.
fn write_or_remove(
    path: &Path,
    encode: impl FnOnce(std::fs::File) -> Result<(), FallbackError>,
) -> Result<(), FallbackError> {
    let file = std::fs::File::create(path).map_err(|source| spool_error(path, source))?;
    encode(file).inspect_err(|_| {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial spool file");
        }
    })
}

fn encode_parquet(file: std::fs::File, batch: &RecordBatch) -> Result<(), FallbackError> {
    let level = ZstdLevel::try_new(ZSTD_LEVEL).map_err(|e| FallbackError::Encode(e.to_string()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(level))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .map_err(|e| FallbackError::Encode(e.to_string()))?;
    writer
        .write(batch)
        .map_err(|e| FallbackError::Encode(e.to_string()))?;
    writer
        .close()
        .map_err(|e| FallbackError::Encode(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::BatchBuilder;
    use crate::domain::market_data::{MarketEvent, OrderBookSnapshot, PriceLevel};
    use crate::domain::symbol::Exchange;
    use arrow::array::Array;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn book_batch() -> Batch {
        let symbol = CanonicalSymbol::parse("ETH_USDT").unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let book = OrderBookSnapshot {
            exchange: Exchange::Poloniex,
            symbol: symbol.clone(),
            timestamp: ts,
            local_timestamp: ts,
            bids: vec![PriceLevel::new(dec!(3000.5), dec!(1.25))],
            asks: vec![],
        };
        BatchBuilder::new(EventKind::OrderBook, symbol, 2)
            .unwrap()
            .build(vec![MarketEvent::OrderBook(book)])
    }

    #[test]
    fn key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(42);
        let symbol = CanonicalSymbol::parse("BTC_USDT").unwrap();
        assert_eq!(
            object_key(EventKind::Trade, &symbol, at),
            "trade/BTC_USDT/20240501T120000.042Z.parquet"
        );
    }

    #[test]
    fn decimals_are_scaled() {
        assert_eq!(decimal_to_i128(dec!(1)), Some(1_000_000_000_000));
        assert_eq!(decimal_to_i128(dec!(0.5)), Some(500_000_000_000));
        assert_eq!(
            decimal_to_i128(dec!(0.00000000000049)),
            Some(0),
            "digits past the scale are rounded"
        );
        assert_eq!(decimal_to_i128(dec!(-2.25)), Some(-2_250_000_000_000));
    }

    #[test]
    fn record_batch_matches_columns() {
        let batch = book_batch();
        let record = to_record_batch(&batch).unwrap();

        assert_eq!(record.num_rows(), 1);
        assert_eq!(record.num_columns(), batch.columns.len());
        assert_eq!(record.schema().field(0).name(), "exchange");
        assert_eq!(
            record.schema().field(4).data_type(),
            &DataType::Decimal128(38, 12)
        );

        let bid_px = record
            .column(4)
            .as_any()
            .downcast_ref::<Decimal128Array>()
            .unwrap();
        assert_eq!(bid_px.value(0), 3_000_500_000_000_000);

        // Missing ask level is null.
        let ask_px = record.column(6);
        assert!(ask_px.is_null(0));
    }

    #[test]
    fn type_mismatch_is_an_encode_error() {
        let mut batch = book_batch();
        batch.rows[0][0] = Value::Numeric(None);
        assert!(matches!(
            to_record_batch(&batch),
            Err(FallbackError::Encode(_))
        ));
    }

    #[test]
    fn failed_encode_removes_partial_file() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.parquet");
        let err = write_or_remove(&path, |mut file| {
            file.write_all(b"PAR1").unwrap();
            Err(FallbackError::Encode("writer closed".to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, FallbackError::Encode(_)));
        assert!(!path.exists());
    }

    #[test]
    fn encoded_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.parquet");
        let record = to_record_batch(&book_batch()).unwrap();

        write_parquet(&path, &record).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
