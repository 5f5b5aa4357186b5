//! PostgreSQL Batch Store
//!
//! [`BatchStorePort`] over a sqlx [`PgPool`]. Each batch is written inside
//! one transaction as one or more multi-row `INSERT ... VALUES` statements,
//! split so no statement exceeds the protocol's bind-parameter limit.
//!
//! Tables are provisioned outside this process; a missing table surfaces as
//! a backend error like any other.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

use crate::application::ports::{BatchStorePort, StorageError};
use crate::domain::batch::{Batch, Value, is_safe_identifier};

/// Maximum bind parameters in one PostgreSQL statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Connection pool settings.
#[derive(Clone)]
pub struct PgStoreConfig {
    /// Connection string.
    pub database_url: String,
    /// Upper bound of pooled connections.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// Wait for a free connection before failing.
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for PgStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStoreConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl PgStoreConfig {
    /// Settings with the default pool size (1..=10, 30 s acquire timeout).
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Pooled PostgreSQL batch store.
#[derive(Debug, Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    /// Open the pool and verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if no connection can be established.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(backend)?;

        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "PostgreSQL pool ready"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
    }
}

#[async_trait]
impl BatchStorePort for PgBatchStore {
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StorageError> {
        validate(batch)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let prefix = insert_prefix(batch);
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut written = 0;

        for chunk in batch.rows.chunks(rows_per_statement(batch.columns.len())) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(&prefix);
            builder.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        Value::Text(text) => b.push_bind(text.as_str()),
                        Value::Numeric(number) => b.push_bind(*number),
                        Value::Timestamp(ts) => b.push_bind(*ts),
                    };
                }
            });
            let result = builder.build().execute(&mut *tx).await.map_err(backend)?;
            written += result.rows_affected();
        }

        // Dropping an uncommitted transaction rolls it back.
        tx.commit().await.map_err(backend)?;
        Ok(written)
    }
}

/// Whether `err` is a unique-constraint violation reported by PostgreSQL.
#[must_use]
pub fn is_unique_violation(err: &StorageError) -> bool {
    match err {
        StorageError::Backend(source) => source
            .downcast_ref::<sqlx::Error>()
            .and_then(sqlx::Error::as_database_error)
            .is_some_and(|db| db.is_unique_violation()),
        _ => false,
    }
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(Box::new(err))
}

/// Check identifiers and row shapes before touching the pool.
fn validate(batch: &Batch) -> Result<(), StorageError> {
    if let Some(bad) = batch.columns.iter().find(|c| !is_safe_identifier(&c.name)) {
        return Err(StorageError::InvalidColumn(bad.name.clone()));
    }
    let expected = batch.columns.len();
    if let Some((row, values)) = batch
        .rows
        .iter()
        .enumerate()
        .find(|(_, values)| values.len() != expected)
    {
        return Err(StorageError::RowShape {
            row,
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

/// `INSERT INTO "table" ("a", "b") ` with quoted identifiers.
fn insert_prefix(batch: &Batch) -> String {
    let columns = batch
        .columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO \"{}\" ({columns}) ", batch.table)
}

fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}
