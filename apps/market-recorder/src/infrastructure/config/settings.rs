//! Recorder Configuration Settings
//!
//! Configuration types for the market recorder, loaded from environment
//! variables. Malformed numbers fall back to their defaults; malformed
//! symbols, exchanges, kinds and policies are errors.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::{
    FlushPolicy, FlushThresholds, OverflowPolicy, QueueSettings, WorkerConfig,
};
use crate::domain::market_data::EventKind;
use crate::domain::symbol::{CanonicalSymbol, Exchange};
use crate::infrastructure::fallback::S3Settings;
use crate::infrastructure::storage::PgStoreConfig;
use crate::infrastructure::upstream::{HeartbeatConfig, ReconnectConfig};

/// Default upstream endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "ws://localhost:8001/ws-stream-normalized";

/// Default tracked instruments.
pub const DEFAULT_SYMBOLS: &str =
    "BTC_USDT,ETH_USDT,XRP_USDT,SOL_USDT,DOGE_USDT,ADA_USDT,TRX_USDT,LTC_USDT,LINK_USDT";

/// Default tracked exchanges.
pub const DEFAULT_EXCHANGES: &str = "binance,coinbase,poloniex";

/// Where fallback files are uploaded.
#[derive(Debug, Clone)]
pub enum FallbackTarget {
    /// S3-compatible bucket.
    S3(S3Settings),
    /// Local directory.
    LocalDir(PathBuf),
}

impl FallbackTarget {
    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::S3(s3) => format!("s3://{}", s3.bucket),
            Self::LocalDir(dir) => dir.display().to_string(),
        }
    }
}

/// Fallback writer settings.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Upload target.
    pub target: FallbackTarget,
    /// Directory parquet files are written to before upload.
    pub spool_dir: PathBuf,
}

/// Complete recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Upstream WebSocket endpoint.
    pub upstream_url: String,
    /// Tracked instruments.
    pub symbols: Vec<CanonicalSymbol>,
    /// Tracked exchanges.
    pub exchanges: Vec<Exchange>,
    /// Subscribed event kinds.
    pub kinds: Vec<EventKind>,
    /// Order-book levels per side.
    pub book_depth: usize,
    /// Order-book snapshot interval suffix.
    pub snapshot_interval: String,
    /// Batch worker settings.
    pub worker: WorkerConfig,
    /// Ingestion queue settings.
    pub queue: QueueSettings,
    /// Upstream reconnect settings.
    pub reconnect: ReconnectConfig,
    /// Upstream heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// PostgreSQL pool settings.
    pub database: PgStoreConfig,
    /// Fallback writer settings.
    pub fallback: FallbackSettings,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl RecorderConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a list or
    /// policy value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`RecorderConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let symbols = env
            .list("RECORDER_SYMBOLS", DEFAULT_SYMBOLS)
            .iter()
            .map(|s| {
                CanonicalSymbol::parse(s).map_err(|e| invalid("RECORDER_SYMBOLS", s, &e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let exchanges = env
            .list("RECORDER_EXCHANGES", DEFAULT_EXCHANGES)
            .iter()
            .map(|s| s.parse::<Exchange>().map_err(|e| invalid("RECORDER_EXCHANGES", s, &e)))
            .collect::<Result<Vec<_>, _>>()?;

        let kinds = env
            .list("RECORDER_KINDS", "orderbook,trade")
            .iter()
            .map(|s| s.parse::<EventKind>().map_err(|e| invalid("RECORDER_KINDS", s, &e)))
            .collect::<Result<Vec<_>, _>>()?;

        for (key, empty) in [
            ("RECORDER_SYMBOLS", symbols.is_empty()),
            ("RECORDER_EXCHANGES", exchanges.is_empty()),
            ("RECORDER_KINDS", kinds.is_empty()),
        ] {
            if empty {
                return Err(ConfigError::EmptyValue(key.to_string()));
            }
        }

        let book_depth = env.parse("RECORDER_BOOK_DEPTH", 15usize).max(1);
        let defaults = FlushThresholds::default();
        let worker = WorkerConfig {
            thresholds: FlushThresholds {
                orderbook: FlushPolicy::new(
                    env.parse("RECORDER_ORDERBOOK_FLUSH_SIZE", defaults.orderbook.size_threshold),
                    env.secs(
                        "RECORDER_ORDERBOOK_FLUSH_INTERVAL_SECS",
                        defaults.orderbook.time_threshold,
                    ),
                ),
                trade: FlushPolicy::new(
                    env.parse("RECORDER_TRADE_FLUSH_SIZE", defaults.trade.size_threshold),
                    env.secs(
                        "RECORDER_TRADE_FLUSH_INTERVAL_SECS",
                        defaults.trade.time_threshold,
                    ),
                ),
            },
            poll_interval: env
                .millis("RECORDER_WORKER_POLL_INTERVAL_MS", WorkerConfig::default().poll_interval)
                .max(Duration::from_millis(1)),
            book_depth,
        };

        let queue_defaults = QueueSettings::default();
        let overflow = match env.get("RECORDER_QUEUE_OVERFLOW") {
            Some(value) => OverflowPolicy::from_str_case_insensitive(&value).ok_or_else(|| {
                invalid("RECORDER_QUEUE_OVERFLOW", &value, "expected block or drop_oldest")
            })?,
            None => queue_defaults.overflow,
        };
        let queue = QueueSettings {
            capacity: Some(env.parse("RECORDER_QUEUE_CAPACITY", 0usize)).filter(|&c| c > 0),
            overflow,
            high_water_mark: env.parse("RECORDER_QUEUE_HIGH_WATER", queue_defaults.high_water_mark),
        };

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            base_delay: env.secs("RECORDER_RECONNECT_BASE_SECS", reconnect_defaults.base_delay),
            max_delay: env.secs("RECORDER_RECONNECT_MAX_DELAY_SECS", reconnect_defaults.max_delay),
            jitter_factor: reconnect_defaults.jitter_factor,
            max_retries: env.parse("RECORDER_RECONNECT_MAX_RETRIES", reconnect_defaults.max_retries),
            retry_window: env.secs("RECORDER_RECONNECT_WINDOW_SECS", reconnect_defaults.retry_window),
            cooldown: env.secs("RECORDER_RECONNECT_COOLDOWN_SECS", reconnect_defaults.cooldown),
        };

        let heartbeat_defaults = HeartbeatConfig::default();
        // Zero would make the ping timer panic.
        let heartbeat = HeartbeatConfig {
            ping_interval: env
                .secs("RECORDER_HEARTBEAT_INTERVAL_SECS", heartbeat_defaults.ping_interval)
                .max(Duration::from_secs(1)),
            pong_timeout: env
                .secs("RECORDER_HEARTBEAT_TIMEOUT_SECS", heartbeat_defaults.pong_timeout)
                .max(Duration::from_secs(1)),
        };

        let mut database = PgStoreConfig::new(env.required("DATABASE_URL")?);
        database.max_connections = env.parse("RECORDER_DB_MAX_CONNECTIONS", database.max_connections);
        database.min_connections = env
            .parse("RECORDER_DB_MIN_CONNECTIONS", database.min_connections)
            .min(database.max_connections);
        database.acquire_timeout =
            env.secs("RECORDER_DB_ACQUIRE_TIMEOUT_SECS", database.acquire_timeout);

        let fallback = FallbackSettings {
            target: fallback_target(&env)?,
            spool_dir: env.get("RECORDER_FALLBACK_SPOOL_DIR").map_or_else(
                || std::env::temp_dir().join("market-recorder"),
                PathBuf::from,
            ),
        };

        Ok(Self {
            upstream_url: env
                .get("RECORDER_UPSTREAM_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            symbols,
            exchanges,
            kinds,
            book_depth,
            snapshot_interval: env
                .get("RECORDER_BOOK_SNAPSHOT_INTERVAL")
                .unwrap_or_else(|| "0ms".to_string()),
            worker,
            queue,
            reconnect,
            heartbeat,
            database,
            fallback,
            health_port: env.parse("RECORDER_HEALTH_PORT", 8083u16),
        })
    }
}

fn fallback_target(env: &Env<'_>) -> Result<FallbackTarget, ConfigError> {
    if let Some(bucket) = env.get("RECORDER_FALLBACK_BUCKET") {
        return Ok(FallbackTarget::S3(S3Settings {
            bucket,
            endpoint: env.get("RECORDER_FALLBACK_ENDPOINT"),
            region: env
                .get("RECORDER_FALLBACK_REGION")
                .unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: env.required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: env.required("AWS_SECRET_ACCESS_KEY")?,
        }));
    }
    env.get("RECORDER_FALLBACK_DIR")
        .map(|dir| FallbackTarget::LocalDir(PathBuf::from(dir)))
        .ok_or_else(|| {
            ConfigError::MissingEnvVar("RECORDER_FALLBACK_BUCKET or RECORDER_FALLBACK_DIR".to_string())
        })
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
        /// Parse failure.
        reason: String,
    },
}

fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Variable source with blank values treated as unset.
struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_else(|| default.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<RecorderConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RecorderConfig::from_lookup(|key| map.get(key).cloned())
    }

    const MINIMAL: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/recorder"),
        ("RECORDER_FALLBACK_DIR", "/var/lib/recorder/fallback"),
    ];

    #[test]
    fn defaults() {
        let config = config(&MINIMAL).unwrap();
        assert_eq!(config.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.symbols.len(), 9);
        assert_eq!(config.symbols[0].as_str(), "BTC_USDT");
        assert_eq!(
            config.exchanges,
            vec![Exchange::Binance, Exchange::Coinbase, Exchange::Poloniex]
        );
        assert_eq!(config.kinds, vec![EventKind::OrderBook, EventKind::Trade]);
        assert_eq!(config.book_depth, 15);
        assert_eq!(config.snapshot_interval, "0ms");
        assert_eq!(config.worker.thresholds, FlushThresholds::default());
        assert_eq!(config.worker.poll_interval, Duration::from_millis(100));
        assert_eq!(config.queue.capacity, None);
        assert_eq!(config.queue.overflow, OverflowPolicy::Block);
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.health_port, 8083);
        assert!(matches!(config.fallback.target, FallbackTarget::LocalDir(_)));
    }

    #[test]
    fn overrides() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("RECORDER_SYMBOLS", "btc-usdt, sol_usdt"),
            ("RECORDER_EXCHANGES", "okex,bybit"),
            ("RECORDER_KINDS", "trade"),
            ("RECORDER_TRADE_FLUSH_SIZE", "3"),
            ("RECORDER_TRADE_FLUSH_INTERVAL_SECS", "5"),
            ("RECORDER_QUEUE_CAPACITY", "1000"),
            ("RECORDER_QUEUE_OVERFLOW", "drop_oldest"),
            ("RECORDER_RECONNECT_COOLDOWN_SECS", "300"),
            ("RECORDER_DB_MAX_CONNECTIONS", "4"),
            ("RECORDER_DB_MIN_CONNECTIONS", "8"),
        ]);
        let config = config(&vars).unwrap();

        assert_eq!(config.symbols[0].as_str(), "BTC_USDT");
        assert_eq!(config.symbols[1].as_str(), "SOL_USDT");
        assert_eq!(config.exchanges, vec![Exchange::Okex, Exchange::Bybit]);
        assert_eq!(config.kinds, vec![EventKind::Trade]);
        assert_eq!(config.worker.thresholds.trade.size_threshold, 3);
        assert_eq!(config.worker.thresholds.trade.time_threshold, Duration::from_secs(5));
        assert_eq!(config.queue.capacity, Some(1000));
        assert_eq!(config.queue.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.reconnect.cooldown, Duration::from_secs(300));
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.min_connections, 4);
    }

    #[test]
    fn malformed_numbers_use_defaults() {
        let mut vars = MINIMAL.to_vec();
        vars.push(("RECORDER_HEALTH_PORT", "http"));
        vars.push(("RECORDER_BOOK_DEPTH", "-3"));
        let config = config(&vars).unwrap();
        assert_eq!(config.health_port, 8083);
        assert_eq!(config.book_depth, 15);
    }

    #[test]
    fn zero_intervals_are_raised() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("RECORDER_HEARTBEAT_INTERVAL_SECS", "0"),
            ("RECORDER_HEARTBEAT_TIMEOUT_SECS", "0"),
            ("RECORDER_WORKER_POLL_INTERVAL_MS", "0"),
        ]);
        let config = config(&vars).unwrap();
        assert_eq!(config.heartbeat.ping_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat.pong_timeout, Duration::from_secs(1));
        assert_eq!(config.worker.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn database_url_is_required() {
        let err = config(&[("RECORDER_FALLBACK_DIR", "/tmp/x")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "DATABASE_URL"));

        let err = config(&[("DATABASE_URL", " "), ("RECORDER_FALLBACK_DIR", "/tmp/x")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn fallback_target_is_required() {
        let err = config(&[("DATABASE_URL", "postgres://localhost/recorder")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn bucket_needs_credentials() {
        let vars = [
            ("DATABASE_URL", "postgres://localhost/recorder"),
            ("RECORDER_FALLBACK_BUCKET", "recorder-fallback"),
        ];
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::MissingEnvVar(key) if key == "AWS_ACCESS_KEY_ID"
        ));

        let mut vars = vars.to_vec();
        vars.extend([
            ("AWS_ACCESS_KEY_ID", "key"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("RECORDER_FALLBACK_ENDPOINT", "http://minio:9000"),
        ]);
        let config = config(&vars).unwrap();
        let FallbackTarget::S3(s3) = &config.fallback.target else {
            panic!("expected S3 target");
        };
        assert_eq!(s3.bucket, "recorder-fallback");
        assert_eq!(s3.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(config.fallback.target.describe(), "s3://recorder-fallback");
    }

    #[test]
    fn gcs_interop_bucket() {
        let vars = [
            ("DATABASE_URL", "postgres://localhost/recorder"),
            ("RECORDER_FALLBACK_BUCKET", "perps-fallback"),
            ("RECORDER_FALLBACK_ENDPOINT", "https://storage.googleapis.com"),
            ("RECORDER_FALLBACK_REGION", "auto"),
            ("AWS_ACCESS_KEY_ID", "GOOG1EXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "hmac-secret"),
        ];
        let config = config(&vars).unwrap();
        let FallbackTarget::S3(gcs) = &config.fallback.target else {
            panic!("expected S3 target");
        };
        assert_eq!(gcs.endpoint.as_deref(), Some("https://storage.googleapis.com"));
        assert_eq!(gcs.region, "auto");
        assert_eq!(gcs.access_key_id, "GOOG1EXAMPLE");
    }

    #[test]
    fn invalid_lists_are_errors() {
        let mut vars = MINIMAL.to_vec();
        vars.push(("RECORDER_EXCHANGES", "binance,kraken"));
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::InvalidValue { key, .. } if key == "RECORDER_EXCHANGES"
        ));

        let mut vars = MINIMAL.to_vec();
        vars.push(("RECORDER_QUEUE_OVERFLOW", "spill"));
        assert!(config(&vars).is_err());

        let mut vars = MINIMAL.to_vec();
        vars.push(("RECORDER_KINDS", " , "));
        assert!(matches!(
            config(&vars).unwrap_err(),
            ConfigError::EmptyValue(key) if key == "RECORDER_KINDS"
        ));
    }

    #[test]
    fn secrets_are_redacted() {
        let mut vars = MINIMAL.to_vec();
        vars[0] = ("DATABASE_URL", "postgres://user:hunter2@db/recorder");
        let debug = format!("{:?}", config(&vars).unwrap());
        assert!(!debug.contains("hunter2"));
    }
}
