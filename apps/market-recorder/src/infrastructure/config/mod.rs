//! Configuration Module
//!
//! Environment-driven configuration for the recorder service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_EXCHANGES, DEFAULT_SYMBOLS, DEFAULT_UPSTREAM_URL, FallbackSettings,
    FallbackTarget, RecorderConfig,
};
