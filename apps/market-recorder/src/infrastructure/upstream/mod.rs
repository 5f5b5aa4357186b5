//! Upstream normalized-stream adapter.
//!
//! - [`messages`]: wire types for inbound frames and the subscription filter
//! - [`codec`]: frame decoding into [`MarketEvent`](crate::domain::market_data::MarketEvent)s
//! - [`reconnect`]: exponential backoff with a windowed cooldown
//! - [`heartbeat`]: ping/pong liveness check
//! - [`consumer`]: the connection loop feeding the ingestion registry

pub mod codec;
pub mod consumer;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use codec::{CodecError, Decoded, StreamDecoder};
pub use consumer::{
    ConnectionState, ConsumerConfig, ConsumerError, ConsumerStatus, StreamConsumer,
    subscription_filters, subscription_url,
};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use messages::SubscriptionFilter;
pub use reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
