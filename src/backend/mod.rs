//! # Cache and Broker Backends
//!
//! The fetch client talks to its backend through two narrow contracts:
//! [`KeyValueStore`] (GET/SET/DEL with TTL) and [`Broker`] (publish plus
//! pattern subscriptions). [`RedisBackend`] implements both against a single
//! node or a cluster; [`MemoryBackend`] implements both in-process for tests
//! and embedded use.

pub mod memory;
pub mod pattern;
pub mod reconnect;
pub mod redis;

pub use memory::MemoryBackend;
pub use pattern::GlobPattern;
pub use reconnect::{Connector, Lease, ReconnectingHandle};
pub use redis::{RedisBackend, RedisConnector, RedisHandle};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::FetchResult;

/// Key-value contract of the cache backend
///
/// A missing key is `Ok(None)`, not an error. A zero TTL stores without expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> FetchResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> FetchResult<()>;

    async fn remove(&self, key: &str) -> FetchResult<()>;

    /// Short name used in logs
    fn provider_name(&self) -> &'static str;
}

/// Publish/subscribe contract of the broker backend
///
/// Delivery is at-most-once: a message published while nobody subscribes to
/// a matching pattern is lost.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    /// Publish `payload`, returning how many subscribers received it
    async fn publish(&self, channel: &str, payload: &[u8]) -> FetchResult<u64>;

    /// Subscribe to every channel matching a glob `pattern`
    async fn subscribe(&self, pattern: &str) -> FetchResult<Box<dyn Subscription>>;
}

/// An open pattern subscription
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the stream has ended
    async fn next_message(&mut self) -> Option<BrokerMessage>;

    /// Unsubscribe and release the connection
    async fn close(&mut self) -> FetchResult<()>;

    fn pattern(&self) -> &str;
}

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}
