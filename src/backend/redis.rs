//! # Redis Backend
//!
//! Key-value and publish/subscribe over Redis. One configured endpoint selects
//! a multiplexed single-node connection; more than one selects cluster
//! addressing. Commands share one [`ReconnectingHandle`] that re-creates the
//! connection lazily after connection-class errors.
//!
//! Subscriptions always open a dedicated single-node pub/sub connection to the
//! broker endpoint (the first cache endpoint unless configured otherwise).

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, RedisError};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::reconnect::{Connector, ReconnectingHandle};
use super::{Broker, BrokerMessage, KeyValueStore, Subscription};
use crate::config::{BrokerConfig, CacheConfig};
use crate::error::{FetchError, FetchResult};
use crate::log_debug;
use crate::logging::Logger;

const SUBSCRIPTION_BUFFER: usize = 256;

/// A connection to a single node or a cluster
#[derive(Clone)]
pub enum RedisHandle {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisHandle::Single(_) => write!(f, "RedisHandle::Single"),
            RedisHandle::Cluster(_) => write!(f, "RedisHandle::Cluster"),
        }
    }
}

impl RedisHandle {
    async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T, RedisError> {
        match self {
            RedisHandle::Single(conn) => cmd.query_async(conn).await,
            RedisHandle::Cluster(conn) => cmd.query_async(conn).await,
        }
    }
}

enum Addressing {
    Single(redis::Client),
    Cluster(ClusterClient),
}

/// Opens [`RedisHandle`]s for the configured endpoints
pub struct RedisConnector {
    addressing: Addressing,
    endpoints: Vec<String>,
    connect_timeout: Duration,
}

impl fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnector")
            .field("endpoints", &self.target())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RedisConnector {
    pub fn from_config(config: &CacheConfig) -> FetchResult<Self> {
        let addressing = if config.is_cluster() {
            let nodes: Vec<String> = config
                .endpoints
                .iter()
                .map(|endpoint| redis_url(endpoint, None))
                .collect();
            Addressing::Cluster(ClusterClient::new(nodes).map_err(|e| {
                FetchError::configuration("cache.endpoints", format!("invalid cluster nodes: {e}"))
            })?)
        } else {
            let endpoint = config.endpoints.first().ok_or_else(|| {
                FetchError::configuration("cache.endpoints", "no backend endpoint configured")
            })?;
            Addressing::Single(open_client(endpoint, Some(config.database), "cache.endpoints")?)
        };

        Ok(Self {
            addressing,
            endpoints: config.endpoints.clone(),
            connect_timeout: config.response_timeout(),
        })
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.addressing, Addressing::Cluster(_))
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Handle = RedisHandle;

    async fn connect(&self) -> FetchResult<RedisHandle> {
        let connecting = async {
            match &self.addressing {
                Addressing::Single(client) => client
                    .get_multiplexed_async_connection()
                    .await
                    .map(RedisHandle::Single),
                Addressing::Cluster(client) => {
                    client.get_async_connection().await.map(RedisHandle::Cluster)
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(FetchError::backend_unavailable(format!(
                "Failed to connect to Redis at {}: {e}",
                self.target()
            ))),
            Err(_) => Err(FetchError::backend_unavailable(format!(
                "Timed out connecting to Redis at {} after {}ms",
                self.target(),
                self.connect_timeout.as_millis()
            ))),
        }
    }

    async fn probe(&self, handle: &RedisHandle) -> FetchResult<()> {
        let mut conn = handle.clone();
        let pong = tokio::time::timeout(self.connect_timeout, conn.query::<String>(&redis::cmd("PING")))
            .await
            .map_err(|_| FetchError::timeout("redis PING", self.connect_timeout))??;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(FetchError::backend_unavailable(format!(
                "unexpected PING reply: {pong}"
            )))
        }
    }

    fn target(&self) -> String {
        self.endpoints
            .iter()
            .map(|endpoint| redact_url(endpoint))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Redis-backed key-value store and broker
pub struct RedisBackend {
    handle: ReconnectingHandle<RedisConnector>,
    pubsub_client: redis::Client,
    pubsub_endpoint: String,
    response_timeout: Duration,
    logger: Logger,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("handle", &self.handle)
            .field("pubsub_endpoint", &redact_url(&self.pubsub_endpoint))
            .finish()
    }
}

impl RedisBackend {
    /// Build from configuration without touching the network
    pub fn from_config(
        cache: &CacheConfig,
        broker: &BrokerConfig,
        logger: Logger,
    ) -> FetchResult<Self> {
        let connector = RedisConnector::from_config(cache)?;
        let pubsub_endpoint = broker.resolved_endpoint(cache).ok_or_else(|| {
            FetchError::configuration("broker.endpoint", "no pub/sub endpoint configured")
        })?;
        let database = broker.endpoint.is_none().then_some(cache.database);
        let pubsub_client = open_client(pubsub_endpoint, database, "broker.endpoint")?;

        debug!(
            endpoints = %connector.target(),
            cluster = connector.is_cluster(),
            pubsub = %redact_url(pubsub_endpoint),
            "Redis backend configured"
        );

        Ok(Self {
            handle: ReconnectingHandle::new(connector, logger.for_component("reconnect")),
            pubsub_client,
            pubsub_endpoint: pubsub_endpoint.to_string(),
            response_timeout: cache.response_timeout(),
            logger,
        })
    }

    /// Build and verify the backend is reachable
    pub async fn connect(
        cache: &CacheConfig,
        broker: &BrokerConfig,
        logger: Logger,
    ) -> FetchResult<Self> {
        let backend = Self::from_config(cache, broker, logger)?;
        backend.handle.acquire().await?;
        Ok(backend)
    }

    pub fn reconnecting_handle(&self) -> &ReconnectingHandle<RedisConnector> {
        &self.handle
    }

    async fn run<T: FromRedisValue>(&self, operation: &'static str, cmd: Cmd) -> FetchResult<T> {
        let lease = self.handle.acquire().await?;
        let mut conn = lease.handle;

        match tokio::time::timeout(self.response_timeout, conn.query::<T>(&cmd)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if is_connection_error(&e) {
                    self.handle.invalidate(lease.generation);
                }
                Err(FetchError::backend_unavailable(format!(
                    "Redis {operation} failed: {e}"
                )))
            }
            Err(_) => {
                self.handle.invalidate(lease.generation);
                Err(FetchError::timeout(
                    format!("redis {operation}"),
                    self.response_timeout,
                ))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisBackend {
    async fn get(&self, key: &str) -> FetchResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<Vec<u8>> = self.run("GET", cmd).await?;
        log_debug!(self.logger, "redis GET", key: key, hit: value.is_some());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> FetchResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(px_millis(ttl));
        }
        let _: () = self.run("SET", cmd).await?;
        log_debug!(self.logger, "redis SET", key: key, ttl_ms: ttl.as_millis());
        Ok(())
    }

    async fn remove(&self, key: &str) -> FetchResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run("DEL", cmd).await?;
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl Broker for RedisBackend {
    async fn publish(&self, channel: &str, payload: &[u8]) -> FetchResult<u64> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        let receivers: u64 = self.run("PUBLISH", cmd).await?;
        log_debug!(self.logger, "redis PUBLISH", channel: channel, receivers: receivers);
        Ok(receivers)
    }

    async fn subscribe(&self, pattern: &str) -> FetchResult<Box<dyn Subscription>> {
        let mut pubsub = tokio::time::timeout(self.response_timeout, self.pubsub_client.get_async_pubsub())
            .await
            .map_err(|_| FetchError::timeout("redis pub/sub connect", self.response_timeout))??;
        tokio::time::timeout(self.response_timeout, pubsub.psubscribe(pattern))
            .await
            .map_err(|_| FetchError::timeout("redis PSUBSCRIBE", self.response_timeout))??;

        debug!(
            pattern = pattern,
            endpoint = %redact_url(&self.pubsub_endpoint),
            "Redis pattern subscription opened"
        );

        Ok(Box::new(RedisSubscription::start(pubsub, pattern)))
    }
}

/// A `PSUBSCRIBE` stream bridged into a channel by a forwarding task
pub struct RedisSubscription {
    pattern: String,
    receiver: mpsc::Receiver<BrokerMessage>,
    cancel: CancellationToken,
    closed: Option<oneshot::Receiver<FetchResult<()>>>,
}

impl RedisSubscription {
    fn start(mut pubsub: redis::aio::PubSub, pattern: &str) -> Self {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (closed_tx, closed_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut stream_ended = false;
            {
                use futures::StreamExt;
                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        message = messages.next() => match message {
                            Some(message) => {
                                let forwarded = BrokerMessage::new(
                                    message.get_channel_name(),
                                    message.get_payload_bytes(),
                                );
                                if sender.send(forwarded).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                stream_ended = true;
                                break;
                            }
                        }
                    }
                }
            }

            let result = if stream_ended {
                warn!(pattern = %task_pattern, "Redis subscription stream ended");
                Err(FetchError::backend_unavailable(
                    "subscription connection closed by server",
                ))
            } else {
                pubsub
                    .punsubscribe(task_pattern.as_str())
                    .await
                    .map_err(FetchError::from)
            };
            let _ = closed_tx.send(result);
        });

        Self {
            pattern: pattern.to_string(),
            receiver,
            cancel,
            closed: Some(closed_rx),
        }
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }

    async fn close(&mut self) -> FetchResult<()> {
        self.cancel.cancel();
        self.receiver.close();
        match self.closed.take() {
            Some(closed) => closed.await.unwrap_or_else(|_| {
                Err(FetchError::backend_unavailable(
                    "subscription task exited without reporting",
                ))
            }),
            None => Ok(()),
        }
    }

    fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// `PX` argument for a non-zero TTL; Redis rejects `PX 0`
fn px_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn is_connection_error(error: &RedisError) -> bool {
    error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
}

fn open_client(endpoint: &str, database: Option<i64>, component: &str) -> FetchResult<redis::Client> {
    redis::Client::open(redis_url(endpoint, database)).map_err(|e| {
        FetchError::configuration(
            component,
            format!("invalid endpoint {}: {e}", redact_url(endpoint)),
        )
    })
}

/// Turn `host:port` into a `redis://` URL; full URLs pass through
fn redis_url(endpoint: &str, database: Option<i64>) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("redis://")
        || endpoint.starts_with("rediss://")
        || endpoint.starts_with("unix://")
    {
        return endpoint.to_string();
    }
    match database {
        Some(db) if db != 0 => format!("redis://{endpoint}/{db}"),
        _ => format!("redis://{endpoint}"),
    }
}

/// Redact credentials from a Redis URL for logging
fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // `redis://host:port` has no credentials, only the scheme colon
            if url[..colon_pos].ends_with("redis") || url[..colon_pos].ends_with("rediss") {
                return url.to_string();
            }
            return format!("{}***{}", &url[..=colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
