//! # In-Memory Backend
//!
//! Process-local implementation of both [`KeyValueStore`] and [`Broker`] for
//! testing and embedded use.
//!
//! ## Features
//!
//! - **TTL expiry**: entries expire passively on read, on the tokio clock, so
//!   paused-time tests can step past a TTL
//! - **Pattern subscriptions**: glob patterns matched like `PSUBSCRIBE`
//! - **Fault injection**: an availability toggle, failing writes and read latency
//! - **Publish log**: every published message is recorded for assertions

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Broker, BrokerMessage, GlobPattern, KeyValueStore, Subscription};
use crate::error::{FetchError, FetchResult};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug)]
struct Subscriber {
    pattern: GlobPattern,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: DashMap<String, Entry>,
    subscribers: DashMap<u64, Subscriber>,
    next_subscriber: AtomicU64,
    published: Mutex<Vec<BrokerMessage>>,
    unavailable: AtomicBool,
    failing_writes: AtomicBool,
    read_latency_ms: AtomicU64,
}

/// In-memory key-value store and broker
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `BackendUnavailable`
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make `set` fail while reads keep working
    pub fn set_failing_writes(&self, failing: bool) {
        self.inner.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Delay every `get` by `latency`
    pub fn set_read_latency(&self, latency: Duration) {
        self.inner
            .read_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Messages published so far, oldest first
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.inner.published.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// End every open subscription stream, as a dropped connection would
    pub fn disconnect_subscribers(&self) {
        self.inner.subscribers.clear();
    }

    /// Number of unexpired entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self, operation: &str) -> FetchResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(FetchError::backend_unavailable(format!(
                "memory backend offline during {operation}"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryBackend {
    async fn get(&self, key: &str) -> FetchResult<Option<Vec<u8>>> {
        let latency = self.inner.read_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_available("GET")?;

        let now = Instant::now();
        let found = self
            .inner
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));

        match found {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.inner.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> FetchResult<()> {
        self.check_available("SET")?;
        if self.inner.failing_writes.load(Ordering::SeqCst) {
            return Err(FetchError::backend_unavailable("memory backend rejected SET"));
        }

        let expires_at = (!ttl.is_zero())
            .then(|| Instant::now().checked_add(ttl))
            .flatten();
        self.inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> FetchResult<()> {
        self.check_available("DEL")?;
        self.inner.entries.remove(key);
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl Broker for MemoryBackend {
    async fn publish(&self, channel: &str, payload: &[u8]) -> FetchResult<u64> {
        self.check_available("PUBLISH")?;

        let message = BrokerMessage::new(channel, payload);
        self.inner.published.lock().push(message.clone());

        let mut receivers = 0;
        self.inner.subscribers.retain(|_, subscriber| {
            if !subscriber.pattern.matches(channel) {
                return !subscriber.sender.is_closed();
            }
            match subscriber.sender.send(message.clone()) {
                Ok(()) => {
                    receivers += 1;
                    true
                }
                Err(_) => false,
            }
        });
        Ok(receivers)
    }

    async fn subscribe(&self, pattern: &str) -> FetchResult<Box<dyn Subscription>> {
        self.check_available("PSUBSCRIBE")?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(
            id,
            Subscriber {
                pattern: GlobPattern::new(pattern)?,
                sender,
            },
        );

        Ok(Box::new(MemorySubscription {
            id,
            pattern: pattern.to_string(),
            receiver,
            backend: self.clone(),
        }))
    }
}

/// Subscription handed out by [`MemoryBackend`]
#[derive(Debug)]
pub struct MemorySubscription {
    id: u64,
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
    backend: MemoryBackend,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }

    async fn close(&mut self) -> FetchResult<()> {
        self.backend.inner.subscribers.remove(&self.id);
        self.receiver.close();
        self.backend.check_available("PUNSUBSCRIBE")
    }

    fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.backend.inner.subscribers.remove(&self.id);
    }
}
