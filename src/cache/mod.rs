//! # Cache Client
//!
//! A prefixable facade over a [`KeyValueStore`]. Every key passed in is
//! rewritten as `prefix + key` before it reaches the backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::KeyValueStore;
use crate::error::FetchResult;
use crate::log_debug;
use crate::logging::Logger;

#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    logger: Logger,
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("provider", &self.store.provider_name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl CacheClient {
    pub fn new(store: Arc<dyn KeyValueStore>, logger: Logger) -> Self {
        Self {
            store,
            prefix: String::new(),
            logger,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.set_prefix(prefix);
        self
    }

    /// Prefix applied to every subsequent key
    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The key as stored in the backend
    pub fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Look up a key; a missing key is `Ok(None)`
    pub async fn get(&self, key: &str) -> FetchResult<Option<Vec<u8>>> {
        let value = self.store.get(&self.prefixed(key)).await?;
        log_debug!(
            self.logger,
            if value.is_some() { "cache hit" } else { "cache miss" },
            key: key
        );
        Ok(value)
    }

    /// Store a value; a zero `ttl` stores without expiry
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> FetchResult<()> {
        self.store.set(&self.prefixed(key), value, ttl).await?;
        log_debug!(self.logger, "cache set", key: key, bytes: value.len(), ttl_secs: ttl.as_secs());
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> FetchResult<()> {
        self.store.remove(&self.prefixed(key)).await?;
        log_debug!(self.logger, "cache remove", key: key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::FetchError;

    fn client(backend: &MemoryBackend) -> CacheClient {
        CacheClient::new(Arc::new(backend.clone()), Logger::quiet("cache"))
    }

    #[tokio::test]
    async fn test_prefix_rewrites_keys() {
        let backend = MemoryBackend::new();
        let cache = client(&backend).with_prefix("svc:");

        cache.set("k1", b"ok", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("svc:k1").await.unwrap(), Some(b"ok".to_vec()));
        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert_eq!(cache.get("k1").await.unwrap(), Some(b"ok".to_vec()));

        cache.remove("k1").await.unwrap();
        assert_eq!(backend.get("svc:k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_prefix_applies_to_later_keys_only() {
        let backend = MemoryBackend::new();
        let mut cache = client(&backend);
        cache.set("a", b"1", Duration::ZERO).await.unwrap();

        cache.set_prefix("p:");
        assert_eq!(cache.prefixed("a"), "p:a");
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repeated_get_is_idempotent() {
        let backend = MemoryBackend::new();
        let cache = client(&backend);
        cache.set("k", b"v", Duration::from_secs(60)).await.unwrap();

        let first = cache.get("k").await.unwrap();
        let second = cache.get("k").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_backend_outage_surfaces_as_unavailable() {
        let backend = MemoryBackend::new();
        let cache = client(&backend);
        backend.set_available(false);
        assert!(matches!(
            cache.get("k").await,
            Err(FetchError::BackendUnavailable { .. })
        ));
    }
}
