//! # Fetch Client Configuration
//!
//! Construction-time options for the fetch client: call budgets, cache backend
//! addressing, retry channel, live transport pool settings and replay behavior.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lazyfetch::config::FetchConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Defaults < ./lazyfetch.toml < LAZYFETCH_* environment variables
//! let config = FetchConfig::load()?;
//!
//! let overall = config.budgets.overall();
//! let ttl = config.cache.ttl();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FetchError, FetchResult};
use crate::fetch::policy::{Budgets, Policy};

/// Root configuration for a fetch client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub budgets: BudgetConfig,
    pub cache: CacheConfig,
    pub broker: BrokerConfig,
    pub transport: TransportConfig,
    pub replay: ReplayConfig,
    /// Policy used by `FetchClient::fetch`
    pub default_policy: Policy,
    /// Debug-level logging for every component built from this config
    pub debug: bool,
}

/// Deadline budgets, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Overall call budget
    pub overall_ms: u64,
    /// Budget of the live network call
    pub live_call_ms: u64,
    /// Budget of the cache lookup
    pub cache_ms: u64,
}

/// Cache backend addressing and warmed-entry lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `host:port` or `redis://` URLs. One endpoint selects single-node
    /// addressing, more than one selects cluster addressing.
    pub endpoints: Vec<String>,
    /// Database index (single-node only)
    pub database: i64,
    /// Prefix applied to every cache key
    pub key_prefix: String,
    /// TTL of entries written after a successful live call
    pub ttl_seconds: u64,
    /// Per-command response timeout on backend connections
    pub response_timeout_ms: u64,
}

/// Publish/subscribe settings for the retry channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Dedicated pub/sub endpoint; the first cache endpoint when unset
    pub endpoint: Option<String>,
    /// Channel failed optimistic fetches are published to
    pub retry_channel: String,
    /// Pattern the replay consumer subscribes to; the retry channel when unset
    pub subscribe_pattern: Option<String>,
}

/// Live transport connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout_seconds: u64,
    /// Skip certificate verification. Testing only.
    pub accept_invalid_certs: bool,
    pub user_agent: String,
}

/// Replay publication and consumption settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Publish failed optimistic fetches to the retry channel
    pub enabled: bool,
    /// Deliveries per request before it is dropped
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0) applied to re-publish delays
    pub jitter_factor: f64,
    /// Concurrent replays per consumer
    pub max_in_flight: usize,
    /// Pause between received messages
    pub replay_interval_ms: u64,
    /// How long a stopping consumer waits for in-flight replays
    pub drain_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            budgets: BudgetConfig::default(),
            cache: CacheConfig::default(),
            broker: BrokerConfig::default(),
            transport: TransportConfig::default(),
            replay: ReplayConfig::default(),
            default_policy: Policy::Pessimistic,
            debug: false,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            overall_ms: 1_000,
            live_call_ms: 7_000,
            cache_ms: 500,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:6379".to_string()],
            database: 0,
            key_prefix: String::new(),
            ttl_seconds: 600,
            response_timeout_ms: 2_000,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            retry_channel: "lazyfetch:replay".to_string(),
            subscribe_pattern: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout_seconds: 90,
            accept_invalid_certs: false,
            user_agent: format!("lazyfetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_in_flight: 16,
            replay_interval_ms: 0,
            drain_timeout_ms: 5_000,
        }
    }
}

impl BudgetConfig {
    pub fn overall(&self) -> Duration {
        Duration::from_millis(self.overall_ms)
    }

    pub fn live_call(&self) -> Duration {
        Duration::from_millis(self.live_call_ms)
    }

    pub fn cache(&self) -> Duration {
        Duration::from_millis(self.cache_ms)
    }

    pub fn to_budgets(&self) -> Budgets {
        Budgets::new(self.overall(), self.live_call(), self.cache())
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Whether the endpoint list selects cluster addressing
    pub fn is_cluster(&self) -> bool {
        self.endpoints.len() > 1
    }
}

impl BrokerConfig {
    /// Endpoint used for subscriptions
    pub fn resolved_endpoint<'a>(&'a self, cache: &'a CacheConfig) -> Option<&'a str> {
        self.endpoint
            .as_deref()
            .or_else(|| cache.endpoints.first().map(String::as_str))
    }

    /// Pattern the replay consumer subscribes to
    pub fn resolved_pattern(&self) -> &str {
        self.subscribe_pattern
            .as_deref()
            .unwrap_or(&self.retry_channel)
    }
}

impl TransportConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

impl ReplayConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl FetchConfig {
    /// Validate the configuration
    pub fn validate(&self) -> FetchResult<()> {
        let budgets = &self.budgets;
        for (field, value) in [
            ("budgets.overall_ms", budgets.overall_ms),
            ("budgets.live_call_ms", budgets.live_call_ms),
            ("budgets.cache_ms", budgets.cache_ms),
        ] {
            if value == 0 {
                return Err(FetchError::configuration(
                    field,
                    "budget must be greater than 0",
                ));
            }
        }

        if self.cache.endpoints.is_empty() {
            return Err(FetchError::configuration(
                "cache.endpoints",
                "at least one backend endpoint is required",
            ));
        }

        if self.cache.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(FetchError::configuration(
                "cache.endpoints",
                "endpoints cannot be blank",
            ));
        }

        if self.broker.retry_channel.trim().is_empty() {
            return Err(FetchError::configuration(
                "broker.retry_channel",
                "retry channel name cannot be empty",
            ));
        }

        let replay = &self.replay;
        if replay.max_in_flight == 0 {
            return Err(FetchError::configuration(
                "replay.max_in_flight",
                "must allow at least one in-flight replay",
            ));
        }

        if replay.backoff_base_ms > replay.backoff_max_ms {
            return Err(FetchError::configuration(
                "replay.backoff_base_ms",
                format!(
                    "base delay {}ms exceeds max delay {}ms",
                    replay.backoff_base_ms, replay.backoff_max_ms
                ),
            ));
        }

        if replay.backoff_multiplier < 1.0 {
            return Err(FetchError::configuration(
                "replay.backoff_multiplier",
                "multiplier must be at least 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&replay.jitter_factor) {
            return Err(FetchError::configuration(
                "replay.jitter_factor",
                "jitter factor must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }
}
