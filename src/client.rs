//! # Fetch Client
//!
//! Wires a [`FetchConfig`] into a working client: backend, cache facade, live
//! transport, replay publisher and coordinator.
//!
//! ```rust,no_run
//! use lazyfetch::{FetchClient, FetchConfig, FetchDescription};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = FetchClient::connect(FetchConfig::load()?).await?;
//!
//! let descr = FetchDescription::new("user:42", "https://api.example.com/users/42");
//! let response = client.fetch(&descr).await;
//! println!("{} {}", response.status_code, response.body_text());
//!
//! // In a worker process: replay failed optimistic fetches
//! let consumer = std::sync::Arc::new(client.replay_consumer());
//! let handle = consumer.spawn();
//! # consumer.stop();
//! # handle.await??;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tracing::info;

use crate::backend::{Broker, KeyValueStore, RedisBackend};
use crate::cache::CacheClient;
use crate::config::FetchConfig;
use crate::error::FetchResult;
use crate::fetch::{FetchCoordinator, FetchDescription, FetchResponse, Policy};
use crate::logging::Logger;
use crate::replay::{ReplayConsumer, ReplayPublisher};
use crate::transport::{HttpTransport, LiveTransport};

#[derive(Debug)]
pub struct FetchClient {
    config: FetchConfig,
    coordinator: Arc<FetchCoordinator>,
    broker: Arc<dyn Broker>,
    logger: Logger,
}

impl FetchClient {
    /// Connect to the configured Redis endpoints and build an HTTP transport
    pub async fn connect(config: FetchConfig) -> FetchResult<Self> {
        config.validate()?;
        let logger = Logger::new("lazyfetch", config.debug);

        let backend = Arc::new(
            RedisBackend::connect(&config.cache, &config.broker, logger.for_component("redis"))
                .await?,
        );
        let transport = Arc::new(HttpTransport::new(&config.transport)?);

        Self::from_parts(config, backend.clone(), backend, transport)
    }

    /// Build from caller-supplied backends and transport
    pub fn from_parts(
        config: FetchConfig,
        store: Arc<dyn KeyValueStore>,
        broker: Arc<dyn Broker>,
        transport: Arc<dyn LiveTransport>,
    ) -> FetchResult<Self> {
        config.validate()?;
        let logger = Logger::new("lazyfetch", config.debug);

        let cache = CacheClient::new(store, logger.for_component("cache"))
            .with_prefix(config.cache.key_prefix.clone());

        let mut coordinator = FetchCoordinator::new(
            cache,
            transport,
            config.budgets.to_budgets(),
            config.cache.ttl(),
            logger.for_component("coordinator"),
        );
        if config.replay.enabled {
            coordinator = coordinator.with_replay(ReplayPublisher::new(
                Arc::clone(&broker),
                config.broker.retry_channel.clone(),
                &config.replay,
                logger.for_component("replay"),
            ));
        }

        info!(
            key_prefix = %coordinator.cache().prefix(),
            policy = %config.default_policy,
            replay_enabled = config.replay.enabled,
            retry_channel = %config.broker.retry_channel,
            "Fetch client ready"
        );

        Ok(Self {
            config,
            coordinator: Arc::new(coordinator),
            broker,
            logger,
        })
    }

    /// Fetch with the configured default policy
    pub async fn fetch(&self, descr: &FetchDescription) -> FetchResponse {
        self.coordinator
            .fetch(descr, self.config.default_policy)
            .await
    }

    pub async fn fetch_with_policy(
        &self,
        descr: &FetchDescription,
        policy: Policy,
    ) -> FetchResponse {
        self.coordinator.fetch(descr, policy).await
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator> {
        &self.coordinator
    }

    pub fn cache(&self) -> &CacheClient {
        self.coordinator.cache()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// A consumer that replays messages from the retry channel through this client
    pub fn replay_consumer(&self) -> ReplayConsumer {
        ReplayConsumer::new(
            Arc::clone(&self.broker),
            self.coordinator.clone(),
            self.config.broker.resolved_pattern(),
            &self.config.replay,
            self.logger.for_component("replay_consumer"),
        )
    }
}
