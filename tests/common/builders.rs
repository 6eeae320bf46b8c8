//! Builders for coordinators, publishers and consumers over a memory backend.

use lazyfetch::backend::MemoryBackend;
use lazyfetch::cache::CacheClient;
use lazyfetch::config::ReplayConfig;
use lazyfetch::{
    Budgets, FetchCoordinator, LiveTransport, Logger, ReplayConsumer, ReplayHandler,
    ReplayPublisher,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const RETRY_CHANNEL: &str = "lazyfetch:replay";
pub const CACHE_TTL: Duration = Duration::from_secs(600);

pub fn budgets(overall_ms: u64, live_call_ms: u64, cache_ms: u64) -> Budgets {
    Budgets::new(
        Duration::from_millis(overall_ms),
        Duration::from_millis(live_call_ms),
        Duration::from_millis(cache_ms),
    )
}

pub fn replay_config() -> ReplayConfig {
    ReplayConfig {
        jitter_factor: 0.0,
        ..ReplayConfig::default()
    }
}

pub fn publisher(backend: &MemoryBackend, config: &ReplayConfig) -> ReplayPublisher {
    ReplayPublisher::new(
        Arc::new(backend.clone()),
        RETRY_CHANNEL,
        config,
        Logger::quiet("replay"),
    )
}

/// Coordinator over `backend` that publishes failures to [`RETRY_CHANNEL`]
pub fn coordinator(
    backend: &MemoryBackend,
    transport: Arc<dyn LiveTransport>,
    budgets: Budgets,
) -> FetchCoordinator {
    coordinator_with_replay(backend, transport, budgets, &replay_config())
}

pub fn coordinator_with_replay(
    backend: &MemoryBackend,
    transport: Arc<dyn LiveTransport>,
    budgets: Budgets,
    replay: &ReplayConfig,
) -> FetchCoordinator {
    FetchCoordinator::new(
        CacheClient::new(Arc::new(backend.clone()), Logger::quiet("cache")),
        transport,
        budgets,
        CACHE_TTL,
        Logger::quiet("coordinator"),
    )
    .with_replay(publisher(backend, replay))
}

pub fn consumer(
    backend: &MemoryBackend,
    handler: Arc<dyn ReplayHandler>,
    config: &ReplayConfig,
) -> Arc<ReplayConsumer> {
    Arc::new(ReplayConsumer::new(
        Arc::new(backend.clone()),
        handler,
        RETRY_CHANNEL,
        config,
        Logger::quiet("replay_consumer"),
    ))
}

/// Poll `condition` every 10ms until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
