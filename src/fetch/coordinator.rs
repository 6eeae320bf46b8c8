//! # Request Race Coordinator
//!
//! Runs one fetch under a [`Policy`]:
//!
//! - **Pessimistic**: the live call and the cache lookup start together. The
//!   merge waits on whichever finishes first, or on the overall budget, and
//!   decides by the rules in [`RaceState`]. A live success warms the cache.
//! - **Optimistic**: the cache lookup runs alone under its own budget. A hit
//!   returns at once and the live endpoint is never touched. A miss runs the
//!   live call against the overall budget; when that fails the request is handed
//!   to the replay channel and the caller gets the failure.
//!
//! The overall budget starts when `fetch` is called. Each fetch owns a
//! cancellation token that is cancelled when the coordinator returns, so an
//! attempt that lost the race abandons its work instead of outliving the call.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::description::FetchDescription;
use super::policy::{Budgets, Policy};
use super::race::{AttemptSource, FetchResponse, RaceOutcome, RaceState};
use crate::cache::CacheClient;
use crate::error::{FetchError, FetchResult};
use crate::log_debug;
use crate::logging::Logger;
use crate::replay::consumer::ReplayHandler;
use crate::replay::message::ReplayMessage;
use crate::replay::publisher::{Handoff, ReplayPublisher};
use crate::transport::LiveTransport;

/// Coordinator counters
#[derive(Debug, Default)]
pub struct FetchStats {
    fetches: AtomicU64,
    live_wins: AtomicU64,
    cache_hits: AtomicU64,
    stale_fallbacks: AtomicU64,
    failures: AtomicU64,
    replays_handed_off: AtomicU64,
    replay_publish_failures: AtomicU64,
}

/// Point-in-time copy of [`FetchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStatsSnapshot {
    pub fetches: u64,
    /// Responses served from the live call
    pub live_wins: u64,
    /// Optimistic fetches answered by the cache
    pub cache_hits: u64,
    /// Pessimistic fetches that fell back to the cache after a live failure
    pub stale_fallbacks: u64,
    pub failures: u64,
    /// Failed requests published or scheduled for replay
    pub replays_handed_off: u64,
    pub replay_publish_failures: u64,
}

impl FetchStats {
    pub fn snapshot(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            live_wins: self.live_wins.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            stale_fallbacks: self.stale_fallbacks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            replays_handed_off: self.replays_handed_off.load(Ordering::Relaxed),
            replay_publish_failures: self.replay_publish_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, policy: Policy, response: &FetchResponse) {
        let counter = match (response.source, policy) {
            (Some(AttemptSource::Live), _) => &self.live_wins,
            (Some(AttemptSource::Cache), Policy::Optimistic) => &self.cache_hits,
            (Some(AttemptSource::Cache), Policy::Pessimistic) => &self.stale_fallbacks,
            (None, _) => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The two attempts, cheap to clone into spawned tasks
#[derive(Debug, Clone)]
struct Attempts {
    cache: CacheClient,
    transport: Arc<dyn LiveTransport>,
    cache_ttl: Duration,
    logger: Logger,
}

impl Attempts {
    /// Live call under `live_budget`; warms the cache before reporting success
    async fn live(
        &self,
        descr: &FetchDescription,
        live_budget: Duration,
        cache_budget: Duration,
    ) -> RaceOutcome {
        log_debug!(self.logger, "live attempt started", key: descr.key(), url: descr.url());

        let result = tokio::time::timeout(live_budget, self.transport.execute(descr, live_budget))
            .await
            .unwrap_or_else(|_| Err(FetchError::timeout("live call", live_budget)));

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                log_debug!(self.logger, "live attempt failed", key: descr.key(), error: e);
                return RaceOutcome::failure(AttemptSource::Live, e);
            }
        };

        if !response.is_ok() {
            return RaceOutcome::failure(AttemptSource::Live, FetchError::bad_status(response.status));
        }
        if response.body.is_empty() {
            return RaceOutcome::failure(AttemptSource::Live, FetchError::empty_response(descr.url()));
        }

        let warmed = tokio::time::timeout(
            cache_budget,
            self.cache.set(descr.key(), &response.body, self.cache_ttl),
        )
        .await
        .unwrap_or_else(|_| Err(FetchError::timeout("cache write", cache_budget)));
        if let Err(e) = warmed {
            warn!(key = %descr.key(), error = %e, "Failed to warm cache after live success");
        }

        log_debug!(self.logger, "live attempt succeeded", key: descr.key(), bytes: response.body.len());
        RaceOutcome::success(AttemptSource::Live, response.body)
    }

    /// Cache lookup under `budget`; a hit needs a non-empty value
    async fn lookup(&self, key: &str, budget: Duration) -> RaceOutcome {
        match tokio::time::timeout(budget, self.cache.get(key)).await {
            Ok(Ok(Some(value))) if !value.is_empty() => {
                RaceOutcome::success(AttemptSource::Cache, value)
            }
            Ok(Ok(_)) => RaceOutcome::cache_miss(),
            Ok(Err(e)) => {
                log_debug!(self.logger, "cache attempt failed", key: key, error: e);
                RaceOutcome::failure(AttemptSource::Cache, e)
            }
            Err(_) => RaceOutcome::failure(
                AttemptSource::Cache,
                FetchError::timeout("cache lookup", budget),
            ),
        }
    }
}

/// Races the cache against the live endpoint for each fetch
#[derive(Debug)]
pub struct FetchCoordinator {
    attempts: Attempts,
    publisher: Option<ReplayPublisher>,
    budgets: Budgets,
    stats: FetchStats,
    logger: Logger,
}

impl FetchCoordinator {
    /// Create a coordinator; warmed entries live for `cache_ttl`
    pub fn new(
        cache: CacheClient,
        transport: Arc<dyn LiveTransport>,
        budgets: Budgets,
        cache_ttl: Duration,
        logger: Logger,
    ) -> Self {
        Self {
            attempts: Attempts {
                cache,
                transport,
                cache_ttl,
                logger: logger.for_component("attempt"),
            },
            publisher: None,
            budgets,
            stats: FetchStats::default(),
            logger,
        }
    }

    /// Publish failed optimistic fetches through `publisher`
    pub fn with_replay(mut self, publisher: ReplayPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn budgets(&self) -> Budgets {
        self.budgets
    }

    pub fn cache(&self) -> &CacheClient {
        &self.attempts.cache
    }

    pub fn replay_publisher(&self) -> Option<&ReplayPublisher> {
        self.publisher.as_ref()
    }

    pub fn stats(&self) -> FetchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fetch under the configured budgets
    pub async fn fetch(&self, descr: &FetchDescription, policy: Policy) -> FetchResponse {
        self.fetch_with_budgets(descr, policy, self.budgets).await
    }

    /// Fetch under explicit budgets
    pub async fn fetch_with_budgets(
        &self,
        descr: &FetchDescription,
        policy: Policy,
        budgets: Budgets,
    ) -> FetchResponse {
        self.execute(descr, policy, budgets, 0).await
    }

    async fn execute(
        &self,
        descr: &FetchDescription,
        policy: Policy,
        budgets: Budgets,
        prior_attempt: u32,
    ) -> FetchResponse {
        let started = Instant::now();
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);

        let response = match policy {
            Policy::Pessimistic => self.race(descr, budgets, started).await,
            Policy::Optimistic => self.cache_first(descr, budgets, started, prior_attempt).await,
        };

        self.stats.record(policy, &response);
        debug!(
            key = %descr.key(),
            policy = %policy,
            status = response.status_code,
            source = ?response.source,
            duration_ms = started.elapsed().as_millis() as u64,
            "Fetch completed"
        );
        response
    }

    async fn race(&self, descr: &FetchDescription, budgets: Budgets, started: Instant) -> FetchResponse {
        let cancel = CancellationToken::new();
        let _abandon_on_return = cancel.clone().drop_guard();

        let mut live_rx = self.spawn_attempt(cancel.clone(), AttemptSource::Live, {
            let attempts = self.attempts.clone();
            let descr = descr.clone();
            async move { attempts.live(&descr, budgets.live_call, budgets.cache).await }
        });
        let mut cache_rx = self.spawn_attempt(cancel.clone(), AttemptSource::Cache, {
            let attempts = self.attempts.clone();
            let key = descr.key().to_string();
            async move { attempts.lookup(&key, budgets.cache).await }
        });

        // A budget too large to form a deadline leaves the race unbounded
        let deadline = started.checked_add(budgets.overall);
        let overall = tokio::time::sleep_until(deadline.unwrap_or(started));
        tokio::pin!(overall);

        let mut state = RaceState::new();
        loop {
            let decided = tokio::select! {
                _ = &mut overall, if deadline.is_some() && state.live_pending() => {
                    log_debug!(self.logger, "overall budget elapsed", key: descr.key());
                    state.expire_overall(budgets.overall)
                }
                outcome = &mut live_rx, if state.live_pending() => {
                    state.record(outcome.unwrap_or_else(|_| {
                        RaceOutcome::failure(AttemptSource::Live, FetchError::cancelled("live call"))
                    }))
                }
                outcome = &mut cache_rx, if state.cache_pending() => {
                    state.record(outcome.unwrap_or_else(|_| {
                        RaceOutcome::failure(AttemptSource::Cache, FetchError::cancelled("cache lookup"))
                    }))
                }
                else => Some(FetchResponse::failed(FetchError::timeout("overall", budgets.overall))),
            };

            if let Some(response) = decided {
                log_debug!(
                    self.logger,
                    "race decided",
                    key: descr.key(),
                    status: response.status_code,
                    source: response.source
                );
                return response;
            }
        }
    }

    fn spawn_attempt<F>(
        &self,
        cancel: CancellationToken,
        source: AttemptSource,
        attempt: F,
    ) -> oneshot::Receiver<RaceOutcome>
    where
        F: std::future::Future<Output = RaceOutcome> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let logger = self.logger;
        tokio::spawn(async move {
            tokio::select! {
                outcome = attempt => {
                    let _ = tx.send(outcome);
                }
                _ = cancel.cancelled() => {
                    log_debug!(logger, "attempt abandoned", source: source);
                }
            }
        });
        rx
    }

    async fn cache_first(
        &self,
        descr: &FetchDescription,
        budgets: Budgets,
        started: Instant,
        prior_attempt: u32,
    ) -> FetchResponse {
        let cached = self.attempts.lookup(descr.key(), budgets.cache).await;
        if cached.is_usable() {
            return FetchResponse::ok(AttemptSource::Cache, cached.body);
        }

        let live = self.attempts.live(descr, budgets.live_call, budgets.cache);
        let outcome = match started.checked_add(budgets.overall) {
            Some(deadline) => tokio::time::timeout_at(deadline, live)
                .await
                .unwrap_or_else(|_| {
                    RaceOutcome::failure(
                        AttemptSource::Live,
                        FetchError::timeout("overall", budgets.overall),
                    )
                }),
            None => live.await,
        };

        if outcome.is_usable() {
            return FetchResponse::ok(AttemptSource::Live, outcome.body);
        }

        let error = outcome
            .error
            .unwrap_or_else(|| FetchError::empty_response(descr.url()));
        self.hand_off(descr, prior_attempt, &error).await;
        FetchResponse::failed(error)
    }

    async fn hand_off(&self, descr: &FetchDescription, prior_attempt: u32, cause: &FetchError) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        match publisher.hand_off(descr, prior_attempt).await {
            Handoff::Published { .. } | Handoff::Deferred { .. } => {
                self.stats.replays_handed_off.fetch_add(1, Ordering::Relaxed);
                log_debug!(self.logger, "handed off for replay", key: descr.key(), cause: cause);
            }
            Handoff::Exhausted { .. } => {}
            Handoff::Failed(e) => {
                self.stats
                    .replay_publish_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %descr.key(),
                    channel = %publisher.channel(),
                    error = %e,
                    cause = %cause,
                    "Failed to publish request for replay"
                );
            }
        }
    }
}

#[async_trait]
impl ReplayHandler for FetchCoordinator {
    async fn replay(&self, message: ReplayMessage) -> FetchResult<()> {
        let attempt = message.attempt();
        let descr = message.into_description();
        let response = self
            .execute(&descr, Policy::Optimistic, self.budgets, attempt)
            .await;
        if response.is_success() {
            return Ok(());
        }
        Err(response
            .error
            .unwrap_or_else(|| FetchError::live_call_failed("replay produced no response")))
    }
}
