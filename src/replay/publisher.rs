//! # Replay Publication
//!
//! Hands failed optimistic fetches to the retry channel. Replay is
//! at-most-once and best-effort: a message published while no consumer is
//! subscribed is lost, and a request that keeps failing is dropped after
//! `max_attempts` deliveries.
//!
//! A first failure is published immediately as attempt 1. A replayed request
//! that fails again is re-published as the next attempt after an exponential
//! backoff, from a detached task so the replaying consumer is not held up.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::message::ReplayMessage;
use crate::backend::Broker;
use crate::config::ReplayConfig;
use crate::error::FetchError;
use crate::fetch::FetchDescription;
use crate::log_debug;
use crate::logging::Logger;

/// Exponential backoff between re-publications
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayBackoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl ReplayBackoff {
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            base: config.backoff_base(),
            max: config.backoff_max(),
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Delay before re-publishing after `attempt` failed deliveries
    ///
    /// `base * multiplier^(attempt-1)`, stretched by up to `jitter_factor`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);

        if self.jitter_factor > 0.0 {
            millis *= 1.0 + fastrand::f64() * self.jitter_factor;
        }

        let capped = millis.min(self.max.as_millis() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max
        }
    }
}

/// What happened to a failed request
#[derive(Debug, Clone, PartialEq)]
pub enum Handoff {
    /// Published now; `receivers` subscribers got it (0 means it was lost)
    Published { receivers: u64 },
    /// Will be published after `delay`
    Deferred { delay: Duration },
    /// Delivered `attempts` times already; dropped
    Exhausted { attempts: u32 },
    /// Could not be encoded or published
    Failed(FetchError),
}

/// Publishes replay messages to the retry channel
#[derive(Debug, Clone)]
pub struct ReplayPublisher {
    broker: Arc<dyn Broker>,
    channel: String,
    backoff: ReplayBackoff,
    max_attempts: u32,
    logger: Logger,
}

impl ReplayPublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        channel: impl Into<String>,
        config: &ReplayConfig,
        logger: Logger,
    ) -> Self {
        Self {
            broker,
            channel: channel.into(),
            backoff: ReplayBackoff::from_config(config),
            max_attempts: config.max_attempts,
            logger,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Hand a failed request off for replay
    ///
    /// `prior_attempt` is the delivery that just failed, or 0 when the failure
    /// came from a caller's own fetch.
    pub async fn hand_off(&self, descr: &FetchDescription, prior_attempt: u32) -> Handoff {
        if prior_attempt >= self.max_attempts {
            warn!(
                key = %descr.key(),
                attempts = prior_attempt,
                max_attempts = self.max_attempts,
                "Replay attempts exhausted, dropping request"
            );
            return Handoff::Exhausted {
                attempts: prior_attempt,
            };
        }

        let message = ReplayMessage::new(descr.clone(), prior_attempt + 1);
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => return Handoff::Failed(e),
        };

        if prior_attempt == 0 {
            return match self.publish(&payload).await {
                Ok(receivers) => {
                    log_debug!(self.logger, "replay published", key: descr.key(), receivers: receivers);
                    Handoff::Published { receivers }
                }
                Err(e) => Handoff::Failed(e),
            };
        }

        let delay = self.backoff.delay_for(prior_attempt);
        let publisher = self.clone();
        let key = descr.key().to_string();
        let attempt = message.attempt();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match publisher.publish(&payload).await {
                Ok(receivers) => info!(
                    key = %key,
                    attempt = attempt,
                    receivers = receivers,
                    "Replay re-published after backoff"
                ),
                Err(e) => warn!(
                    key = %key,
                    attempt = attempt,
                    error = %e,
                    "Replay re-publish failed, dropping request"
                ),
            }
        });

        Handoff::Deferred { delay }
    }

    async fn publish(&self, payload: &[u8]) -> Result<u64, FetchError> {
        let receivers = self.broker.publish(&self.channel, payload).await?;
        if receivers == 0 {
            warn!(
                channel = %self.channel,
                "Replay published with no active subscriber; message lost"
            );
        }
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn config() -> ReplayConfig {
        ReplayConfig {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..ReplayConfig::default()
        }
    }

    fn publisher(backend: &MemoryBackend) -> ReplayPublisher {
        ReplayPublisher::new(
            Arc::new(backend.clone()),
            "replay",
            &config(),
            Logger::quiet("replay"),
        )
    }

    fn descr() -> FetchDescription {
        FetchDescription::new("k1", "http://example.test/a").with_method("POST")
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = ReplayBackoff::from_config(&config());
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let backoff = ReplayBackoff {
            jitter_factor: 0.5,
            ..ReplayBackoff::from_config(&config())
        };
        for _ in 0..100 {
            let delay = backoff.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_first_failure_publishes_immediately() {
        let backend = MemoryBackend::new();
        let _subscription = backend.subscribe("replay").await.unwrap();

        let handoff = publisher(&backend).hand_off(&descr(), 0).await;
        assert_eq!(handoff, Handoff::Published { receivers: 1 });

        let published = backend.published();
        assert_eq!(published.len(), 1);
        let message = ReplayMessage::from_bytes(&published[0].payload).unwrap();
        assert_eq!(message.attempt(), 1);
        assert_eq!(message.description(), &descr());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failure_is_deferred_with_next_attempt() {
        let backend = MemoryBackend::new();
        let handoff = publisher(&backend).hand_off(&descr(), 2).await;
        assert_eq!(
            handoff,
            Handoff::Deferred {
                delay: Duration::from_millis(200)
            }
        );
        assert!(backend.published().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let published = backend.published();
        assert_eq!(published.len(), 1);
        assert_eq!(
            ReplayMessage::from_bytes(&published[0].payload)
                .unwrap()
                .attempt(),
            3
        );
    }

    #[tokio::test]
    async fn test_exhausted_requests_are_dropped() {
        let backend = MemoryBackend::new();
        let handoff = publisher(&backend).hand_off(&descr(), 3).await;
        assert_eq!(handoff, Handoff::Exhausted { attempts: 3 });
        assert!(backend.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let handoff = publisher(&backend).hand_off(&descr(), 0).await;
        assert!(matches!(
            handoff,
            Handoff::Failed(FetchError::BackendUnavailable { .. })
        ));
    }
}
