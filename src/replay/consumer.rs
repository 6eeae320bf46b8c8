//! # Replay Consumer
//!
//! Subscribes to the retry channel and replays each failed request through a
//! [`ReplayHandler`], normally the coordinator's optimistic path.
//!
//! ## Lifecycle
//!
//! `Idle → Subscribed → Receiving → Draining → Stopped`
//!
//! - [`run`](ReplayConsumer::run) subscribes and receives in the current task;
//!   [`spawn`](ReplayConsumer::spawn) does the same on a detached task.
//! - Each message is decoded and replayed on its own task, at most
//!   `max_in_flight` at once. A message that fails to decode or replay is
//!   logged and the loop moves on.
//! - [`stop`](ReplayConsumer::stop) moves the loop to `Draining`: the
//!   subscription is closed, in-flight replays get `drain_timeout` to finish and
//!   are then aborted. Calling it again has no effect.
//! - The outcome is reported once on the exit channel: `Ok(())` after a
//!   requested stop, or the error that ended the loop (the initial subscribe
//!   failing, the stream ending underneath it, or the first close error).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::message::ReplayMessage;
use crate::backend::{Broker, BrokerMessage};
use crate::config::ReplayConfig;
use crate::error::{FetchError, FetchResult};
use crate::log_debug;
use crate::logging::Logger;

/// Re-executes replayed requests
#[async_trait]
pub trait ReplayHandler: Send + Sync + 'static {
    async fn replay(&self, message: ReplayMessage) -> FetchResult<()>;

    /// Called for payloads that are not valid replay messages
    async fn handle_decode_error(&self, channel: &str, error: FetchError) {
        warn!(channel = %channel, error = %error, "Discarding undecodable replay message");
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle = 0,
    Subscribed = 1,
    Receiving = 2,
    Draining = 3,
    Stopped = 4,
}

impl From<u8> for ConsumerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConsumerState::Idle,
            1 => ConsumerState::Subscribed,
            2 => ConsumerState::Receiving,
            3 => ConsumerState::Draining,
            _ => ConsumerState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    received: AtomicU64,
    replayed: AtomicU64,
    replay_failures: AtomicU64,
    decode_errors: AtomicU64,
    aborted: AtomicU64,
}

/// Point-in-time consumer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub replayed: u64,
    pub replay_failures: u64,
    pub decode_errors: u64,
    /// Replays that panicked or were aborted at the drain deadline
    pub aborted: u64,
}

pub struct ReplayConsumer {
    consumer_id: Uuid,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn ReplayHandler>,
    pattern: String,
    max_in_flight: usize,
    replay_interval: Duration,
    drain_timeout: Duration,
    state: AtomicU8,
    shutdown: CancellationToken,
    exit_tx: mpsc::Sender<FetchResult<()>>,
    exit_rx: Mutex<Option<mpsc::Receiver<FetchResult<()>>>>,
    counters: Arc<ConsumerCounters>,
    logger: Logger,
}

impl std::fmt::Debug for ReplayConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayConsumer")
            .field("consumer_id", &self.consumer_id)
            .field("pattern", &self.pattern)
            .field("state", &self.state())
            .finish()
    }
}

impl ReplayConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn ReplayHandler>,
        pattern: impl Into<String>,
        config: &ReplayConfig,
        logger: Logger,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(1);
        Self {
            consumer_id: Uuid::new_v4(),
            broker,
            handler,
            pattern: pattern.into(),
            max_in_flight: config.max_in_flight.max(1),
            replay_interval: config.replay_interval(),
            drain_timeout: config.drain_timeout(),
            state: AtomicU8::new(ConsumerState::Idle as u8),
            shutdown: CancellationToken::new(),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            counters: Arc::new(ConsumerCounters::default()),
            logger,
        }
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> ConsumerStats {
        let counters = &self.counters;
        ConsumerStats {
            received: counters.received.load(Ordering::Relaxed),
            replayed: counters.replayed.load(Ordering::Relaxed),
            replay_failures: counters.replay_failures.load(Ordering::Relaxed),
            decode_errors: counters.decode_errors.load(Ordering::Relaxed),
            aborted: counters.aborted.load(Ordering::Relaxed),
        }
    }

    /// Channel that receives the consumer's exit outcome exactly once
    ///
    /// Returns `None` after the first call.
    pub fn take_exit_receiver(&self) -> Option<mpsc::Receiver<FetchResult<()>>> {
        self.exit_rx.lock().take()
    }

    /// Ask the loop to drain and stop
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(consumer_id = %self.consumer_id, "Stopping replay consumer");
        self.shutdown.cancel();

        // Never started: nothing to drain
        if self.transition(ConsumerState::Idle, ConsumerState::Stopped) {
            self.report_exit(Ok(()));
        }
    }

    /// Run the loop on a detached task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<FetchResult<()>> {
        let consumer = Arc::clone(self);
        tokio::spawn(async move { consumer.run().await })
    }

    /// Subscribe and receive until stopped or the subscription fails
    pub async fn run(&self) -> FetchResult<()> {
        if !self.transition(ConsumerState::Idle, ConsumerState::Subscribed) {
            return Err(FetchError::configuration(
                "replay_consumer",
                format!("consumer cannot start from state {:?}", self.state()),
            ));
        }

        let mut subscription = match self.broker.subscribe(&self.pattern).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(
                    consumer_id = %self.consumer_id,
                    pattern = %self.pattern,
                    error = %e,
                    "Replay consumer failed to subscribe"
                );
                self.set_state(ConsumerState::Stopped);
                self.report_exit(Err(e.clone()));
                return Err(e);
            }
        };

        info!(
            consumer_id = %self.consumer_id,
            pattern = %self.pattern,
            max_in_flight = self.max_in_flight,
            "Replay consumer subscribed"
        );
        self.set_state(ConsumerState::Receiving);

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();

        let received: FetchResult<()> = 'receive: loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break 'receive Ok(()),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'receive Ok(()),
                },
            };

            let message = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'receive Ok(()),
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        self.note_join(joined);
                    }
                    message = subscription.next_message() => break message,
                }
            };

            let Some(message) = message else {
                warn!(
                    consumer_id = %self.consumer_id,
                    pattern = %self.pattern,
                    "Replay subscription stream ended unexpectedly"
                );
                break 'receive Err(FetchError::backend_unavailable(
                    "replay subscription stream ended",
                ));
            };

            self.counters.received.fetch_add(1, Ordering::Relaxed);
            self.dispatch(message, permit, &mut in_flight);

            if !self.replay_interval.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'receive Ok(()),
                    _ = tokio::time::sleep(self.replay_interval) => {}
                }
            }
        };

        self.set_state(ConsumerState::Draining);
        let closed = subscription.close().await;
        if let Err(e) = &closed {
            warn!(consumer_id = %self.consumer_id, error = %e, "Failed to close replay subscription");
        }
        self.drain(&mut in_flight).await;

        let result = received.and(closed);
        self.set_state(ConsumerState::Stopped);
        info!(
            consumer_id = %self.consumer_id,
            clean = result.is_ok(),
            "Replay consumer stopped"
        );
        self.report_exit(result.clone());
        result
    }

    fn dispatch(
        &self,
        message: BrokerMessage,
        permit: OwnedSemaphorePermit,
        in_flight: &mut JoinSet<()>,
    ) {
        let handler = Arc::clone(&self.handler);
        let counters = Arc::clone(&self.counters);
        let logger = self.logger;

        in_flight.spawn(async move {
            let _permit = permit;
            let replay = match ReplayMessage::from_bytes(&message.payload) {
                Ok(replay) => replay,
                Err(e) => {
                    counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    handler.handle_decode_error(&message.channel, e).await;
                    return;
                }
            };

            let key = replay.description().key().to_string();
            let attempt = replay.attempt();
            let lag_ms = replay.lag().map(|lag| lag.num_milliseconds());
            log_debug!(logger, "replaying request", key: key, attempt: attempt, lag_ms: lag_ms);

            match handler.replay(replay).await {
                Ok(()) => {
                    counters.replayed.fetch_add(1, Ordering::Relaxed);
                    log_debug!(logger, "replay succeeded", key: key, attempt: attempt);
                }
                Err(e) => {
                    counters.replay_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, attempt = attempt, error = %e, "Replay failed");
                }
            }
        });
    }

    fn note_join(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            if e.is_panic() {
                error!(consumer_id = %self.consumer_id, error = %e, "Replay task panicked");
            }
        }
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                self.note_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                consumer_id = %self.consumer_id,
                remaining = in_flight.len(),
                drain_timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timeout elapsed, aborting in-flight replays"
            );
            in_flight.abort_all();
            while let Some(joined) = in_flight.join_next().await {
                self.note_join(joined);
            }
        }
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
        log_debug!(self.logger, "consumer state changed", state: state);
    }

    fn report_exit(&self, result: FetchResult<()>) {
        if self.exit_tx.try_send(result).is_err() {
            log_debug!(self.logger, "exit outcome already reported or receiver dropped");
        }
    }
}
