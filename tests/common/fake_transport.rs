//! Scriptable live transport that counts calls.

use async_trait::async_trait;
use lazyfetch::{FetchDescription, FetchError, FetchResult, LiveResponse, LiveTransport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct FakeTransport {
    response: Mutex<LiveResponse>,
    delay: Mutex<Duration>,
    failure: Mutex<Option<FetchError>>,
    /// Calls left that fail with `failure` before responses start
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<FetchDescription>>,
}

impl FakeTransport {
    /// Always answers `status` with `body`
    pub fn responding(status: u16, body: &str) -> Self {
        Self {
            response: Mutex::new(LiveResponse::new(status, body.as_bytes().to_vec())),
            delay: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fails with `error`
    pub fn failing(error: FetchError) -> Self {
        Self::responding(200, "").failing_first(usize::MAX, error)
    }

    /// Fail the first `times` calls with `error`, then respond normally
    pub fn failing_first(self, times: usize, error: FetchError) -> Self {
        *self.failure.lock() = Some(error);
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn set_response(&self, status: u16, body: &str) {
        *self.response.lock() = LiveResponse::new(status, body.as_bytes().to_vec());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchDescription> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn execute(&self, descr: &FetchDescription, _timeout: Duration) -> FetchResult<LiveResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(descr.clone());

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            if let Some(error) = self.failure.lock().clone() {
                return Err(error);
            }
        }

        Ok(self.response.lock().clone())
    }

    fn transport_name(&self) -> &'static str {
        "fake"
    }
}
