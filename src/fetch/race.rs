//! # Race Merge Rules
//!
//! The live and cache attempts of one fetch complete in no particular order.
//! [`RaceState`] records whichever outcomes have arrived and decides the
//! response from their content and from which attempt is still pending, never
//! from arrival order:
//!
//! | live | cache | response |
//! |---|---|---|
//! | success | any | 200, live body |
//! | failed | hit | 200, cached body, no error |
//! | failed | miss or failed | 500, empty body, live error |
//! | failed | pending | keep waiting |
//! | pending | any | keep waiting |
//!
//! An elapsed overall budget is recorded as a failed live outcome.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use crate::error::{FetchError, FetchResult};

pub const STATUS_OK: u16 = 200;
pub const STATUS_FAILED: u16 = 500;

/// Which attempt produced an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptSource {
    Live,
    Cache,
}

impl fmt::Display for AttemptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptSource::Live => write!(f, "live"),
            AttemptSource::Cache => write!(f, "cache"),
        }
    }
}

/// Result of one attempt, consumed once by the merge
#[derive(Debug, Clone, PartialEq)]
pub struct RaceOutcome {
    pub source: AttemptSource,
    pub body: Vec<u8>,
    pub error: Option<FetchError>,
}

impl RaceOutcome {
    pub fn success(source: AttemptSource, body: Vec<u8>) -> Self {
        Self {
            source,
            body,
            error: None,
        }
    }

    pub fn failure(source: AttemptSource, error: FetchError) -> Self {
        Self {
            source,
            body: Vec::new(),
            error: Some(error),
        }
    }

    /// A cache lookup that found nothing
    pub fn cache_miss() -> Self {
        Self::success(AttemptSource::Cache, Vec::new())
    }

    /// No error and a non-empty body
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.body.is_empty()
    }
}

/// What a fetch hands back to its caller
///
/// An error alongside a non-empty body marks a degraded success: the body is
/// the payload and the error is informational.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
    pub error: Option<FetchError>,
    /// Attempt the body came from; `None` on failure
    pub source: Option<AttemptSource>,
}

impl FetchResponse {
    pub fn ok(source: AttemptSource, body: Vec<u8>) -> Self {
        Self {
            status_code: STATUS_OK,
            body,
            error: None,
            source: Some(source),
        }
    }

    pub fn failed(error: FetchError) -> Self {
        Self {
            status_code: STATUS_FAILED,
            body: Vec::new(),
            error: Some(error),
            source: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some() && !self.body.is_empty()
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The body when there is one, otherwise the error
    pub fn into_result(self) -> FetchResult<Vec<u8>> {
        if !self.body.is_empty() {
            return Ok(self.body);
        }
        Err(self
            .error
            .unwrap_or_else(|| FetchError::live_call_failed("fetch produced no body")))
    }
}

/// Merge state for one pessimistic race
#[derive(Debug, Default, Clone)]
pub struct RaceState {
    live: Option<RaceOutcome>,
    cache: Option<RaceOutcome>,
}

impl RaceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_pending(&self) -> bool {
        self.live.is_none()
    }

    pub fn cache_pending(&self) -> bool {
        self.cache.is_none()
    }

    /// Record an attempt's outcome and return the response if the race is decided
    ///
    /// Only the first outcome per source counts; a live result arriving after
    /// the overall budget was already recorded as a timeout is ignored.
    pub fn record(&mut self, outcome: RaceOutcome) -> Option<FetchResponse> {
        let slot = match outcome.source {
            AttemptSource::Live => &mut self.live,
            AttemptSource::Cache => &mut self.cache,
        };
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.resolve()
    }

    /// Record the overall budget elapsing
    pub fn expire_overall(&mut self, budget: Duration) -> Option<FetchResponse> {
        if self.live.is_none() {
            self.live = Some(RaceOutcome::failure(
                AttemptSource::Live,
                FetchError::timeout("overall", budget),
            ));
        }
        self.resolve()
    }

    /// Current decision, `None` while it depends on a pending attempt
    pub fn resolve(&self) -> Option<FetchResponse> {
        let live = self.live.as_ref()?;
        if live.is_usable() {
            return Some(FetchResponse::ok(AttemptSource::Live, live.body.clone()));
        }

        let cache = self.cache.as_ref()?;
        if cache.is_usable() {
            return Some(FetchResponse::ok(AttemptSource::Cache, cache.body.clone()));
        }

        let error = live
            .error
            .clone()
            .unwrap_or_else(|| FetchError::live_call_failed("live attempt produced no body"));
        Some(FetchResponse::failed(error))
    }
}
