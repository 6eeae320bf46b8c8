//! # Live Transport
//!
//! The live network call behind a fetch. Anything that can execute a
//! [`FetchDescription`] under a timeout and report a status and body can act as
//! the transport; [`HttpTransport`] does it over HTTP with reqwest.

pub mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::FetchResult;
use crate::fetch::FetchDescription;

/// Status and body returned by the live endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl LiveResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Executes live calls
///
/// A non-OK status is a normal `Ok` response; only transport-level failures
/// (connection errors, elapsed `timeout`) are errors.
#[async_trait]
pub trait LiveTransport: Send + Sync + fmt::Debug {
    async fn execute(&self, descr: &FetchDescription, timeout: Duration) -> FetchResult<LiveResponse>;

    /// Short name used in logs
    fn transport_name(&self) -> &'static str;
}
