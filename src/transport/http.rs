//! HTTP transport over reqwest.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;

use super::{LiveResponse, LiveTransport};
use crate::config::TransportConfig;
use crate::error::{FetchError, FetchResult};
use crate::fetch::FetchDescription;

/// Pooled HTTP client for live calls
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> FetchResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| {
                FetchError::configuration("transport", format!("Failed to build HTTP client: {e}"))
            })?;

        debug!(
            max_idle_per_host = config.max_idle_per_host,
            idle_timeout_seconds = config.idle_timeout_seconds,
            accept_invalid_certs = config.accept_invalid_certs,
            "Created HTTP transport"
        );

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn headers(descr: &FetchDescription) -> FetchResult<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(descr.headers().len());
        for (name, value) in descr.headers() {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                FetchError::live_call_failed(format!("invalid header name {name:?}: {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                FetchError::live_call_failed(format!("invalid value for header {name}: {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

fn map_send_error(error: reqwest::Error, timeout: Duration) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout("live call", timeout)
    } else {
        FetchError::from(error)
    }
}

#[async_trait]
impl LiveTransport for HttpTransport {
    async fn execute(&self, descr: &FetchDescription, timeout: Duration) -> FetchResult<LiveResponse> {
        let method = Method::from_bytes(descr.method().to_ascii_uppercase().as_bytes())
            .map_err(|e| FetchError::live_call_failed(format!("invalid method {:?}: {e}", descr.method())))?;

        let mut request = self
            .client
            .request(method, descr.url())
            .headers(Self::headers(descr)?)
            .timeout(timeout);
        if !descr.payload().is_empty() {
            request = request.body(descr.payload().to_vec());
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_send_error(e, timeout))?;

        Ok(LiveResponse::new(status, body.to_vec()))
    }

    fn transport_name(&self) -> &'static str {
        "http"
    }
}
