//! # Fetch Error Types
//!
//! Structured error handling for the fetch client using thiserror. Every
//! attempt-level failure is captured as a `FetchError` value and fed into the
//! coordinator's merge step rather than propagated as a panic.

use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the crate
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors produced by the cache, broker, transport and coordinator layers
///
/// A cache miss is not an error: `CacheClient::get` returns `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Live call failed{}: {message}", status_suffix(.status))]
    LiveCallFailed {
        status: Option<u16>,
        message: String,
    },

    #[error("Timeout: {operation} exceeded its {budget_ms}ms budget")]
    Timeout { operation: String, budget_ms: u64 },

    #[error("Empty response body from {url}")]
    EmptyResponse { url: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Cancelled: {operation} abandoned after the race was decided")]
    Cancelled { operation: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

impl FetchError {
    /// Create a backend unavailable error
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Create a live call failure without an HTTP status (transport error)
    pub fn live_call_failed(message: impl Into<String>) -> Self {
        Self::LiveCallFailed {
            status: None,
            message: message.into(),
        }
    }

    /// Create a live call failure for a non-OK status
    pub fn bad_status(status: u16) -> Self {
        Self::LiveCallFailed {
            status: Some(status),
            message: "endpoint returned a non-OK status".to_string(),
        }
    }

    /// Create a timeout error for an elapsed budget
    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            budget_ms: budget.as_millis() as u64,
        }
    }

    /// Create an empty response error
    pub fn empty_response(url: impl Into<String>) -> Self {
        Self::EmptyResponse { url: url.into() }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether retrying the same request later could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::BackendUnavailable { .. } => true,
            FetchError::Timeout { .. } => true,
            FetchError::LiveCallFailed { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 429,
                None => true,
            },
            FetchError::EmptyResponse { .. } => true,
            FetchError::Serialization { .. } => false,
            FetchError::Configuration { .. } => false,
            FetchError::Cancelled { .. } => false,
        }
    }

    /// Whether this error came from an elapsed budget
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

impl From<redis::RedisError> for FetchError {
    fn from(error: redis::RedisError) -> Self {
        FetchError::backend_unavailable(error.to_string())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        let status = error.status().map(|s| s.as_u16());
        FetchError::LiveCallFailed {
            status,
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        FetchError::serialization(error.to_string())
    }
}

impl From<config::ConfigError> for FetchError {
    fn from(error: config::ConfigError) -> Self {
        FetchError::configuration("config", error.to_string())
    }
}
