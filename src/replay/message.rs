//! Replay wire envelope.
//!
//! A [`ReplayMessage`] is the JSON form of a [`FetchDescription`] plus an
//! optional delivery counter and failure timestamp. Producers that predate
//! these fields omit them: the counter decodes as the first attempt and the
//! timestamp as unknown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, FetchResult};
use crate::fetch::FetchDescription;

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMessage {
    #[serde(flatten)]
    description: FetchDescription,
    /// 1 for the first replay of a request
    #[serde(default = "first_attempt")]
    attempt: u32,
    /// When the failure that produced this delivery happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_at: Option<DateTime<Utc>>,
}

impl ReplayMessage {
    pub fn new(description: FetchDescription, attempt: u32) -> Self {
        Self {
            description,
            attempt: attempt.max(1),
            failed_at: Some(Utc::now()),
        }
    }

    pub fn description(&self) -> &FetchDescription {
        &self.description
    }

    pub fn into_description(self) -> FetchDescription {
        self.description
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    /// Time since the failure, when the producer recorded it
    pub fn lag(&self) -> Option<chrono::Duration> {
        self.failed_at.map(|failed_at| Utc::now() - failed_at)
    }

    pub fn to_bytes(&self) -> FetchResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> FetchResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| FetchError::serialization(format!("invalid replay message: {e}")))
    }
}
