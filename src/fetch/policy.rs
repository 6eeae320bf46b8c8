//! Fetch policies and deadline budgets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Precedence rule between the cache and live attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Cache first; the live call only runs on a miss and failures are replayed
    Optimistic,
    /// Live and cache race; the live body wins and the cache is the fallback
    Pessimistic,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Optimistic => write!(f, "optimistic"),
            Policy::Pessimistic => write!(f, "pessimistic"),
        }
    }
}

/// Deadline bounds for one fetch
///
/// `live_call` is nested inside `overall`: the live attempt stops at whichever
/// expires first. `cache` bounds the cache lookup on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub overall: Duration,
    pub live_call: Duration,
    pub cache: Duration,
}

impl Budgets {
    pub fn new(overall: Duration, live_call: Duration, cache: Duration) -> Self {
        Self {
            overall,
            live_call,
            cache,
        }
    }
}

impl Default for Budgets {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(1_000),
            Duration::from_millis(7_000),
            Duration::from_millis(500),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&Policy::Optimistic).unwrap(),
            "\"optimistic\""
        );
        let parsed: Policy = serde_json::from_str("\"pessimistic\"").unwrap();
        assert_eq!(parsed, Policy::Pessimistic);
        assert_eq!(Policy::Pessimistic.to_string(), "pessimistic");
    }
}
