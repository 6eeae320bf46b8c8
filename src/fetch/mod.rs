//! # Fetch Coordination
//!
//! Describing a fetch, choosing a policy, and racing the live call against the
//! cache under nested deadline budgets.

pub mod coordinator;
pub mod description;
pub mod policy;
pub mod race;

pub use coordinator::{FetchCoordinator, FetchStats, FetchStatsSnapshot};
pub use description::FetchDescription;
pub use policy::{Budgets, Policy};
pub use race::{AttemptSource, FetchResponse, RaceOutcome, RaceState};
