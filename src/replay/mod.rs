//! # Replay
//!
//! Failed optimistic fetches are published to a retry channel and replayed
//! later by a consumer, possibly in another process.

pub mod consumer;
pub mod message;
pub mod publisher;

pub use consumer::{ConsumerState, ConsumerStats, ReplayConsumer, ReplayHandler};
pub use message::ReplayMessage;
pub use publisher::{Handoff, ReplayBackoff, ReplayPublisher};
