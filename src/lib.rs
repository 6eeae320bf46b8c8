#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # LazyFetch Core
//!
//! A resilient data-fetch client. Each fetch races a cheap cache lookup against
//! an expensive live call, applies the precedence rules of its policy, warms
//! the cache when the live call succeeds, and hands requests that still fail to
//! a publish/subscribe retry channel for later replay.
//!
//! ## Policies
//!
//! - **Pessimistic** (live-preferred): live call and cache lookup run
//!   concurrently; the live body wins, and a cached value masks a live failure.
//! - **Optimistic** (cache-preferred): a cache hit is returned without touching
//!   the live endpoint; a miss falls through to the live call, and a failure is
//!   published for replay.
//!
//! ## Module Organization
//!
//! - [`fetch`] - Fetch descriptions, policies, race merge and the coordinator
//! - [`cache`] - Prefixable cache facade
//! - [`backend`] - Key-value and broker contracts, Redis and in-memory backends
//! - [`transport`] - Live transport contract and the HTTP transport
//! - [`replay`] - Replay messages, publication and the replay consumer
//! - [`client`] - Config-driven wiring of all of the above
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Injected loggers and subscriber setup
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use lazyfetch::backend::MemoryBackend;
//! use lazyfetch::{FetchClient, FetchConfig, FetchDescription, HttpTransport, Policy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FetchConfig::default();
//! let backend = Arc::new(MemoryBackend::new());
//! let transport = Arc::new(HttpTransport::new(&config.transport)?);
//! let client = FetchClient::from_parts(config, backend.clone(), backend, transport)?;
//!
//! let descr = FetchDescription::new("user:42", "https://api.example.com/users/42")
//!     .with_header("Accept", "application/json");
//! # let _ = (client, descr, Policy::Optimistic);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod replay;
pub mod transport;

pub use client::FetchClient;
pub use config::FetchConfig;
pub use error::{FetchError, FetchResult};
pub use fetch::{AttemptSource, Budgets, FetchCoordinator, FetchDescription, FetchResponse, Policy};
pub use logging::{init_tracing, Logger};
pub use replay::{ReplayConsumer, ReplayHandler, ReplayMessage, ReplayPublisher};
pub use transport::{HttpTransport, LiveResponse, LiveTransport};
