//! # Logging
//!
//! Structured logging through the tracing ecosystem.
//!
//! Components never touch process-wide logging state. Each one receives a
//! [`Logger`] at construction that carries its component name and a debug
//! toggle; debug-level chatter goes through [`log_debug!`](crate::log_debug)
//! and is only emitted when that component's toggle is on. Warnings and errors
//! are always emitted with plain `tracing` macros.
//!
//! Installing a subscriber is the host's job. [`init_tracing`] is a convenience
//! for hosts and examples that don't bring their own.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Injected logging capability for one component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logger {
    component: &'static str,
    debug: bool,
}

impl Logger {
    /// Create a logger for a component
    pub fn new(component: &'static str, debug: bool) -> Self {
        Self { component, debug }
    }

    /// Logger that never emits debug output
    pub fn quiet(component: &'static str) -> Self {
        Self::new(component, false)
    }

    /// Derive a logger for another component with the same debug toggle
    pub fn for_component(&self, component: &'static str) -> Self {
        Self::new(component, self.debug)
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}

/// Emit a debug event through an injected [`Logger`]
///
/// ```rust
/// use lazyfetch::{log_debug, logging::Logger};
///
/// let logger = Logger::new("cache", true);
/// log_debug!(logger, "cache lookup", key: "k1", hit: true);
/// log_debug!(logger, "cache ready");
/// ```
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $operation:expr $(,)?) => {
        if $logger.debug_enabled() {
            tracing::debug!(
                component = $logger.component(),
                operation = %$operation,
                "{}", $operation
            );
        }
    };
    ($logger:expr, $operation:expr, $($key:ident: $value:expr),+ $(,)?) => {
        if $logger.debug_enabled() {
            tracing::debug!(
                component = $logger.component(),
                operation = %$operation,
                $($key = ?$value,)*
                "{}", $operation
            );
        }
    };
}

/// Install a console subscriber for hosts that don't configure their own
///
/// `RUST_LOG` takes precedence; otherwise the level is `debug` when `debug` is
/// set and `info` when it isn't. A subscriber that is already installed is left
/// in place.
pub fn init_tracing(debug: bool) {
    TRACING_INITIALIZED.get_or_init(|| {
        let enabled = debug;
        let default_level = if enabled { "debug" } else { "info" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(filter);

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        } else {
            tracing::info!(debug = enabled, "Console logging initialized");
        }
    });
}
