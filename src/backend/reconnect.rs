//! # Lazy Reconnect
//!
//! A single connection handle shared by every concurrent operation. Callers
//! [`acquire`](ReconnectingHandle::acquire) a lease, which probes the current
//! handle and re-creates it when the probe fails or no handle exists.
//!
//! Reconnects are serialized by one async mutex, so a burst of concurrent
//! failures produces one reconnect. Every installed handle carries a
//! generation number. A reconnect installs its handle only while the generation
//! it observed is still current, and [`invalidate`](ReconnectingHandle::invalidate)
//! only drops the handle of the generation that failed, so a slow caller can
//! never clobber a newer handle with an older one.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::FetchResult;
use crate::log_debug;
use crate::logging::Logger;

/// Creates and health-checks connection handles
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    async fn connect(&self) -> FetchResult<Self::Handle>;

    /// Liveness probe (PING)
    async fn probe(&self, handle: &Self::Handle) -> FetchResult<()>;

    /// Target description for logs
    fn target(&self) -> String;
}

/// A handle together with the generation it belongs to
#[derive(Debug, Clone)]
pub struct Lease<H> {
    pub handle: H,
    pub generation: u64,
}

#[derive(Debug)]
struct Slot<H> {
    generation: u64,
    handle: Option<H>,
}

/// Generation-tagged, lazily reconnecting connection handle
pub struct ReconnectingHandle<C: Connector> {
    connector: C,
    slot: RwLock<Slot<C::Handle>>,
    reconnect_lock: Mutex<()>,
    reconnects: AtomicU64,
    logger: Logger,
}

impl<C: Connector> std::fmt::Debug for ReconnectingHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.read();
        f.debug_struct("ReconnectingHandle")
            .field("target", &self.connector.target())
            .field("generation", &slot.generation)
            .field("connected", &slot.handle.is_some())
            .finish()
    }
}

impl<C: Connector> ReconnectingHandle<C> {
    /// Create without connecting; the first `acquire` connects
    pub fn new(connector: C, logger: Logger) -> Self {
        Self {
            connector,
            slot: RwLock::new(Slot {
                generation: 0,
                handle: None,
            }),
            reconnect_lock: Mutex::new(()),
            reconnects: AtomicU64::new(0),
            logger,
        }
    }

    /// Get a live handle, reconnecting if needed
    pub async fn acquire(&self) -> FetchResult<Lease<C::Handle>> {
        let (generation, handle) = self.current();
        if let Some(handle) = handle {
            let lease = Lease { handle, generation };
            match self.connector.probe(&lease.handle).await {
                Ok(()) => return Ok(lease),
                Err(e) => {
                    warn!(
                        target_addr = %self.connector.target(),
                        generation = lease.generation,
                        error = %e,
                        "Connection probe failed, reconnecting"
                    );
                    self.invalidate(lease.generation);
                }
            }
        }

        self.reconnect(generation).await
    }

    /// Drop the handle of `generation` after a connection-class error
    ///
    /// Returns false when a newer handle has already replaced it.
    pub fn invalidate(&self, generation: u64) -> bool {
        let mut slot = self.slot.write();
        if slot.generation == generation && slot.handle.is_some() {
            slot.handle = None;
            log_debug!(self.logger, "connection invalidated", generation: generation);
            true
        } else {
            false
        }
    }

    /// Generation of the most recently installed handle (0 before the first)
    pub fn generation(&self) -> u64 {
        self.slot.read().generation
    }

    pub fn is_connected(&self) -> bool {
        self.slot.read().handle.is_some()
    }

    /// Number of handles created so far
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Generation and handle read under one lock
    fn current(&self) -> (u64, Option<C::Handle>) {
        let slot = self.slot.read();
        (slot.generation, slot.handle.clone())
    }

    /// Reconnect on behalf of a caller that found generation `waited_from` unusable
    async fn reconnect(&self, waited_from: u64) -> FetchResult<Lease<C::Handle>> {
        let _guard = self.reconnect_lock.lock().await;

        // Another caller reconnected while we waited for the lock
        let observed = {
            let slot = self.slot.read();
            if slot.generation != waited_from {
                if let Some(handle) = &slot.handle {
                    return Ok(Lease {
                        handle: handle.clone(),
                        generation: slot.generation,
                    });
                }
            }
            slot.generation
        };

        let handle = self.connector.connect().await?;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        Ok(self.install(observed, handle))
    }

    fn install(&self, observed: u64, handle: C::Handle) -> Lease<C::Handle> {
        let mut slot = self.slot.write();
        if slot.generation != observed {
            if let Some(current) = &slot.handle {
                log_debug!(
                    self.logger,
                    "discarding superseded connection",
                    observed: observed,
                    current: slot.generation
                );
                return Lease {
                    handle: current.clone(),
                    generation: slot.generation,
                };
            }
        }

        slot.generation += 1;
        slot.handle = Some(handle.clone());
        info!(
            target_addr = %self.connector.target(),
            generation = slot.generation,
            "Backend connection established"
        );
        Lease {
            handle,
            generation: slot.generation,
        }
    }
}
