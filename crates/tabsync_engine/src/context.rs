//! Per-context wiring and lifecycle.
//!
//! A [`SyncContext`] owns one context's bus, queue and store. There are no
//! globals: every collaborator is passed in through [`ContextDeps`], so any
//! number of isolated contexts can live in one process.

use crate::backend::{NoopBackend, RemoteBackend};
use crate::bus::{BusStats, EventBus};
use crate::channel::Channel;
use crate::clock::{Clock, SystemClock};
use crate::config::ContextConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::queue::{DrainReport, OfflineQueue, QueueStats};
use crate::store::EntityStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabsync_protocol::SyncStatus;
use tabsync_storage::Persistence;
use tracing::{debug, info, warn};

/// External collaborators of a context.
#[derive(Clone)]
pub struct ContextDeps {
    /// This context's channel endpoint.
    pub channel: Arc<dyn Channel>,
    /// Durable storage shared with the other contexts.
    pub persistence: Persistence,
    /// Remote backend.
    pub backend: Arc<dyn RemoteBackend>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Backend reachability.
    pub connectivity: Connectivity,
}

impl ContextDeps {
    /// Creates dependencies with no backend, the system clock and an online
    /// connectivity signal.
    pub fn new(channel: Arc<dyn Channel>, persistence: Persistence) -> Self {
        Self {
            channel,
            persistence,
            backend: Arc::new(NoopBackend),
            clock: Arc::new(SystemClock),
            connectivity: Connectivity::online(),
        }
    }

    /// Sets the remote backend.
    pub fn with_backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the connectivity signal.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }
}

/// What one [`SyncContext::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Events accepted from other contexts.
    pub events: usize,
    /// Drain pass triggered by a return to online.
    pub drained: Option<DrainReport>,
}

/// Combined statistics of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStats {
    /// Bus statistics.
    pub bus: BusStats,
    /// Queue statistics.
    pub queue: QueueStats,
}

/// One execution context: store, bus and queue wired together.
pub struct SyncContext {
    id: String,
    bus: Arc<EventBus>,
    queue: Arc<OfflineQueue>,
    store: Arc<EntityStore>,
    destroyed: AtomicBool,
}

impl SyncContext {
    /// Builds and connects a context.
    pub fn init(config: ContextConfig, deps: ContextDeps) -> Self {
        let id = config
            .context_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let actor = config.actor.unwrap_or_else(|| id.clone());

        let bus = Arc::new(EventBus::new(
            id.clone(),
            config.bus,
            deps.channel,
            deps.persistence.clone(),
            Arc::clone(&deps.clock),
        ));
        let queue = Arc::new(OfflineQueue::new(
            config.queue,
            deps.backend,
            deps.persistence.clone(),
            Arc::clone(&deps.clock),
            deps.connectivity,
        ));
        let store = EntityStore::new(
            config.store,
            actor,
            deps.persistence,
            deps.clock,
            Arc::clone(&bus),
            Arc::clone(&queue),
        );

        info!(context_id = %id, "sync context initialized");

        Self {
            id,
            bus,
            queue,
            store,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Returns the context id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the entity store.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Returns the event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Returns the offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Returns the connectivity signal.
    pub fn connectivity(&self) -> &Connectivity {
        self.queue.connectivity()
    }

    /// Processes the inbox and reacts to connectivity changes.
    ///
    /// Going offline moves the status to `offline`; coming back drains the
    /// queue once and settles on `synced`, or `error` if an operation
    /// failed for good.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Destroyed`] after [`SyncContext::destroy`].
    pub fn tick(&self) -> SyncResult<TickReport> {
        self.ensure_alive()?;

        let events = self.bus.pump();
        let drained = self.queue.poll_connectivity();

        match &drained {
            Some(report) => {
                self.update_status(SyncStatus::Syncing);
                let settled = if report.failed == 0 {
                    SyncStatus::Synced
                } else {
                    SyncStatus::Error
                };
                self.update_status(settled);
            }
            None if !self.queue.is_online() => self.update_status(SyncStatus::Offline),
            None => {}
        }

        Ok(TickReport { events, drained })
    }

    /// Rebroadcasts the collection and drains the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Destroyed`] after [`SyncContext::destroy`], or
    /// the status error from the bus.
    pub fn force_sync(&self) -> SyncResult<DrainReport> {
        self.ensure_alive()?;

        self.bus.set_status(SyncStatus::Syncing)?;
        self.store.rebroadcast();
        let report = self.queue.drain();
        self.bus.set_status(SyncStatus::Synced)?;

        debug!(context_id = %self.id, synced = report.synced, "forced sync finished");
        Ok(report)
    }

    /// Returns bus and queue statistics.
    pub fn stats(&self) -> ContextStats {
        ContextStats {
            bus: self.bus.stats(),
            queue: self.queue.stats(),
        }
    }

    /// Disconnects everything. Calling it again does nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.detach();
        self.queue.close();
        self.bus.close();
        info!(context_id = %self.id, "sync context destroyed");
    }

    /// Returns true once [`SyncContext::destroy`] has run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> SyncResult<()> {
        if self.is_destroyed() {
            Err(SyncError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn update_status(&self, next: SyncStatus) {
        if let Err(err) = self.bus.set_status(next) {
            warn!(context_id = %self.id, status = %next, error = %err, "status not updated");
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
