//! Cross-context event bus.
//!
//! The bus stamps outgoing events, keeps a bounded log of everything it has
//! sent or received, persists the most recent part of that log, and fans
//! events out to per-kind listeners. It also owns the context's
//! [`SyncStatus`] and its transition rules.
//!
//! ## Delivery
//!
//! - Outgoing events reach every other context on the channel and every
//!   local listener of their kind.
//! - Incoming envelopes are decoded and validated first; malformed ones are
//!   dropped. Events carrying this bus's own context id are discarded.
//! - Incoming `status-changed` events are adopted as the local status
//!   without being broadcast again.

use crate::channel::Channel;
use crate::clock::Clock;
use crate::config::BusConfig;
use crate::error::{SyncError, SyncResult};
use crate::listeners::{ListenerRegistry, Subscription};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tabsync_protocol::{
    ConflictStrategy, EventKind, EventPayload, SyncEvent, SyncStatus, Timestamp,
};
use tabsync_storage::Persistence;
use tracing::{debug, warn};

/// Point-in-time view of a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    /// Id of the owning context.
    pub context_id: String,
    /// Current status.
    pub status: SyncStatus,
    /// Events in the in-memory log.
    pub log_size: usize,
    /// Conflicts reported by this context.
    pub conflict_count: u64,
    /// Milliseconds since the status last became `synced`.
    pub time_since_last_sync: Option<i64>,
    /// Events in the persisted tail.
    pub persisted_log_count: usize,
}

struct BusState {
    log: VecDeque<SyncEvent>,
    next_version: u64,
    status: SyncStatus,
    conflict_count: u64,
    last_sync_at: Option<Timestamp>,
}

/// Broadcasts and receives [`SyncEvent`]s for one context.
pub struct EventBus {
    context_id: String,
    config: BusConfig,
    channel: Arc<dyn Channel>,
    persistence: Persistence,
    clock: Arc<dyn Clock>,
    state: Mutex<BusState>,
    listeners: HashMap<EventKind, ListenerRegistry<SyncEvent>>,
}

impl EventBus {
    /// Creates a bus and restores the persisted log tail.
    ///
    /// The `busVersion` counter resumes after the highest version this
    /// context recorded before.
    pub fn new(
        context_id: impl Into<String>,
        config: BusConfig,
        channel: Arc<dyn Channel>,
        persistence: Persistence,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let context_id = context_id.into();
        let restored = read_tail(&persistence, &config.log_key);

        let next_version = restored
            .iter()
            .filter(|e| e.source_context_id == context_id)
            .map(|e| e.bus_version)
            .max()
            .unwrap_or(0)
            + 1;

        let mut log: VecDeque<SyncEvent> = restored.into();
        while log.len() > config.capacity {
            log.pop_front();
        }

        debug!(
            context_id = %context_id,
            restored = log.len(),
            next_version,
            "event bus ready"
        );

        let listeners = EventKind::ALL
            .iter()
            .map(|kind| (*kind, ListenerRegistry::new()))
            .collect();

        Self {
            context_id,
            config,
            channel,
            persistence,
            clock,
            state: Mutex::new(BusState {
                log,
                next_version,
                status: SyncStatus::Idle,
                conflict_count: 0,
                last_sync_at: None,
            }),
            listeners,
        }
    }

    /// Returns the id of the owning context.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Stamps and sends `payload`.
    ///
    /// The event is logged and handed to local listeners even when posting
    /// to other contexts fails. A channel failure moves the status to
    /// `error` without broadcasting that change.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Channel`] if the event could not be posted.
    pub fn broadcast(&self, payload: EventPayload) -> SyncResult<SyncEvent> {
        let event = {
            let mut state = self.state.lock();
            let event = SyncEvent {
                payload,
                timestamp: self.clock.now_ms(),
                source_context_id: self.context_id.clone(),
                bus_version: state.next_version,
            };
            state.next_version += 1;
            self.append(&mut state, event.clone());
            event
        };
        self.persist_tail();

        let posted = event
            .encode()
            .map_err(SyncError::from)
            .and_then(|text| self.channel.post(&text).map_err(SyncError::from));

        if let Err(err) = &posted {
            warn!(
                context_id = %self.context_id,
                kind = %event.kind(),
                error = %err,
                "broadcast failed"
            );
            self.state.lock().status = SyncStatus::Error;
        }

        self.dispatch(&event);
        posted.map(|()| event)
    }

    /// Drains the channel inbox. Returns how many events were accepted.
    pub fn pump(&self) -> usize {
        let mut accepted = 0;
        while let Some(text) = self.channel.try_recv() {
            if self.deliver(&text).is_some() {
                accepted += 1;
            }
        }
        accepted
    }

    /// Handles one raw envelope as if it arrived on the channel.
    ///
    /// Returns the accepted event, or `None` if it was malformed or came
    /// from this context.
    pub fn deliver(&self, text: &str) -> Option<SyncEvent> {
        let event = match SyncEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(context_id = %self.context_id, error = %err, "dropping malformed envelope");
                return None;
            }
        };

        if event.source_context_id == self.context_id {
            debug!(bus_version = event.bus_version, "discarding own echo");
            return None;
        }

        {
            let mut state = self.state.lock();
            if let EventPayload::StatusChanged(change) = &event.payload {
                state.status = change.status;
                if change.status == SyncStatus::Synced {
                    state.last_sync_at = Some(self.clock.now_ms());
                }
            }
            self.append(&mut state, event.clone());
        }
        self.persist_tail();

        debug!(
            context_id = %self.context_id,
            kind = %event.kind(),
            source = %event.source_context_id,
            "event received"
        );
        self.dispatch(&event);
        Some(event)
    }

    /// Registers `callback` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.registry(kind).subscribe(callback)
    }

    /// Returns the number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry(kind).len()
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.state.lock().status
    }

    /// Moves to `next` and broadcasts the change.
    ///
    /// Setting the current status again does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] if the move is not
    /// allowed, or [`SyncError::Channel`] if the change could not be posted.
    pub fn set_status(&self, next: SyncStatus) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            let current = state.status;
            if current == next {
                return Ok(());
            }
            if !current.can_transition_to(next) {
                return Err(SyncError::InvalidStateTransition {
                    from: current,
                    to: next,
                });
            }
            state.status = next;
            if next == SyncStatus::Synced {
                state.last_sync_at = Some(self.clock.now_ms());
            }
        }

        debug!(context_id = %self.context_id, status = %next, "status changed");
        self.broadcast(EventPayload::status_changed(next)).map(|_| ())
    }

    /// Runs a manual sync round: `syncing`, then `synced`.
    ///
    /// # Errors
    ///
    /// Fails like [`EventBus::set_status`].
    pub fn force_sync(&self) -> SyncResult<()> {
        self.set_status(SyncStatus::Syncing)?;
        self.set_status(SyncStatus::Synced)
    }

    /// Counts a resolved conflict and tells the other contexts.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Channel`] if the report could not be posted.
    pub fn report_conflict(&self, entity_id: &str, strategy: ConflictStrategy) -> SyncResult<()> {
        self.state.lock().conflict_count += 1;
        self.broadcast(EventPayload::conflict_detected(entity_id, strategy))
            .map(|_| ())
    }

    /// Always true; there is no leader election.
    pub fn is_primary(&self) -> bool {
        true
    }

    /// Returns a snapshot of the bus.
    pub fn stats(&self) -> BusStats {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        BusStats {
            context_id: self.context_id.clone(),
            status: state.status,
            log_size: state.log.len(),
            conflict_count: state.conflict_count,
            time_since_last_sync: state.last_sync_at.map(|at| now.saturating_sub(at)),
            persisted_log_count: self.restore_log().len(),
        }
    }

    /// Returns the in-memory log, oldest first.
    pub fn event_log(&self) -> Vec<SyncEvent> {
        self.state.lock().log.iter().cloned().collect()
    }

    /// Returns the persisted log tail, oldest first.
    pub fn restore_log(&self) -> Vec<SyncEvent> {
        read_tail(&self.persistence, &self.config.log_key)
    }

    /// Clears the in-memory log and the persisted tail.
    ///
    /// The `busVersion` counter keeps counting.
    pub fn clear_event_log(&self) {
        self.state.lock().log.clear();
        self.persistence.remove(&self.config.log_key);
    }

    /// Closes the channel endpoint and drops every listener.
    pub fn close(&self) {
        self.channel.close();
        for registry in self.listeners.values() {
            registry.clear();
        }
    }

    fn registry(&self, kind: EventKind) -> &ListenerRegistry<SyncEvent> {
        // Every kind is registered in `new`.
        &self.listeners[&kind]
    }

    fn append(&self, state: &mut BusState, event: SyncEvent) {
        state.log.push_back(event);
        while state.log.len() > self.config.capacity {
            state.log.pop_front();
        }
    }

    fn persist_tail(&self) {
        let tail: Vec<SyncEvent> = {
            let state = self.state.lock();
            let skip = state.log.len().saturating_sub(self.config.persisted_tail);
            state.log.iter().skip(skip).cloned().collect()
        };
        self.persistence.write_json(&self.config.log_key, &tail);
    }

    fn dispatch(&self, event: &SyncEvent) {
        self.registry(event.kind()).notify(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("context_id", &self.context_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Reads the persisted tail, skipping entries that no longer decode.
fn read_tail(persistence: &Persistence, key: &str) -> Vec<SyncEvent> {
    let Some(raw) = persistence.read_json::<Vec<Value>>(key) else {
        return Vec::new();
    };

    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<SyncEvent>(value) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(key, error = %err, "skipping unreadable persisted event");
                None
            }
        })
        .collect()
}
