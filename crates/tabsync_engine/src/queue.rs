//! Offline operation queue.
//!
//! Every remote effect of a local mutation goes through [`OfflineQueue::submit`].
//! While the backend is reachable and nothing older is pending the operation
//! is attempted right away; otherwise, or when that attempt fails, it is kept
//! and retried in FIFO order by [`OfflineQueue::drain`].
//!
//! ## Attempt accounting
//!
//! Each failed backend call increments `attempts`. An operation moves to
//! `failed` when `attempts` reaches `max_attempts` or when the error is not
//! retryable. Failed operations stay stored until [`OfflineQueue::retry`]
//! puts them back in line or [`OfflineQueue::clear`] drops them.

use crate::backend::{dispatch, RemoteBackend};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::listeners::{ListenerRegistry, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tabsync_protocol::{OfflineOperation, OperationStatus, OperationType, Timestamp};
use tabsync_storage::Persistence;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Snapshot handed to queue subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueState {
    /// Backend reachability.
    pub online: bool,
    /// Operations waiting for a drain pass, oldest first.
    pub queued: Vec<OfflineOperation>,
    /// Operations that gave up.
    pub failed: Vec<OfflineOperation>,
}

/// Counters describing the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Backend reachability.
    pub online: bool,
    /// Number of queued operations.
    pub queued: usize,
    /// Number of failed operations.
    pub failed: usize,
    /// Milliseconds since the queue observed the backend going offline.
    pub time_offline: Option<i64>,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations sent to the backend.
    pub attempted: usize,
    /// Operations the backend accepted.
    pub synced: usize,
    /// Operations that failed and stay queued.
    pub requeued: usize,
    /// Operations that moved to `failed`.
    pub failed: usize,
    /// Operations skipped because their backoff had not elapsed.
    pub skipped: usize,
}

/// Outcome of [`OfflineQueue::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The backend accepted the operation; nothing was stored.
    Synced,
    /// The operation is stored and waits for a drain pass.
    Queued(OfflineOperation),
    /// The operation failed permanently and is stored as failed.
    Failed(OfflineOperation),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedQueue {
    #[serde(default)]
    queued: Vec<OfflineOperation>,
    #[serde(default)]
    failed: Vec<OfflineOperation>,
}

struct QueueInner {
    // Queued and failed operations in enqueue order.
    ops: Vec<OfflineOperation>,
    offline_since: Option<Timestamp>,
}

/// Durable queue of pending remote operations.
pub struct OfflineQueue {
    config: QueueConfig,
    backend: Arc<dyn RemoteBackend>,
    persistence: Persistence,
    clock: Arc<dyn Clock>,
    connectivity: Connectivity,
    watcher: Mutex<watch::Receiver<bool>>,
    inner: Mutex<QueueInner>,
    listeners: ListenerRegistry<QueueState>,
}

impl OfflineQueue {
    /// Creates a queue and restores persisted operations.
    ///
    /// Operations that were persisted while `syncing` come back `queued`.
    pub fn new(
        config: QueueConfig,
        backend: Arc<dyn RemoteBackend>,
        persistence: Persistence,
        clock: Arc<dyn Clock>,
        connectivity: Connectivity,
    ) -> Self {
        let persisted: PersistedQueue = persistence
            .read_json(&config.storage_key)
            .unwrap_or_default();

        let mut ops = Vec::with_capacity(persisted.queued.len() + persisted.failed.len());
        for mut op in persisted.queued {
            op.status = OperationStatus::Queued;
            ops.push(op);
        }
        for mut op in persisted.failed {
            op.status = OperationStatus::Failed;
            ops.push(op);
        }
        ops.sort_by_key(|op| op.enqueued_at);

        if !ops.is_empty() {
            info!(restored = ops.len(), "offline queue restored");
        }

        let offline_since = (!connectivity.is_online()).then(|| clock.now_ms());
        let watcher = Mutex::new(connectivity.subscribe());

        Self {
            config,
            backend,
            persistence,
            clock,
            connectivity,
            watcher,
            inner: Mutex::new(QueueInner { ops, offline_since }),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Returns the connectivity handle the queue watches.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Returns true while the backend is reachable.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Stores a new operation without attempting it.
    pub fn enqueue(
        &self,
        op_type: OperationType,
        resource_type: &str,
        resource_id: &str,
        payload: Value,
    ) -> OfflineOperation {
        let op = self.new_operation(op_type, resource_type, resource_id, payload);
        debug!(op_id = %op.id, op_type = %op.op_type, resource_id, "operation queued");
        self.inner.lock().ops.push(op.clone());
        self.changed();
        op
    }

    /// Attempts an operation now if online and nothing is pending,
    /// otherwise queues it behind the pending operations.
    ///
    /// A failed immediate attempt counts as the first attempt.
    pub fn submit(
        &self,
        op_type: OperationType,
        resource_type: &str,
        resource_id: &str,
        payload: Value,
    ) -> SubmitOutcome {
        if !self.is_online() || self.has_pending() {
            return SubmitOutcome::Queued(self.enqueue(op_type, resource_type, resource_id, payload));
        }

        let mut op = self.new_operation(op_type, resource_type, resource_id, payload);
        match dispatch(self.backend.as_ref(), &op) {
            Ok(()) => {
                debug!(op_id = %op.id, op_type = %op.op_type, resource_id, "operation synced");
                SubmitOutcome::Synced
            }
            Err(err) => {
                self.record_failure(&mut op, &err);
                self.inner.lock().ops.push(op.clone());
                self.changed();
                if op.is_failed() {
                    SubmitOutcome::Failed(op)
                } else {
                    SubmitOutcome::Queued(op)
                }
            }
        }
    }

    /// Runs one FIFO pass over the operations queued when the pass starts.
    ///
    /// Does nothing while offline. Operations enqueued during the pass wait
    /// for the next one; no operation is attempted twice in one pass.
    pub fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.is_online() {
            debug!("drain skipped while offline");
            return report;
        }

        let pending: Vec<String> = self
            .inner
            .lock()
            .ops
            .iter()
            .filter(|op| op.is_queued())
            .map(|op| op.id.clone())
            .collect();

        for id in pending {
            if !self.is_online() {
                debug!("went offline mid-drain; stopping");
                break;
            }

            let Some(op) = self.begin_attempt(&id, &mut report) else {
                continue;
            };
            report.attempted += 1;

            let result = dispatch(self.backend.as_ref(), &op);

            let mut inner = self.inner.lock();
            let Some(index) = inner.ops.iter().position(|o| o.id == id) else {
                // Cleared while the backend call was in flight.
                continue;
            };
            match result {
                Ok(()) => {
                    inner.ops.remove(index);
                    report.synced += 1;
                    debug!(op_id = %id, "operation synced");
                }
                Err(err) => {
                    let op = &mut inner.ops[index];
                    self.record_failure(op, &err);
                    if op.is_failed() {
                        report.failed += 1;
                    } else {
                        report.requeued += 1;
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                requeued = report.requeued,
                failed = report.failed,
                "drain pass finished"
            );
            self.changed();
        }
        report
    }

    /// Drains once for every observed transition to online.
    ///
    /// Returns the report of the pass that ran, if any.
    pub fn poll_connectivity(&self) -> Option<DrainReport> {
        let online = {
            let mut watcher = self.watcher.lock();
            match watcher.has_changed() {
                Ok(true) => *watcher.borrow_and_update(),
                _ => return None,
            }
        };

        if !online {
            self.inner.lock().offline_since = Some(self.clock.now_ms());
            self.notify();
            return None;
        }

        self.inner.lock().offline_since = None;
        let report = self.drain();
        if report.attempted == 0 {
            self.notify();
        }
        Some(report)
    }

    /// Moves a failed operation back to `queued`. Attempts are kept.
    pub fn retry(&self, id: &str) -> bool {
        let found = {
            let mut inner = self.inner.lock();
            match inner.ops.iter_mut().find(|op| op.id == id && op.is_failed()) {
                Some(op) => {
                    op.status = OperationStatus::Queued;
                    true
                }
                None => false,
            }
        };

        if found {
            debug!(op_id = id, "failed operation requeued");
            self.changed();
        }
        found
    }

    /// Drops every stored operation.
    pub fn clear(&self) {
        self.inner.lock().ops.clear();
        self.persistence.remove(&self.config.storage_key);
        self.notify();
    }

    /// Returns queued operations, oldest first.
    pub fn list_queued(&self) -> Vec<OfflineOperation> {
        self.list(OperationStatus::Queued)
    }

    /// Returns failed operations, oldest first.
    pub fn list_failed(&self) -> Vec<OfflineOperation> {
        self.list(OperationStatus::Failed)
    }

    /// Returns the number of stored operations.
    pub fn len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot for subscribers.
    pub fn state(&self) -> QueueState {
        let inner = self.inner.lock();
        QueueState {
            online: self.is_online(),
            queued: filter_status(&inner.ops, OperationStatus::Queued),
            failed: filter_status(&inner.ops, OperationStatus::Failed),
        }
    }

    /// Returns queue counters.
    pub fn stats(&self) -> QueueStats {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        QueueStats {
            online: self.is_online(),
            queued: inner.ops.iter().filter(|op| op.is_queued()).count(),
            failed: inner.ops.iter().filter(|op| op.is_failed()).count(),
            time_offline: inner.offline_since.map(|at| now.saturating_sub(at)),
        }
    }

    /// Registers `callback` and invokes it once with the current state.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueueState) + Send + Sync + 'static,
    {
        callback(&self.state());
        self.listeners.subscribe(callback)
    }

    /// Returns true if an operation is queued or in flight.
    ///
    /// Failed operations are parked and do not hold back new ones.
    fn has_pending(&self) -> bool {
        self.inner.lock().ops.iter().any(|op| !op.is_failed())
    }

    pub(crate) fn close(&self) {
        self.listeners.clear();
    }

    fn new_operation(
        &self,
        op_type: OperationType,
        resource_type: &str,
        resource_id: &str,
        payload: Value,
    ) -> OfflineOperation {
        OfflineOperation::new(
            uuid::Uuid::new_v4().to_string(),
            op_type,
            resource_type,
            resource_id,
            payload,
            self.clock.now_ms(),
        )
    }

    /// Marks a queued operation `syncing` unless its backoff is pending.
    fn begin_attempt(&self, id: &str, report: &mut DrainReport) -> Option<OfflineOperation> {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut inner = self.inner.lock();
            let op = inner.ops.iter_mut().find(|op| op.id == id && op.is_queued())?;

            let delay = self.config.retry.delay_for_attempt(op.attempts).as_millis();
            let delay = i64::try_from(delay).unwrap_or(i64::MAX);
            if let Some(last) = op.last_attempt_at {
                if now < last.saturating_add(delay) {
                    report.skipped += 1;
                    return None;
                }
            }

            op.status = OperationStatus::Syncing;
            op.clone()
        };
        self.persist();
        Some(snapshot)
    }

    fn record_failure(&self, op: &mut OfflineOperation, err: &SyncError) {
        op.record_failure(self.clock.now_ms(), err.to_string());
        if !err.is_retryable() || op.attempts >= self.config.max_attempts {
            op.status = OperationStatus::Failed;
            warn!(
                op_id = %op.id,
                resource_id = %op.resource_id,
                attempts = op.attempts,
                error = %err,
                "operation failed permanently"
            );
        } else {
            op.status = OperationStatus::Queued;
            warn!(
                op_id = %op.id,
                resource_id = %op.resource_id,
                attempts = op.attempts,
                error = %err,
                "operation failed; will retry"
            );
        }
    }

    fn list(&self, status: OperationStatus) -> Vec<OfflineOperation> {
        filter_status(&self.inner.lock().ops, status)
    }

    fn persist(&self) {
        let persisted = {
            let inner = self.inner.lock();
            PersistedQueue {
                queued: inner
                    .ops
                    .iter()
                    .filter(|op| !op.is_failed())
                    .cloned()
                    .collect(),
                failed: filter_status(&inner.ops, OperationStatus::Failed),
            }
        };
        self.persistence
            .write_json(&self.config.storage_key, &persisted);
    }

    fn notify(&self) {
        let state = self.state();
        self.listeners.notify(&state);
    }

    fn changed(&self) {
        self.persist();
        self.notify();
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("online", &self.is_online())
            .field("len", &self.len())
            .finish()
    }
}

fn filter_status(ops: &[OfflineOperation], status: OperationStatus) -> Vec<OfflineOperation> {
    ops.iter().filter(|op| op.status == status).cloned().collect()
}
