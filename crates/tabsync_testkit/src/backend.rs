//! A remote backend that records calls and fails on demand.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tabsync_engine::{RemoteBackend, SyncError, SyncResult};
use tabsync_protocol::Entity;

/// One call received by a [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// `save` with the entity it received.
    Save(Entity),
    /// `delete` with the id it received.
    Delete(String),
}

impl BackendCall {
    /// Returns the affected entity id.
    pub fn id(&self) -> &str {
        match self {
            BackendCall::Save(entity) => &entity.id,
            BackendCall::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Retryable,
    Fatal,
}

/// Records every call in order.
///
/// Scripted failures are consumed one per call; with none scripted, calls
/// succeed unless [`RecordingBackend::fail_all`] is set.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    script: Mutex<VecDeque<Failure>>,
    fail_all: Mutex<Option<Failure>>,
}

impl RecordingBackend {
    /// Creates a backend that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with a retryable error.
    pub fn fail_next(&self, n: usize) {
        self.script
            .lock()
            .extend(std::iter::repeat(Failure::Retryable).take(n));
    }

    /// Makes the next call fail with a non-retryable error.
    pub fn reject_next(&self) {
        self.script.lock().push_back(Failure::Fatal);
    }

    /// Makes every call fail with a retryable error until cleared.
    pub fn fail_all(&self, failing: bool) {
        *self.fail_all.lock() = failing.then_some(Failure::Retryable);
    }

    /// Returns every recorded call, oldest first.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Forgets recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.script.lock().clear();
        *self.fail_all.lock() = None;
    }

    fn record(&self, call: BackendCall) -> SyncResult<()> {
        let id = call.id().to_string();
        self.calls.lock().push(call);

        let failure = self.script.lock().pop_front().or(*self.fail_all.lock());
        match failure {
            None => Ok(()),
            Some(Failure::Retryable) => Err(SyncError::backend_retryable(format!(
                "backend unavailable for {id}"
            ))),
            Some(Failure::Fatal) => Err(SyncError::backend_fatal(format!("backend rejected {id}"))),
        }
    }
}

impl RemoteBackend for RecordingBackend {
    fn save(&self, entity: &Entity) -> SyncResult<()> {
        self.record(BackendCall::Save(entity.clone()))
    }

    fn delete(&self, id: &str) -> SyncResult<()> {
        self.record(BackendCall::Delete(id.to_string()))
    }
}
