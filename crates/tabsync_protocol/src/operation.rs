//! Offline operations.

use crate::entity::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of remote effect an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A new entity.
    Create,
    /// A patched entity.
    Update,
    /// A removed entity.
    Delete,
}

impl OperationType {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an offline operation.
///
/// `Queued → Syncing → {Synced | Failed}`; `Failed → Queued` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting for the next drain pass.
    Queued,
    /// Currently being sent to the backend.
    Syncing,
    /// Gave up; needs a manual retry.
    Failed,
    /// Accepted by the backend.
    Synced,
}

/// A pending remote operation recorded while the backend was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    /// Unique operation id.
    pub id: String,
    /// Create, update or delete.
    pub op_type: OperationType,
    /// Kind of resource (e.g. `show`).
    pub resource_type: String,
    /// Id of the affected resource.
    pub resource_id: String,
    /// Operation data; the full entity for create/update.
    pub payload: Value,
    /// When the operation was first queued.
    pub enqueued_at: Timestamp,
    /// Number of backend attempts so far.
    pub attempts: u32,
    /// Time of the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Current lifecycle state.
    pub status: OperationStatus,
}

impl OfflineOperation {
    /// Creates a queued operation with no attempts.
    pub fn new(
        id: impl Into<String>,
        op_type: OperationType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        payload: Value,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            op_type,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            payload,
            enqueued_at,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            status: OperationStatus::Queued,
        }
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self, now: Timestamp, error: impl Into<String>) {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.last_error = Some(error.into());
    }

    /// Returns true while the operation waits for a drain pass.
    pub fn is_queued(&self) -> bool {
        self.status == OperationStatus::Queued
    }

    /// Returns true if the operation needs manual intervention.
    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }
}
