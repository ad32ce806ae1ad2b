//! Remote persistence backend abstraction.

use crate::error::SyncResult;
use tabsync_protocol::{Entity, OfflineOperation, OperationType};

/// The remote store every mutation is eventually written to.
///
/// Implementations report transient failures with
/// [`SyncError::backend_retryable`](crate::SyncError::backend_retryable)
/// and permanent ones with
/// [`SyncError::backend_fatal`](crate::SyncError::backend_fatal).
pub trait RemoteBackend: Send + Sync {
    /// Creates or replaces `entity`.
    fn save(&self, entity: &Entity) -> SyncResult<()>;

    /// Deletes the entity with `id`.
    fn delete(&self, id: &str) -> SyncResult<()>;
}

/// A backend that accepts everything and stores nothing.
///
/// Used by contexts that have no remote store configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl RemoteBackend for NoopBackend {
    fn save(&self, _entity: &Entity) -> SyncResult<()> {
        Ok(())
    }

    fn delete(&self, _id: &str) -> SyncResult<()> {
        Ok(())
    }
}

/// Sends one queued operation to `backend`.
///
/// Create and update payloads carry the full entity; a payload that does
/// not decode is a permanent failure.
pub(crate) fn dispatch(backend: &dyn RemoteBackend, op: &OfflineOperation) -> SyncResult<()> {
    match op.op_type {
        OperationType::Create | OperationType::Update => {
            let entity: Entity = serde_json::from_value(op.payload.clone()).map_err(|e| {
                crate::SyncError::backend_fatal(format!(
                    "operation {} carries an invalid entity: {e}",
                    op.id
                ))
            })?;
            backend.save(&entity)
        }
        OperationType::Delete => backend.delete(&op.resource_id),
    }
}
