//! # TabSync Protocol
//!
//! Data model and conflict rules shared by every TabSync context.
//!
//! This crate provides:
//! - [`Entity`] with its sync metadata (`version`, `modifiedAt`, `modifiedBy`)
//! - [`SyncEvent`], a closed tagged union of cross-context events, and its
//!   JSON envelope codec
//! - [`OfflineOperation`] records for the offline queue
//! - [`Tombstone`]s marking deleted ids
//! - Conflict detection and resolution ([`ConflictResolver`])
//!
//! This is a pure protocol crate with no I/O operations. Timestamps are
//! passed in by the caller.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod error;
mod event;
mod operation;
mod tombstone;

pub use conflict::{
    detect_conflict, merge, remote_is_newer, ConflictResolution, ConflictResolver,
    ConflictStrategy,
};
pub use entity::{
    compare_by_field, Entity, FieldAllowList, Patch, Timestamp, RESERVED_FIELDS, SYSTEM_ACTOR,
};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    ConflictDetected, EntitiesUpdated, EntityDeleted, EventKind, EventPayload, RawEnvelope,
    StatusChanged, SyncEvent, SyncStatus,
};
pub use operation::{OfflineOperation, OperationStatus, OperationType};
pub use tombstone::{Tombstone, TombstoneSet};
