//! Cross-context events and their JSON envelope.
//!
//! Every message on the cross-context channel is a JSON object
//! `{kind, payload, timestamp, sourceContextId, busVersion}`. The payload is
//! decoded according to `kind` into a closed set of typed payloads; anything
//! else is rejected at the boundary.

use crate::conflict::ConflictStrategy;
use crate::entity::{Entity, Timestamp};
use crate::error::{ProtocolError, ProtocolResult};
use crate::tombstone::Tombstone;
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Synchronization status shared between contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing in progress.
    Idle,
    /// A sync is in progress.
    Syncing,
    /// The last sync completed.
    Synced,
    /// The last sync produced a conflict.
    Conflict,
    /// The backend is unreachable.
    Offline,
    /// The last sync failed.
    Error,
}

impl SyncStatus {
    /// Returns true if the state machine allows `self → next`.
    ///
    /// `idle → syncing → {synced | conflict | offline | error}`; settled
    /// states may go back to `syncing` or `idle`; `offline` and `error` are
    /// reachable from anywhere. Staying in the same state is always allowed.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;

        if *self == next || matches!(next, Offline | Error) {
            return true;
        }
        match self {
            Idle => next == Syncing,
            Syncing => matches!(next, Synced | Conflict),
            Synced | Conflict | Offline | Error => matches!(next, Syncing | Idle),
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of [`EventPayload`]; the key listeners subscribe on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// Bulk snapshot of the collection.
    EntitiesUpdated,
    /// One entity was removed.
    EntityDeleted,
    /// The sender's sync status changed.
    StatusChanged,
    /// The sender resolved a conflict.
    ConflictDetected,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 4] = [
        EventKind::EntitiesUpdated,
        EventKind::EntityDeleted,
        EventKind::StatusChanged,
        EventKind::ConflictDetected,
    ];

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntitiesUpdated => "entities-updated",
            EventKind::EntityDeleted => "entity-deleted",
            EventKind::StatusChanged => "status-changed",
            EventKind::ConflictDetected => "conflict-detected",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of [`EventKind::EntitiesUpdated`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitiesUpdated {
    /// The sender's full collection.
    pub entities: Vec<Entity>,
}

/// Payload of [`EventKind::EntityDeleted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDeleted {
    /// The removed id.
    pub id: String,
    /// Marker preventing resurrection by stale copies.
    pub tombstone: Tombstone,
}

/// Payload of [`EventKind::StatusChanged`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    /// The new status.
    pub status: SyncStatus,
}

/// Payload of [`EventKind::ConflictDetected`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetected {
    /// The conflicting entity.
    pub entity_id: String,
    /// How it was resolved.
    pub strategy: ConflictStrategy,
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// See [`EntitiesUpdated`].
    EntitiesUpdated(EntitiesUpdated),
    /// See [`EntityDeleted`].
    EntityDeleted(EntityDeleted),
    /// See [`StatusChanged`].
    StatusChanged(StatusChanged),
    /// See [`ConflictDetected`].
    ConflictDetected(ConflictDetected),
}

impl EventPayload {
    /// Bulk snapshot payload.
    pub fn entities_updated(entities: Vec<Entity>) -> Self {
        Self::EntitiesUpdated(EntitiesUpdated { entities })
    }

    /// Deletion payload.
    pub fn entity_deleted(tombstone: Tombstone) -> Self {
        Self::EntityDeleted(EntityDeleted {
            id: tombstone.id.clone(),
            tombstone,
        })
    }

    /// Status payload.
    pub fn status_changed(status: SyncStatus) -> Self {
        Self::StatusChanged(StatusChanged { status })
    }

    /// Conflict payload.
    pub fn conflict_detected(entity_id: impl Into<String>, strategy: ConflictStrategy) -> Self {
        Self::ConflictDetected(ConflictDetected {
            entity_id: entity_id.into(),
            strategy,
        })
    }

    /// Returns the discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::EntitiesUpdated(_) => EventKind::EntitiesUpdated,
            EventPayload::EntityDeleted(_) => EventKind::EntityDeleted,
            EventPayload::StatusChanged(_) => EventKind::StatusChanged,
            EventPayload::ConflictDetected(_) => EventKind::ConflictDetected,
        }
    }

    /// Decodes `payload` as the shape required by `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] if the shape does not match.
    pub fn from_value(kind: EventKind, payload: Value) -> ProtocolResult<Self> {
        fn typed<T: DeserializeOwned>(kind: EventKind, payload: Value) -> ProtocolResult<T> {
            serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
                kind: kind.as_str(),
                source,
            })
        }

        let payload = match kind {
            EventKind::EntitiesUpdated => Self::EntitiesUpdated(typed(kind, payload)?),
            EventKind::EntityDeleted => Self::EntityDeleted(typed(kind, payload)?),
            EventKind::StatusChanged => Self::StatusChanged(typed(kind, payload)?),
            EventKind::ConflictDetected => Self::ConflictDetected(typed(kind, payload)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> ProtocolResult<()> {
        match self {
            EventPayload::EntitiesUpdated(p) => {
                if p.entities.iter().any(|e| e.id.is_empty()) {
                    return Err(ProtocolError::invalid_envelope("entity with empty id"));
                }
            }
            EventPayload::EntityDeleted(p) => {
                if p.id.is_empty() || p.id != p.tombstone.id {
                    return Err(ProtocolError::invalid_envelope(
                        "deletion id does not match its tombstone",
                    ));
                }
            }
            EventPayload::StatusChanged(_) | EventPayload::ConflictDetected(_) => {}
        }
        Ok(())
    }
}

/// Undecoded envelope as it travels on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    /// Event kind.
    pub kind: EventKind,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: Value,
    /// Send time.
    pub timestamp: Timestamp,
    /// Id of the sending context.
    pub source_context_id: String,
    /// Sender-local sequence number.
    pub bus_version: u64,
}

/// A stamped event.
///
/// `bus_version` orders events from one bus only; it says nothing about
/// causality between contexts.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    /// Typed payload.
    pub payload: EventPayload,
    /// Send time.
    pub timestamp: Timestamp,
    /// Id of the sending context.
    pub source_context_id: String,
    /// Sender-local sequence number.
    pub bus_version: u64,
}

impl SyncEvent {
    /// Returns the event kind.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Encodes to the JSON wire envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes and validates a JSON wire envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid envelope or the payload
    /// does not match its kind.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Self::try_from(raw)
    }
}

impl TryFrom<RawEnvelope> for SyncEvent {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> ProtocolResult<Self> {
        if raw.source_context_id.is_empty() {
            return Err(ProtocolError::invalid_envelope("missing sourceContextId"));
        }
        Ok(Self {
            payload: EventPayload::from_value(raw.kind, raw.payload)?,
            timestamp: raw.timestamp,
            source_context_id: raw.source_context_id,
            bus_version: raw.bus_version,
        })
    }
}

impl Serialize for SyncEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("SyncEvent", 5)?;
        state.serialize_field("kind", &self.kind())?;
        match &self.payload {
            EventPayload::EntitiesUpdated(p) => state.serialize_field("payload", p)?,
            EventPayload::EntityDeleted(p) => state.serialize_field("payload", p)?,
            EventPayload::StatusChanged(p) => state.serialize_field("payload", p)?,
            EventPayload::ConflictDetected(p) => state.serialize_field("payload", p)?,
        }
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("sourceContextId", &self.source_context_id)?;
        state.serialize_field("busVersion", &self.bus_version)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for SyncEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::deserialize(deserializer)?;
        SyncEvent::try_from(raw).map_err(serde::de::Error::custom)
    }
}
