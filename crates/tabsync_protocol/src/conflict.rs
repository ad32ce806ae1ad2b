//! Conflict detection and resolution.
//!
//! Resolution is last-writer-wins per field, not a CRDT. Numeric fields are
//! the one exception: under `merge` they take the larger value, so amounts
//! such as fees never regress when two contexts edit them concurrently.

use crate::entity::{Entity, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// How a detected conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the local record verbatim.
    Local,
    /// Take the remote record verbatim.
    Remote,
    /// Field-by-field merge, see [`merge`].
    Merge,
}

impl ConflictStrategy {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    /// The conflicting entity id.
    pub entity_id: String,
    /// Local state before resolution.
    pub local: Entity,
    /// Remote state that was received.
    pub remote: Entity,
    /// Strategy that was applied.
    pub strategy: ConflictStrategy,
    /// When the resolution happened.
    pub resolved_at: Timestamp,
}

/// Returns true if `local` and `remote` diverged.
///
/// Both the version and the modification time must differ; a redundant
/// re-broadcast of identical state therefore never counts as a conflict.
/// The check is symmetric.
pub fn detect_conflict(local: &Entity, remote: &Entity) -> bool {
    local.version != remote.version && local.modified_at != remote.modified_at
}

/// Returns true if `remote` is strictly more recent than `local`.
///
/// Recency is `modifiedAt`, then `modifiedBy` in lexical order, then
/// `version`. Two records equal on all three are a tie and `local` wins.
pub fn remote_is_newer(local: &Entity, remote: &Entity) -> bool {
    recency(remote, local) == Ordering::Greater
}

fn recency(a: &Entity, b: &Entity) -> Ordering {
    a.modified_at
        .cmp(&b.modified_at)
        .then_with(|| a.modified_by.cmp(&b.modified_by))
        .then_with(|| a.version.cmp(&b.version))
}

/// Merges two versions of one entity field by field.
///
/// - Sync metadata comes from the more recent side.
/// - Numeric fields present on both sides take the maximum.
/// - Every other field present on both sides, arrays included, takes the
///   remote value only if remote is strictly more recent.
/// - Fields present on one side only are kept.
pub fn merge(local: &Entity, remote: &Entity) -> Entity {
    let remote_newer = remote_is_newer(local, remote);
    let mut merged = local.clone();

    if remote_newer {
        merged.version = remote.version;
        merged.modified_at = remote.modified_at;
        merged.modified_by = remote.modified_by.clone();
    }

    for (key, remote_value) in &remote.fields {
        let chosen = match merged.fields.get(key) {
            None => remote_value.clone(),
            Some(Value::Number(l)) if remote_value.is_number() => {
                let r = remote_value.as_f64().unwrap_or(f64::MIN);
                if r > l.as_f64().unwrap_or(f64::MIN) {
                    remote_value.clone()
                } else {
                    continue;
                }
            }
            Some(_) if remote_newer => remote_value.clone(),
            Some(_) => continue,
        };
        merged.fields.insert(key.clone(), chosen);
    }

    merged
}

/// Resolves conflicts and keeps an append-only log of every resolution.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    log: Vec<ConflictResolution>,
}

impl ConflictResolver {
    /// Creates a resolver with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`detect_conflict`].
    pub fn detect_conflict(&self, local: &Entity, remote: &Entity) -> bool {
        detect_conflict(local, remote)
    }

    /// Resolves `local` against `remote` and records the resolution.
    pub fn resolve(
        &mut self,
        entity_id: &str,
        local: &Entity,
        remote: &Entity,
        strategy: ConflictStrategy,
        now: Timestamp,
    ) -> Entity {
        let resolved = match strategy {
            ConflictStrategy::Local => local.clone(),
            ConflictStrategy::Remote => remote.clone(),
            ConflictStrategy::Merge => merge(local, remote),
        };

        self.log.push(ConflictResolution {
            entity_id: entity_id.to_string(),
            local: local.clone(),
            remote: remote.clone(),
            strategy,
            resolved_at: now,
        });

        resolved
    }

    /// Returns every recorded resolution, oldest first.
    pub fn log(&self) -> &[ConflictResolution] {
        &self.log
    }

    /// Returns the resolutions recorded for one entity.
    pub fn log_for<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = &'a ConflictResolution> {
        self.log.iter().filter(move |r| r.entity_id == entity_id)
    }

    /// Returns the number of recorded resolutions.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Returns true if nothing has been resolved yet.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}
