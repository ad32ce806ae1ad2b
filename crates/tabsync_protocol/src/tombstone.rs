//! Deletion markers.

use crate::entity::{Entity, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marks an id as deleted at a given version.
///
/// A late-arriving copy of the entity whose version is not newer than the
/// tombstone is suppressed instead of resurrecting the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// The deleted entity id.
    pub id: String,
    /// Version assigned to the deletion (last live version + 1).
    pub version: u64,
    /// When the deletion happened.
    pub deleted_at: Timestamp,
    /// Who deleted it.
    pub deleted_by: String,
}

impl Tombstone {
    /// Creates a tombstone for `entity` deleted at `now` by `actor`.
    pub fn for_entity(entity: &Entity, now: Timestamp, actor: &str) -> Self {
        Self {
            id: entity.id.clone(),
            version: entity.version + 1,
            deleted_at: now,
            deleted_by: actor.to_string(),
        }
    }

    /// Returns true if `entity` is an older or concurrent copy of the
    /// deleted record.
    pub fn suppresses(&self, entity: &Entity) -> bool {
        entity.id == self.id && entity.version <= self.version
    }

    /// Returns true once the tombstone is older than `ttl_ms`.
    pub fn is_expired(&self, now: Timestamp, ttl_ms: i64) -> bool {
        now.saturating_sub(self.deleted_at) > ttl_ms
    }
}

/// Tombstones keyed by entity id.
///
/// Serialized as a plain list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Tombstone>", into = "Vec<Tombstone>")]
pub struct TombstoneSet {
    entries: BTreeMap<String, Tombstone>,
}

impl TombstoneSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a tombstone, keeping the higher version if one exists.
    pub fn insert(&mut self, tombstone: Tombstone) {
        match self.entries.get(&tombstone.id) {
            Some(existing) if existing.version >= tombstone.version => {}
            _ => {
                self.entries.insert(tombstone.id.clone(), tombstone);
            }
        }
    }

    /// Returns the tombstone for `id`.
    pub fn get(&self, id: &str) -> Option<&Tombstone> {
        self.entries.get(id)
    }

    /// Returns true if `entity` must not be (re)inserted.
    pub fn suppresses(&self, entity: &Entity) -> bool {
        self.entries
            .get(&entity.id)
            .is_some_and(|t| t.suppresses(entity))
    }

    /// Forgets the tombstone for `id`.
    pub fn remove(&mut self, id: &str) -> Option<Tombstone> {
        self.entries.remove(id)
    }

    /// Drops expired tombstones. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Timestamp, ttl_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, t| !t.is_expired(now, ttl_ms));
        before - self.entries.len()
    }

    /// Returns the number of tombstones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no tombstones.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Vec<Tombstone>> for TombstoneSet {
    fn from(list: Vec<Tombstone>) -> Self {
        let mut set = Self::new();
        for tombstone in list {
            set.insert(tombstone);
        }
        set
    }
}

impl From<TombstoneSet> for Vec<Tombstone> {
    fn from(set: TombstoneSet) -> Self {
        set.entries.into_values().collect()
    }
}
