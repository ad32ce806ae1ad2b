//! Versioned entity store.
//!
//! The store holds one context's authoritative copy of the collection. Local
//! mutations are versioned, persisted, broadcast to the other contexts and
//! submitted to the offline queue. Changes arriving from other contexts are
//! merged in, persisted and shown to subscribers, but never broadcast again
//! and never sent to the backend.
//!
//! ## Inbound rules
//!
//! For each incoming entity, compared with the local copy of the same id:
//!
//! | local vs remote                                        | action        |
//! |--------------------------------------------------------|---------------|
//! | no local copy, not tombstoned                          | insert        |
//! | same `version` and `modifiedAt`                        | ignore        |
//! | remote `version` greater, `modifiedAt` not older       | fast-forward  |
//! | local `version` greater, `modifiedAt` not older        | ignore        |
//! | anything else (concurrent edits)                       | resolve       |
//!
//! Entities missing from a bulk snapshot are kept; deletions travel as
//! `entity-deleted` events with a [`Tombstone`].

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::queue::{OfflineQueue, SubmitOutcome};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tabsync_protocol::{
    compare_by_field, ConflictResolution, ConflictResolver, Entity, EventKind, EventPayload,
    OperationType, Patch, SyncEvent, Timestamp, Tombstone, TombstoneSet,
};
use tabsync_storage::Persistence;
use tracing::{debug, info, warn};

#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Insert,
    Ignore,
    FastForward,
    Resolve,
}

fn classify(local: Option<&Entity>, remote: &Entity) -> Inbound {
    let Some(local) = local else {
        return Inbound::Insert;
    };

    if local.version == remote.version && local.modified_at == remote.modified_at {
        Inbound::Ignore
    } else if remote.version > local.version && remote.modified_at >= local.modified_at {
        Inbound::FastForward
    } else if local.version > remote.version && local.modified_at >= remote.modified_at {
        Inbound::Ignore
    } else {
        Inbound::Resolve
    }
}

#[derive(Default)]
struct StoreState {
    entities: Vec<Entity>,
    tombstones: TombstoneSet,
}

impl StoreState {
    fn position(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.id == id)
    }
}

/// One context's authoritative entity collection.
pub struct EntityStore {
    config: StoreConfig,
    actor: String,
    persistence: Persistence,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    queue: Arc<OfflineQueue>,
    state: RwLock<StoreState>,
    resolver: Mutex<ConflictResolver>,
    listeners: ListenerRegistry<[Entity]>,
    bus_subscriptions: Mutex<Vec<Subscription>>,
}

impl EntityStore {
    /// Loads the persisted collection and connects to `bus`.
    ///
    /// Never fails: unreadable data under the current key falls back to the
    /// legacy key and then to an empty collection.
    pub fn new(
        config: StoreConfig,
        actor: impl Into<String>,
        persistence: Persistence,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        queue: Arc<OfflineQueue>,
    ) -> Arc<Self> {
        let now = clock.now_ms();
        let mut entities = load_entities(&persistence, &config, now);
        entities.sort_by(|a, b| compare_by_field(a, b, &config.order_key));

        let mut tombstones: TombstoneSet = persistence
            .read_json(&config.tombstone_key)
            .unwrap_or_default();
        tombstones.purge_expired(now, ttl_ms(&config));

        info!(
            entities = entities.len(),
            tombstones = tombstones.len(),
            key = %config.storage_key,
            "entity store loaded"
        );

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let subscriptions = [EventKind::EntitiesUpdated, EventKind::EntityDeleted]
                .into_iter()
                .map(|kind| {
                    let weak = weak.clone();
                    bus.subscribe(kind, move |event| {
                        if let Some(store) = weak.upgrade() {
                            store.apply_remote(event);
                        }
                    })
                })
                .collect();

            Self {
                config,
                actor: actor.into(),
                persistence,
                clock,
                bus,
                queue,
                state: RwLock::new(StoreState {
                    entities,
                    tombstones,
                }),
                resolver: Mutex::new(ConflictResolver::new()),
                listeners: ListenerRegistry::new(),
                bus_subscriptions: Mutex::new(subscriptions),
            }
        })
    }

    /// Returns the actor stamped into `modifiedBy` on local mutations.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Returns a copy of every entity, in domain order.
    pub fn get_all(&self) -> Vec<Entity> {
        self.state.read().entities.clone()
    }

    /// Returns a copy of one entity.
    pub fn get_by_id(&self, id: &str) -> Option<Entity> {
        let state = self.state.read();
        state.position(id).map(|i| state.entities[i].clone())
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    /// Returns true if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the whole collection.
    ///
    /// Entities are normalized and sorted, then persisted, shown to
    /// subscribers and broadcast. Nothing is sent to the backend.
    pub fn set_all(&self, list: Vec<Entity>) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.write();
            let mut entities: Vec<Entity> = Vec::with_capacity(list.len());
            for mut entity in list {
                entity.normalize(now);
                self.clear_tombstone_for(&mut state.tombstones, &mut entity);
                match entities.iter().position(|e| e.id == entity.id) {
                    Some(i) => entities[i] = entity,
                    None => entities.push(entity),
                }
            }
            entities.sort_by(|a, b| compare_by_field(a, b, &self.config.order_key));
            state.entities = entities;
        }
        self.committed(true);
    }

    /// Adds an entity, replacing any entity with the same id.
    ///
    /// Returns the stored entity. A replaced entity's version still moves
    /// forward.
    pub fn add(&self, mut entity: Entity) -> Entity {
        let now = self.clock.now_ms();
        if entity.modified_by.is_empty() {
            entity.modified_by = self.actor.clone();
        }
        entity.normalize(now);

        let mut list = self.get_all();
        match list.iter().position(|e| e.id == entity.id) {
            Some(i) => {
                entity.version = entity.version.max(list[i].version + 1);
                list[i] = entity.clone();
            }
            None => list.push(entity.clone()),
        }
        self.set_all(list);

        let stored = self.get_by_id(&entity.id).unwrap_or(entity);
        debug!(id = %stored.id, version = stored.version, "entity added");
        self.submit(OperationType::Create, &stored.id, entity_payload(&stored));
        stored
    }

    /// Applies an allow-listed patch to one entity.
    ///
    /// Returns false if `id` is unknown or nothing in the patch is allowed.
    /// Keys outside the allow-list and the sync fields are dropped and
    /// logged.
    pub fn update(&self, id: &str, patch: Patch) -> bool {
        let (accepted, rejected) = self.config.allowed_fields.filter(patch);
        if !rejected.is_empty() {
            warn!(id, rejected = ?rejected, "dropping fields outside the allow-list");
        }
        if accepted.is_empty() {
            debug!(id, "empty patch ignored");
            return false;
        }

        let now = self.clock.now_ms();
        let updated = {
            let mut state = self.state.write();
            let Some(i) = state.position(id) else {
                debug!(id, "update of unknown entity ignored");
                return false;
            };
            let entity = &mut state.entities[i];
            entity.apply_patch(accepted, now, &self.actor);
            let updated = entity.clone();
            let order_key = &self.config.order_key;
            state.entities.sort_by(|a, b| compare_by_field(a, b, order_key));
            updated
        };
        self.committed(true);

        debug!(id, version = updated.version, "entity updated");
        self.submit(OperationType::Update, id, entity_payload(&updated));
        true
    }

    /// Removes one entity and records a tombstone for it.
    ///
    /// Returns false if `id` is unknown. The local removal stands even if
    /// the backend rejects the delete.
    pub fn remove(&self, id: &str) -> bool {
        let now = self.clock.now_ms();
        let tombstone = {
            let mut state = self.state.write();
            let Some(i) = state.position(id) else {
                debug!(id, "remove of unknown entity ignored");
                return false;
            };
            let entity = state.entities.remove(i);
            let tombstone = Tombstone::for_entity(&entity, now, &self.actor);
            state.tombstones.insert(tombstone.clone());
            tombstone
        };
        self.committed(false);

        if let Err(err) = self.bus.broadcast(EventPayload::entity_deleted(tombstone)) {
            debug!(id, error = %err, "deletion not broadcast");
        }

        debug!(id, "entity removed");
        match self.submit(OperationType::Delete, id, Value::Null) {
            SubmitOutcome::Synced => {}
            SubmitOutcome::Queued(op) | SubmitOutcome::Failed(op) => {
                warn!(
                    id,
                    op_id = %op.id,
                    error = op.last_error.as_deref().unwrap_or("offline"),
                    "remote delete pending; local removal kept"
                );
            }
        }
        true
    }

    /// Registers `callback` and invokes it once with the current snapshot.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Entity]) + Send + Sync + 'static,
    {
        let snapshot = self.get_all();
        callback(&snapshot);
        self.listeners.subscribe(callback)
    }

    /// Returns every conflict resolution recorded by this store.
    pub fn conflicts(&self) -> Vec<ConflictResolution> {
        self.resolver.lock().log().to_vec()
    }

    /// Returns the tombstone recorded for `id`.
    pub fn tombstone(&self, id: &str) -> Option<Tombstone> {
        self.state.read().tombstones.get(id).cloned()
    }

    /// Broadcasts the current collection without changing it.
    pub fn rebroadcast(&self) {
        let snapshot = self.get_all();
        if let Err(err) = self.bus.broadcast(EventPayload::entities_updated(snapshot)) {
            debug!(error = %err, "snapshot not broadcast");
        }
    }

    /// Applies an event received from another context.
    ///
    /// Events this context sent itself are ignored.
    pub fn apply_remote(&self, event: &SyncEvent) {
        if event.source_context_id == self.bus.context_id() {
            return;
        }

        match &event.payload {
            EventPayload::EntitiesUpdated(update) => {
                self.merge_remote(&update.entities, event.timestamp);
            }
            EventPayload::EntityDeleted(deleted) => {
                self.delete_remote(&deleted.tombstone);
            }
            EventPayload::StatusChanged(_) | EventPayload::ConflictDetected(_) => {}
        }
    }

    /// Disconnects from the bus and drops every subscriber.
    pub fn detach(&self) {
        for subscription in self.bus_subscriptions.lock().drain(..) {
            let _ = subscription.unsubscribe();
        }
        self.listeners.clear();
    }

    fn merge_remote(&self, remote: &[Entity], sent_at: Timestamp) {
        let now = self.clock.now_ms();
        let mut conflicts = Vec::new();
        let mut changed = false;

        {
            let mut state = self.state.write();
            for incoming in remote {
                let incoming = incoming.clone().normalized(sent_at);

                if state.tombstones.suppresses(&incoming) {
                    debug!(id = %incoming.id, version = incoming.version, "suppressed by tombstone");
                    continue;
                }
                if state.tombstones.remove(&incoming.id).is_some() {
                    debug!(id = %incoming.id, "tombstone superseded by newer entity");
                    changed = true;
                }

                let index = state.position(&incoming.id);
                match classify(index.map(|i| &state.entities[i]), &incoming) {
                    Inbound::Insert => {
                        state.entities.push(incoming);
                        changed = true;
                    }
                    Inbound::Ignore => {}
                    Inbound::FastForward => {
                        if let Some(i) = index {
                            state.entities[i] = incoming;
                            changed = true;
                        }
                    }
                    Inbound::Resolve => {
                        let Some(i) = index else { continue };
                        let local = state.entities[i].clone();
                        let strategy = self.config.conflict_strategy;
                        let mut resolved = self
                            .resolver
                            .lock()
                            .resolve(&local.id, &local, &incoming, strategy, now);
                        resolved.version = resolved.version.max(local.version);

                        info!(
                            id = %local.id,
                            %strategy,
                            local_version = local.version,
                            remote_version = incoming.version,
                            "conflict resolved"
                        );
                        if resolved != local {
                            state.entities[i] = resolved;
                            changed = true;
                        }
                        conflicts.push(local.id);
                    }
                }
            }

            if changed {
                let order_key = &self.config.order_key;
                state.entities.sort_by(|a, b| compare_by_field(a, b, order_key));
            }
        }

        if changed {
            self.committed(false);
        }
        for id in conflicts {
            if let Err(err) = self.bus.report_conflict(&id, self.config.conflict_strategy) {
                debug!(id = %id, error = %err, "conflict report not broadcast");
            }
        }
    }

    fn delete_remote(&self, tombstone: &Tombstone) {
        let removed = {
            let mut state = self.state.write();
            state.tombstones.insert(tombstone.clone());
            match state.position(&tombstone.id) {
                Some(i) if tombstone.suppresses(&state.entities[i]) => {
                    state.entities.remove(i);
                    true
                }
                Some(_) => {
                    debug!(id = %tombstone.id, "local copy is newer than remote deletion");
                    false
                }
                None => false,
            }
        };

        if removed {
            debug!(id = %tombstone.id, "entity removed by remote deletion");
        }
        self.committed(false);
    }

    /// Gives an entity that reuses a deleted id a version past the tombstone.
    fn clear_tombstone_for(&self, tombstones: &mut TombstoneSet, entity: &mut Entity) {
        if let Some(tombstone) = tombstones.remove(&entity.id) {
            entity.version = entity.version.max(tombstone.version + 1);
        }
    }

    /// Persists, notifies subscribers and optionally broadcasts the snapshot.
    fn committed(&self, broadcast: bool) {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut state = self.state.write();
            let purged = state.tombstones.purge_expired(now, ttl_ms(&self.config));
            if purged > 0 {
                debug!(purged, "expired tombstones dropped");
            }
            self.persist(&state);
            state.entities.clone()
        };

        self.listeners.notify(&snapshot);

        if broadcast {
            if let Err(err) = self.bus.broadcast(EventPayload::entities_updated(snapshot)) {
                debug!(error = %err, "snapshot not broadcast");
            }
        }
    }

    fn persist(&self, state: &StoreState) {
        self.persistence
            .write_json(&self.config.storage_key, &state.entities);
        if let Some(legacy) = &self.config.legacy_storage_key {
            self.persistence.write_json(legacy, &state.entities);
        }
        self.persistence
            .write_json(&self.config.tombstone_key, &state.tombstones);
    }

    fn submit(&self, op_type: OperationType, id: &str, payload: Value) -> SubmitOutcome {
        self.queue
            .submit(op_type, &self.config.resource_type, id, payload)
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("actor", &self.actor)
            .field("len", &self.len())
            .finish()
    }
}

fn ttl_ms(config: &StoreConfig) -> i64 {
    i64::try_from(config.tombstone_ttl.as_millis()).unwrap_or(i64::MAX)
}

fn entity_payload(entity: &Entity) -> Value {
    serde_json::to_value(entity).unwrap_or(Value::Null)
}

/// Reads the collection from the current key, then the legacy key.
///
/// Entries that do not decode are skipped; a value that is not a list at
/// all, or a non-empty list where nothing decodes, counts as missing.
fn load_entities(persistence: &Persistence, config: &StoreConfig, now: Timestamp) -> Vec<Entity> {
    let keys = std::iter::once(config.storage_key.as_str())
        .chain(config.legacy_storage_key.as_deref());

    for key in keys {
        let Some(raw) = persistence.read_json::<Vec<Value>>(key) else {
            continue;
        };

        let listed_nothing = raw.is_empty();
        let mut entities: Vec<Entity> = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<Entity>(value) {
                Ok(entity) if !entity.id.is_empty() => {
                    let entity = entity.normalized(now);
                    match entities.iter().position(|e| e.id == entity.id) {
                        Some(i) => entities[i] = entity,
                        None => entities.push(entity),
                    }
                }
                Ok(_) => warn!(key, "skipping persisted entity with empty id"),
                Err(err) => warn!(key, error = %err, "skipping unreadable persisted entity"),
            }
        }
        if entities.is_empty() && !listed_nothing {
            warn!(key, "no persisted entity could be read");
            continue;
        }
        return entities;
    }

    Vec::new()
}
