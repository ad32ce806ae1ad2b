//! Entity store behavior within a single context.

use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabsync_engine::{
    ContextConfig, ContextDeps, DisabledChannel, ManualClock, StoreConfig, SyncContext,
    DEFAULT_LEGACY_STORAGE_KEY, DEFAULT_STORAGE_KEY,
};
use tabsync_protocol::{Entity, FieldAllowList, OperationType};
use tabsync_storage::{FileBackend, Persistence};
use tabsync_testkit::prelude::*;

fn solo(persistence: &Persistence, clock: &ManualClock) -> SyncContext {
    init_tracing();
    let deps = ContextDeps::new(Arc::new(DisabledChannel), persistence.clone())
        .with_clock(Arc::new(clock.clone()));
    SyncContext::init(ContextConfig::new().with_context_id("solo"), deps)
}

#[test]
fn set_all_sorts_by_date_then_id() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();

    store.set_all(vec![
        show("b", "2025-03-01", 1),
        show("c", "2025-01-15", 1),
        show("a", "2025-03-01", 1),
    ]);

    let ids: Vec<String> = store.get_all().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
}

#[test]
fn set_all_normalizes_and_never_calls_backend() {
    let cluster = TestCluster::new(&["A"]);
    cluster.set_time(4242);
    let store = cluster.context("A").store();

    store.set_all(vec![show("s1", "2025-01-01", 10)]);

    let stored = store.get_by_id("s1").unwrap();
    assert_eq!(stored.version, 0);
    assert_eq!(stored.modified_at, 4242);
    assert_eq!(stored.modified_by, "system");
    assert_eq!(cluster.backend.call_count(), 0);
}

#[test]
fn snapshots_are_copies() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    store.add(show("s1", "2025-01-01", 10));

    let mut copy = store.get_by_id("s1").unwrap();
    copy.fields.insert("fee".into(), json!(999));

    assert_eq!(store.get_by_id("s1").unwrap().number("fee"), Some(10.0));
}

#[test]
fn add_submits_create_and_stamps_actor() {
    let cluster = TestCluster::new(&["A"]);
    cluster.set_time(5000);
    let stored = cluster.context("A").store().add(show("s1", "2025-01-01", 10));

    assert_eq!(stored.modified_by, "A");
    assert_eq!(stored.modified_at, 5000);
    assert_eq!(cluster.backend.calls(), vec![BackendCall::Save(stored)]);
}

#[test]
fn add_replacing_an_entity_moves_version_forward() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();

    store.add(show("s1", "2025-01-01", 10).with_meta(4, 1000, "A"));
    let replaced = store.add(show("s1", "2025-01-01", 20));

    assert_eq!(store.len(), 1);
    assert_eq!(replaced.version, 5);
    assert_eq!(replaced.number("fee"), Some(20.0));
}

#[test]
fn update_filters_patch_and_bumps_version() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    store.add(show("s1", "2025-01-01", 10).with_meta(1, 1000, "A"));

    cluster.set_time(2000);
    let changed = store.update(
        "s1",
        patch([
            ("fee", json!(200)),
            ("isAdmin", json!(true)),
            ("version", json!(99)),
            ("modifiedBy", json!("mallory")),
        ]),
    );

    assert!(changed);
    let stored = store.get_by_id("s1").unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.modified_at, 2000);
    assert_eq!(stored.modified_by, "A");
    assert_eq!(stored.number("fee"), Some(200.0));
    assert!(stored.field("isAdmin").is_none());
}

#[test]
fn fully_rejected_patch_changes_nothing() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    store.add(show("s1", "2025-01-01", 10).with_meta(1, 1000, "A"));
    cluster.backend.reset();
    let log_len = cluster.context("A").bus().event_log().len();

    assert!(!store.update("s1", patch([("isAdmin", json!(true)), ("version", json!(9))])));

    assert_eq!(store.get_by_id("s1").unwrap().version, 1);
    assert_eq!(cluster.backend.call_count(), 0);
    assert_eq!(cluster.context("A").bus().event_log().len(), log_len);
}

#[test]
fn update_of_unknown_id_is_a_noop() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();

    assert!(!store.update("ghost", patch([("fee", 1)])));
    assert!(store.is_empty());
    assert_eq!(cluster.backend.call_count(), 0);
}

#[test]
fn subscribe_replays_current_snapshot_first() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    store.set_all(vec![show("s1", "2025-01-01", 1), show("s2", "2025-01-02", 2)]);

    let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let subscription = store.subscribe(move |entities| sink.lock().push(entities.len()));

    assert_eq!(*calls.lock(), vec![2]);

    store.remove("s1");
    assert_eq!(*calls.lock(), vec![2, 1]);

    assert!(subscription.unsubscribe());
    store.remove("s2");
    assert_eq!(*calls.lock(), vec![2, 1]);
}

#[test]
fn panicking_subscriber_does_not_break_mutation() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    let _bad = store.subscribe(|entities| {
        if !entities.is_empty() {
            panic!("subscriber bug");
        }
    });

    store.add(show("s1", "2025-01-01", 1));
    assert_eq!(store.len(), 1);
}

#[test]
fn remove_records_tombstone_and_submits_delete() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    store.add(show("s1", "2025-01-01", 1).with_meta(3, 1000, "A"));
    cluster.backend.reset();

    assert!(store.remove("s1"));
    assert!(!store.remove("s1"));

    assert!(store.get_by_id("s1").is_none());
    assert_eq!(store.tombstone("s1").map(|t| t.version), Some(4));
    assert_eq!(cluster.backend.calls(), vec![BackendCall::Delete("s1".into())]);
}

#[test]
fn re_adding_a_deleted_id_outranks_its_tombstone() {
    let cluster = TestCluster::new(&["A"]);
    let store = cluster.context("A").store();
    store.add(show("s1", "2025-01-01", 1).with_meta(3, 1000, "A"));
    store.remove("s1");

    let again = store.add(show("s1", "2025-01-01", 2));
    assert_eq!(again.version, 5);
    assert!(store.tombstone("s1").is_none());
}

#[test]
fn persistence_round_trip_in_memory() {
    let storage = Persistence::in_memory();
    let clock = ManualClock::new(1000);

    let first = solo(&storage, &clock);
    first.store().set_all(vec![
        show("s1", "2025-01-01", 1).with_meta(3, 900, "A"),
        show("s2", "2025-01-02", 2).with_meta(1, 800, "B"),
    ]);
    first.destroy();

    let second = solo(&storage, &clock);
    let versions: Vec<(String, u64)> = second
        .store()
        .get_all()
        .into_iter()
        .map(|e| (e.id, e.version))
        .collect();
    assert_eq!(versions, vec![("s1".into(), 3), ("s2".into(), 1)]);
}

#[test]
fn persistence_round_trip_on_disk() {
    let storage = TempPersistence::new();
    let clock = ManualClock::new(1000);

    let first = solo(&storage, &clock);
    first.store().add(show("s1", "2025-01-01", 1));
    first.store().update("s1", patch([("fee", 5)]));
    let expected = first.store().get_all();
    first.destroy();

    let second = solo(&storage, &clock);
    assert_eq!(second.store().get_all(), expected);
}

#[test]
fn reopened_directory_restores_collection_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let open = || Persistence::new(Arc::new(FileBackend::open(dir.path()).unwrap()));
    let clock = ManualClock::new(1000);

    let first = solo(&open(), &clock);
    first.store().add(show("s1", "2025-01-01", 1).with_meta(2, 900, "A"));
    first.store().add(show("s2", "2025-01-02", 1));
    first.store().remove("s1");
    first.destroy();

    let second = solo(&open(), &clock);
    assert!(second.store().get_by_id("s1").is_none());
    assert!(second.store().get_by_id("s2").is_some());
    assert_eq!(second.store().tombstone("s1").map(|t| t.version), Some(3));
}

#[test]
fn expired_tombstones_are_dropped_on_boot() {
    let storage = Persistence::in_memory();
    let clock = ManualClock::new(1000);

    let first = solo(&storage, &clock);
    first.store().add(show("s1", "2025-01-01", 1));
    first.store().remove("s1");
    first.destroy();

    clock.advance(Duration::from_secs(25 * 60 * 60));
    let second = solo(&storage, &clock);
    assert!(second.store().tombstone("s1").is_none());
}

#[test]
fn collection_is_mirrored_to_legacy_key() {
    let storage = Persistence::in_memory();
    let ctx = solo(&storage, &ManualClock::new(1000));
    ctx.store().add(show("s1", "2025-01-01", 1));

    let current: Vec<Entity> = storage.read_json(DEFAULT_STORAGE_KEY).unwrap();
    let legacy: Vec<Entity> = storage.read_json(DEFAULT_LEGACY_STORAGE_KEY).unwrap();
    assert_eq!(current, legacy);
}

#[test]
fn boot_falls_back_to_legacy_key() {
    let storage = Persistence::in_memory();
    storage
        .backend()
        .put(DEFAULT_STORAGE_KEY, b"{not json")
        .unwrap();
    storage.write_json(
        DEFAULT_LEGACY_STORAGE_KEY,
        &json!([{"id": "old", "__version": 7, "__modifiedAt": 100, "__modifiedBy": "tab", "fee": 1}]),
    );

    let ctx = solo(&storage, &ManualClock::new(1000));
    let old = ctx.store().get_by_id("old").unwrap();
    assert_eq!(old.version, 7);
    assert_eq!(old.modified_by, "tab");
}

#[test]
fn boot_falls_back_when_no_current_entry_decodes() {
    let storage = Persistence::in_memory();
    storage.write_json(DEFAULT_STORAGE_KEY, &json!([42, {"fee": 3}]));
    storage.write_json(DEFAULT_LEGACY_STORAGE_KEY, &json!([{"id": "old", "__version": 2}]));

    let ctx = solo(&storage, &ManualClock::new(1000));
    assert_eq!(ctx.store().get_by_id("old").map(|e| e.version), Some(2));
}

#[test]
fn boot_skips_bad_entries_and_survives_garbage() {
    let storage = Persistence::in_memory();
    storage.write_json(
        DEFAULT_STORAGE_KEY,
        &json!([{"id": "ok"}, {"fee": 3}, 42, {"id": ""}]),
    );
    let ctx = solo(&storage, &ManualClock::new(1000));
    assert_eq!(ctx.store().len(), 1);
    assert_eq!(ctx.store().get_by_id("ok").unwrap().modified_at, 1000);

    let garbage = Persistence::in_memory();
    garbage.backend().put(DEFAULT_STORAGE_KEY, b"\xff\xfe").unwrap();
    garbage.backend().put(DEFAULT_LEGACY_STORAGE_KEY, b"[1,").unwrap();
    assert!(solo(&garbage, &ManualClock::new(1000)).store().is_empty());
}

#[test]
fn custom_order_key_and_resource_type() {
    let config = || {
        ContextConfig::new().with_store(
            StoreConfig::new()
                .with_order_key("fee")
                .with_resource_type("venue"),
        )
    };
    let cluster = TestCluster::with_config(&["A"], config);
    cluster.set_online(false);
    cluster.tick("A");

    let store = cluster.context("A").store();
    store.add(show("x", "2025-01-01", 30));
    store.add(show("y", "2025-01-01", 10));

    let ids: Vec<String> = store.get_all().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["y", "x"]);

    let queued = cluster.context("A").queue().list_queued();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|op| op.resource_type == "venue"));
    assert!(queued.iter().all(|op| op.op_type == OperationType::Create));
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn versions_only_move_forward(ops in operation_sequence_strategy(1, 24)) {
        let cluster = TestCluster::new(&["A"]);
        let store = cluster.context("A").store();
        let mut last: HashMap<String, u64> = HashMap::new();

        for op in ops {
            match op {
                StoreOperation::Add(entity) => {
                    let id = entity.id.clone();
                    let stored = store.add(entity);
                    if let Some(prev) = last.get(&id) {
                        prop_assert!(stored.version > *prev, "add of {} went {} -> {}", id, prev, stored.version);
                    }
                    last.insert(id, stored.version);
                }
                StoreOperation::Update { id, patch } => {
                    let before = store.get_by_id(&id);
                    let allowed = patch.keys().any(|k| FieldAllowList::shows().allows(k));
                    let changed = store.update(&id, patch);
                    prop_assert_eq!(changed, before.is_some() && allowed);
                    if let Some(before) = before {
                        let after = store.get_by_id(&id).unwrap();
                        let bump = u64::from(changed);
                        prop_assert_eq!(after.version, before.version + bump);
                        last.insert(id, after.version);
                    }
                }
                StoreOperation::Remove { id } => {
                    store.remove(&id);
                    prop_assert!(store.get_by_id(&id).is_none());
                }
            }
        }
    }
}
