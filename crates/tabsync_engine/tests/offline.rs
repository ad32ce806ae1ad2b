//! Offline queueing, reconnect draining and failure accounting.

use parking_lot::Mutex;
use std::sync::Arc;
use tabsync_engine::{ContextConfig, QueueConfig};
use tabsync_protocol::{OperationStatus, OperationType, SyncStatus};
use tabsync_testkit::prelude::*;

fn online_with_show() -> TestCluster {
    let cluster = TestCluster::new(&["A"]);
    cluster
        .context("A")
        .store()
        .add(stamped_show("X", 100, 1, 1000, "A"));
    cluster.backend.reset();
    cluster
}

#[test]
fn offline_update_is_queued_then_sent_once() {
    let cluster = online_with_show();
    let ctx = cluster.context("A");

    cluster.set_online(false);
    cluster.tick("A");
    assert_eq!(ctx.bus().status(), SyncStatus::Offline);

    assert!(ctx.store().update("X", patch([("fee", 300)])));
    assert_eq!(cluster.backend.call_count(), 0);

    let queued = ctx.queue().list_queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].op_type, OperationType::Update);
    assert_eq!(queued[0].resource_id, "X");
    assert_eq!(queued[0].status, OperationStatus::Queued);
    assert_eq!(queued[0].attempts, 0);

    cluster.set_online(true);
    let report = ctx.tick().unwrap().drained.unwrap();
    assert_eq!(report.synced, 1);

    let calls = cluster.backend.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        BackendCall::Save(entity) => {
            assert_eq!(entity.version, 2);
            assert_eq!(entity.number("fee"), Some(300.0));
        }
        other => panic!("unexpected call {other:?}"),
    }
    assert!(ctx.queue().is_empty());
    assert_eq!(ctx.bus().status(), SyncStatus::Synced);
}

#[test]
fn reconnect_drains_in_fifo_order() {
    let cluster = online_with_show();
    let store = cluster.context("A").store();

    cluster.set_online(false);
    store.add(show("s1", "2025-01-01", 1));
    store.update("s1", patch([("fee", 2)]));
    store.add(show("s2", "2025-01-02", 3));
    store.remove("X");

    let kinds: Vec<OperationType> = cluster
        .context("A")
        .queue()
        .list_queued()
        .into_iter()
        .map(|op| op.op_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            OperationType::Create,
            OperationType::Update,
            OperationType::Create,
            OperationType::Delete
        ]
    );

    cluster.set_online(true);
    cluster.tick("A");

    let calls: Vec<(bool, String)> = cluster
        .backend
        .calls()
        .into_iter()
        .map(|c| (matches!(c, BackendCall::Save(_)), c.id().to_string()))
        .collect();
    assert_eq!(
        calls,
        vec![
            (true, "s1".into()),
            (true, "s1".into()),
            (true, "s2".into()),
            (false, "X".into()),
        ]
    );
}

#[test]
fn reconnect_drains_only_once() {
    let cluster = online_with_show();
    cluster.set_online(false);
    cluster.context("A").store().update("X", patch([("fee", 1)]));

    cluster.set_online(true);
    assert!(cluster.context("A").tick().unwrap().drained.is_some());
    assert!(cluster.context("A").tick().unwrap().drained.is_none());
    assert_eq!(cluster.backend.call_count(), 1);
}

#[test]
fn failed_remote_delete_keeps_local_removal() {
    let cluster = online_with_show();
    let ctx = cluster.context("A");
    cluster.backend.fail_all(true);

    assert!(ctx.store().remove("X"));
    assert!(ctx.store().get_by_id("X").is_none());

    let queued = ctx.queue().list_queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].op_type, OperationType::Delete);
    assert_eq!(queued[0].attempts, 1);
    assert!(queued[0].last_error.is_some());

    cluster.backend.fail_all(false);
    assert_eq!(ctx.queue().drain().synced, 1);
    assert!(ctx.queue().is_empty());
}

#[test]
fn retryable_failures_exhaust_attempts() {
    let cluster = online_with_show();
    let queue = cluster.context("A").queue();
    cluster.backend.fail_all(true);

    cluster.context("A").store().update("X", patch([("fee", 7)]));
    assert_eq!(queue.list_queued()[0].attempts, 1);

    let second = queue.drain();
    assert_eq!((second.attempted, second.requeued), (1, 1));

    let third = queue.drain();
    assert_eq!(third.failed, 1);
    assert!(queue.list_queued().is_empty());

    let failed = queue.list_failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);

    // The local edit is not rolled back.
    let x = cluster.context("A").store().get_by_id("X").unwrap();
    assert_eq!(x.number("fee"), Some(7.0));

    assert_eq!(queue.drain().attempted, 0);
}

#[test]
fn retry_requeues_failed_operation() {
    let cluster = online_with_show();
    let queue = cluster.context("A").queue();
    cluster.backend.reject_next();

    cluster.context("A").store().update("X", patch([("fee", 9)]));
    let failed = queue.list_failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 1);

    assert!(!queue.retry("no-such-op"));
    assert!(queue.retry(&failed[0].id));
    assert!(!queue.retry(&failed[0].id));

    let queued = queue.list_queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].attempts, 1);

    assert_eq!(queue.drain().synced, 1);
    assert!(queue.is_empty());
}

#[test]
fn failed_drain_reports_error_status() {
    let cluster = online_with_show();
    cluster.set_online(false);
    cluster.context("A").store().update("X", patch([("fee", 11)]));

    cluster.backend.reject_next();
    cluster.set_online(true);
    let report = cluster.context("A").tick().unwrap().drained.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(cluster.context("A").bus().status(), SyncStatus::Error);
    assert_eq!(cluster.context("A").stats().queue.failed, 1);
}

#[test]
fn single_attempt_threshold() {
    let cluster = TestCluster::with_config(&["A"], || {
        ContextConfig::new().with_queue(QueueConfig::new().with_max_attempts(1))
    });
    cluster.backend.fail_next(1);

    cluster.context("A").store().add(show("s1", "2025-01-01", 1));
    assert_eq!(cluster.context("A").queue().list_failed().len(), 1);
}

#[test]
fn queue_survives_restart() {
    let mut cluster = TestCluster::new(&["A"]);
    cluster.set_online(false);
    cluster.context("A").store().add(show("s1", "2025-01-01", 1));
    cluster.leave("A");

    cluster.join("A2", ContextConfig::new());
    let restored = cluster.context("A2").queue().list_queued();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].resource_id, "s1");

    cluster.set_online(true);
    cluster.tick("A2");
    assert_eq!(cluster.backend.call_count(), 1);
    assert!(cluster.context("A2").queue().is_empty());
}

#[test]
fn subscribers_see_queue_changes() {
    let cluster = online_with_show();
    let queue = cluster.context("A").queue();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = queue.subscribe(move |state| {
        sink.lock().push((state.online, state.queued.len()));
    });
    assert_eq!(seen.lock().first(), Some(&(true, 0)));

    cluster.set_online(false);
    cluster.tick("A");
    cluster.context("A").store().update("X", patch([("fee", 1)]));

    assert_eq!(seen.lock().last(), Some(&(false, 1)));
}

#[test]
fn time_offline_is_tracked() {
    let cluster = online_with_show();
    let queue = cluster.context("A").queue();
    assert_eq!(queue.stats().time_offline, None);

    cluster.set_online(false);
    cluster.tick("A");
    cluster.set_time(1750);
    assert_eq!(queue.stats().time_offline, Some(750));

    cluster.set_online(true);
    cluster.tick("A");
    assert_eq!(queue.stats().time_offline, None);
}

#[test]
fn force_sync_drains_pending_operations() {
    let cluster = online_with_show();
    cluster.backend.fail_next(1);
    cluster.context("A").store().update("X", patch([("fee", 4)]));
    assert_eq!(cluster.context("A").queue().len(), 1);

    let report = cluster.context("A").force_sync().unwrap();
    assert_eq!(report.synced, 1);
    assert!(cluster.context("A").queue().is_empty());
    assert_eq!(cluster.context("A").bus().status(), SyncStatus::Synced);
}

#[test]
fn clear_drops_everything() {
    let cluster = online_with_show();
    cluster.set_online(false);
    cluster.context("A").store().update("X", patch([("fee", 1)]));
    cluster.context("A").store().remove("X");

    let queue = cluster.context("A").queue();
    assert_eq!(queue.len(), 2);
    queue.clear();
    assert!(queue.is_empty());

    cluster.set_online(true);
    cluster.tick("A");
    assert_eq!(cluster.backend.call_count(), 0);
}

fn call_log(cluster: &TestCluster) -> Vec<String> {
    cluster
        .backend
        .calls()
        .into_iter()
        .map(|call| match call {
            BackendCall::Save(entity) => format!("save:{}@v{}", entity.id, entity.version),
            BackendCall::Delete(id) => format!("delete:{id}"),
        })
        .collect()
}

#[test]
fn update_after_failed_attempt_waits_its_turn() {
    let cluster = online_with_show();
    let ctx = cluster.context("A");
    cluster.backend.fail_next(1);

    ctx.store().update("X", patch([("fee", 200)]));
    ctx.store().update("X", patch([("fee", 300)]));
    assert_eq!(call_log(&cluster), vec!["save:X@v2"]);

    ctx.queue().drain();
    assert_eq!(call_log(&cluster), vec!["save:X@v2", "save:X@v2", "save:X@v3"]);
    assert!(ctx.queue().is_empty());
}

#[test]
fn delete_after_failed_update_is_not_undone() {
    let cluster = online_with_show();
    let ctx = cluster.context("A");
    cluster.backend.fail_next(1);

    ctx.store().update("X", patch([("fee", 200)]));
    ctx.store().remove("X");

    ctx.queue().drain();
    assert_eq!(call_log(&cluster), vec!["save:X@v2", "save:X@v2", "delete:X"]);
}

#[test]
fn mutation_between_reconnect_and_tick_keeps_order() {
    let cluster = online_with_show();
    let ctx = cluster.context("A");

    cluster.set_online(false);
    ctx.store().update("X", patch([("fee", 200)]));
    cluster.set_online(true);
    ctx.store().update("X", patch([("fee", 300)]));
    assert_eq!(cluster.backend.call_count(), 0);

    cluster.tick("A");
    assert_eq!(call_log(&cluster), vec!["save:X@v2", "save:X@v3"]);
}
