mod support;

use chrono::DateTime;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{device, manager, test_config, MockTransport, RecordingReporter};
use taskstack_sync::{
    ApplyError, ConnectionStatus, EntityLocks, EventLedger, SyncError, SyncEvent, SyncHandle,
    SyncPhase,
};
use taskstack_types::{DeviceId, EntityId, Event, EventAction, EventId};

fn remote_created(title: &str) -> Event {
    Event {
        id: EventId::new(),
        event_type: "task.created".into(),
        entity_id: EntityId::new(),
        payload: json!({ "title": title }),
        origin_device_id: DeviceId::new(),
        timestamp: DateTime::from_timestamp_millis(1_000).unwrap(),
        sequence: 1,
        is_synced: false,
        synced_at: None,
    }
}

async fn record_tasks(ledger: &EventLedger, n: usize) -> Vec<Event> {
    let mut events = Vec::new();
    for i in 0..n {
        events.push(
            ledger
                .record("task", EntityId::new(), EventAction::Created, json!({ "title": format!("t{i}") }))
                .await
                .unwrap(),
        );
    }
    events
}

// ── Push ─────────────────────────────────────────────────────────

#[tokio::test]
async fn push_sends_pending_in_batches_and_marks_synced() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let mut config = test_config();
    config.push_batch_size = 2;
    let sync = manager(&store, &transport, config);
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());

    record_tasks(&ledger, 5).await;
    let report = sync.manual_push().await.unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.acknowledged, 5);
    assert_eq!(store.events().pending_count().unwrap(), 0);

    let sequences: Vec<Vec<u64>> = transport
        .pushes
        .lock()
        .unwrap()
        .iter()
        .map(|b| b.iter().map(|e| e.sequence).collect())
        .collect();
    assert_eq!(sequences, vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn push_marks_only_acknowledged_prefix() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());

    let events = record_tasks(&ledger, 4).await;
    transport.set_ack_limit(Some(2));

    let report = sync.manual_push().await.unwrap();
    assert_eq!(report.sent, 4);
    assert_eq!(report.acknowledged, 2);

    let pending: Vec<EventId> = store
        .events()
        .pending_events(10)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(pending, vec![events[2].id, events[3].id]);
}

#[tokio::test]
async fn push_failure_marks_nothing() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());

    record_tasks(&ledger, 3).await;
    transport.set_fail_pushes(true);

    let err = sync.manual_push().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert!(err.is_recoverable());
    assert_eq!(store.events().pending_count().unwrap(), 3);
    assert_eq!(sync.phase(), SyncPhase::Idle);

    // The next trigger is the retry.
    transport.set_fail_pushes(false);
    sync.manual_push().await.unwrap();
    assert_eq!(store.events().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn resend_after_lost_ack_is_harmless() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    record_tasks(&ledger, 2).await;

    // Server stored the batch but the client never heard back.
    transport.set_ack_limit(Some(0));
    sync.manual_push().await.unwrap();
    transport.set_ack_limit(None);
    sync.manual_push().await.unwrap();

    assert_eq!(transport.server_events().len(), 2);
    assert_eq!(store.events().pending_count().unwrap(), 0);
}

// ── Pull ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pull_applies_pages_and_advances_checkpoint() {
    let store = device("phone");
    let transport = MockTransport::new();
    let mut config = test_config();
    config.pull_page_size = 2;
    let sync = manager(&store, &transport, config);

    transport.seed((0..5).map(|i| remote_created(&format!("r{i}"))).collect());
    let report = sync.manual_pull().await.unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(report.applied, 5);
    assert_eq!(store.entities().count().unwrap(), 5);
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(5));
    assert_eq!(transport.pull_cursors(), vec![None, Some(2), Some(4)]);
}

#[tokio::test]
async fn failed_page_never_advances_checkpoint() {
    let store = device("phone");
    let transport = MockTransport::new();
    let mut config = test_config();
    config.pull_page_size = 2;
    let sync = manager(&store, &transport, config);

    transport.seed((0..4).map(|i| remote_created(&format!("r{i}"))).collect());
    transport.fail_pulls_after(1);

    assert!(sync.manual_pull().await.is_err());
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(2));
    assert_eq!(store.entities().count().unwrap(), 2);

    transport.fail_pulls_after(usize::MAX);
    sync.manual_pull().await.unwrap();
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(4));
    assert_eq!(transport.pull_cursors(), vec![None, Some(2), Some(2)]);
}

#[tokio::test]
async fn redelivered_events_are_idempotent() {
    let store = device("phone");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let (a, b) = (remote_created("a"), remote_created("b"));
    transport.seed(vec![a.clone(), b.clone()]);

    sync.manual_pull().await.unwrap();
    let before = store.entities().list(None, true).unwrap();

    // The server streams the same events again.
    transport.seed(vec![a, b]);
    let report = sync.manual_pull().await.unwrap();

    assert_eq!(report.applied, 0);
    assert_eq!(report.duplicates, 2);
    assert_eq!(store.entities().list(None, true).unwrap(), before);
    assert_eq!(store.events().count().unwrap(), 2);
}

#[tokio::test]
async fn conflict_event_is_skipped_and_rest_of_page_applies() {
    let store = device("phone");
    let transport = MockTransport::new();
    let reporter = Arc::new(RecordingReporter::default());
    let sync = manager(&store, &transport, test_config()).with_reporter(reporter.clone());

    let mut bad = remote_created("bad");
    bad.payload = json!("not an object");
    transport.seed(vec![remote_created("a"), bad.clone(), remote_created("c")]);

    let report = sync.manual_pull().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(3));
    assert_eq!(reporter.kinds(), vec!["conflict_apply".to_string()]);

    let reports = reporter.reports.lock().unwrap();
    assert_eq!(reports[0].action, "apply");
    assert_eq!(reports[0].entity_id, Some(bad.entity_id));
}

#[tokio::test]
async fn pull_registers_remote_devices() {
    let store = device("phone");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let event = remote_created("a");
    transport.seed(vec![event.clone()]);

    sync.manual_pull().await.unwrap();
    assert!(store.devices().get(&event.origin_device_id).unwrap().is_some());
}

// ── Manual sync ──────────────────────────────────────────────────

#[tokio::test]
async fn manual_sync_pushes_before_pulling() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    let mut events = sync.subscribe();

    record_tasks(&ledger, 1).await;
    transport.seed(vec![remote_created("remote")]);

    let report = sync.manual_sync().await.unwrap();
    assert_eq!(report.push.acknowledged, 1);
    assert_eq!(report.pull.received, 2, "own event is echoed back");
    assert_eq!(report.pull.duplicates, 1);
    assert_eq!(store.entities().count().unwrap(), 2);

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::PhaseChanged(phase) = event {
            phases.push(phase);
        }
    }
    assert_eq!(
        phases,
        vec![SyncPhase::Pushing, SyncPhase::Pulling, SyncPhase::Idle]
    );
}

#[tokio::test]
async fn two_devices_converge_through_server() {
    let transport = MockTransport::new();
    let laptop = device("laptop");
    let phone = device("phone");
    let laptop_sync = manager(&laptop, &transport, test_config());
    let phone_sync = manager(&phone, &transport, test_config());
    let laptop_ledger = EventLedger::new(laptop.clone(), laptop_sync.locks().clone());
    let phone_ledger = EventLedger::new(phone.clone(), phone_sync.locks().clone());

    let task = EntityId::new();
    laptop_ledger
        .record("task", task, EventAction::Created, json!({"title": "draft", "notes": ""}))
        .await
        .unwrap();
    laptop_sync.manual_sync().await.unwrap();
    phone_sync.manual_sync().await.unwrap();

    phone_ledger
        .record("task", task, EventAction::Updated, json!({"notes": "from phone"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    laptop_ledger
        .record("task", task, EventAction::Updated, json!({"title": "final"}))
        .await
        .unwrap();

    laptop_sync.manual_sync().await.unwrap();
    phone_sync.manual_sync().await.unwrap();
    laptop_sync.manual_sync().await.unwrap();

    let on_laptop = laptop.entities().get(&task).unwrap().unwrap();
    let on_phone = phone.entities().get(&task).unwrap().unwrap();
    assert_eq!(on_laptop, on_phone);
    assert_eq!(on_laptop.get_str("title"), Some("final"));
    assert_eq!(on_laptop.get_str("notes"), Some("from phone"));
}

// ── Connection status ────────────────────────────────────────────

#[tokio::test]
async fn connection_degrades_after_repeated_failures_and_recovers() {
    let store = device("phone");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    assert_eq!(sync.connection_status(), ConnectionStatus::Disconnected);

    sync.manual_pull().await.unwrap();
    assert_eq!(sync.connection_status(), ConnectionStatus::Connected);

    transport.set_fail_pulls(true);
    for _ in 0..2 {
        assert!(sync.manual_pull().await.is_err());
        assert_eq!(sync.connection_status(), ConnectionStatus::Connected);
    }
    assert!(sync.manual_pull().await.is_err());
    assert_eq!(sync.connection_status(), ConnectionStatus::Disconnected);

    transport.set_fail_pulls(false);
    sync.manual_pull().await.unwrap();
    assert_eq!(sync.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn failures_are_reported_with_action() {
    let store = device("phone");
    let transport = MockTransport::new();
    let reporter = Arc::new(RecordingReporter::default());
    let sync = manager(&store, &transport, test_config()).with_reporter(reporter.clone());
    transport.set_fail_pulls(true);

    let _ = sync.manual_pull().await;
    let reports = reporter.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].action, "pull");
    assert_eq!(reports[0].kind, "transport");
}

// ── Immediate push ───────────────────────────────────────────────

#[tokio::test]
async fn ledger_with_sync_pushes_immediately() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = sync.ledger();

    ledger
        .record("reminder", EntityId::new(), EventAction::Created, json!({"snoozed_until": 10}))
        .await
        .unwrap();

    sync.trigger_immediate_push().await.unwrap();
    assert_eq!(store.events().pending_count().unwrap(), 0);
    assert_eq!(transport.server_events().len(), 1);
}

#[tokio::test]
async fn concurrent_immediate_pushes_never_resend_a_batch() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    record_tasks(&ledger, 3).await;

    let handles: Vec<_> = (0..4).map(|_| sync.trigger_immediate_push()).collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let sent: usize = transport.pushes.lock().unwrap().iter().map(|b| b.len()).sum();
    assert_eq!(sent, 3);
}

// ── Ledger ───────────────────────────────────────────────────────

#[tokio::test]
async fn record_appends_and_applies() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    let task = EntityId::new();
    let mut changes = store.entities().subscribe();

    let event = ledger
        .record("task", task, EventAction::Created, json!({"title": "x"}))
        .await
        .unwrap();

    assert_eq!(event.origin_device_id, store.identity().id);
    assert_eq!(event.sequence, 1);
    assert_eq!(store.entities().get(&task).unwrap().unwrap().get_str("title"), Some("x"));
    assert_eq!(changes.recv().await.unwrap().entity_id, task);
}

#[tokio::test]
async fn record_rejects_malformed_payload_before_append() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());

    let err = ledger
        .record("task", EntityId::new(), EventAction::Updated, json!(42))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConflictApply { .. }));
    assert_eq!(store.events().count().unwrap(), 0);
}

#[tokio::test]
async fn record_for_entity_of_other_type_is_never_appended() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    let task = EntityId::new();
    ledger
        .record("task", task, EventAction::Created, json!({"title": "x"}))
        .await
        .unwrap();

    let err = ledger
        .record("tag", task, EventAction::Updated, json!({"name": "urgent"}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::ConflictApply {
            source: ApplyError::EntityTypeMismatch { .. },
            ..
        }
    ));
    assert_eq!(store.events().pending_count().unwrap(), 1);
    let types: Vec<String> = store
        .events()
        .pending_events(10)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["task.created".to_string()]);
    assert_eq!(store.entities().get(&task).unwrap().unwrap().get_str("name"), None);
}

#[tokio::test]
async fn reapply_pending_folds_unapplied_events() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    let task = EntityId::new();

    // An append whose apply never committed.
    store
        .events()
        .append(taskstack_types::NewEvent::new(
            "task",
            EventAction::Created,
            task,
            json!({"title": "orphan"}),
        ))
        .unwrap();
    assert!(store.entities().get(&task).unwrap().is_none());

    assert_eq!(ledger.reapply_pending().await.unwrap(), 1);
    assert_eq!(ledger.reapply_pending().await.unwrap(), 0);
    assert_eq!(
        store.entities().get(&task).unwrap().unwrap().get_str("title"),
        Some("orphan")
    );
}

// ── Entity locks ─────────────────────────────────────────────────

#[tokio::test]
async fn held_entity_lock_blocks_only_that_entity() {
    let store = device("laptop");
    let locks = Arc::new(EntityLocks::new());
    let ledger = EventLedger::new(store.clone(), locks.clone());
    let (held_entity, free_entity) = (EntityId::new(), EntityId::new());

    let held = locks.lock(held_entity).await;
    tokio::time::timeout(
        Duration::from_secs(1),
        ledger.record("task", free_entity, EventAction::Created, json!({"title": "free"})),
    )
    .await
    .expect("a different entity must not wait")
    .unwrap();

    let blocked = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .record("task", held_entity, EventAction::Created, json!({"title": "held"}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());
    assert!(store.entities().get(&held_entity).unwrap().is_none());
    assert_eq!(store.events().count().unwrap(), 1);

    drop(held);
    tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        store.entities().get(&held_entity).unwrap().unwrap().get_str("title"),
        Some("held")
    );
    assert_eq!(locks.tracked(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_records_on_one_entity_all_land() {
    let store = device("laptop");
    let ledger = EventLedger::new(store.clone(), Arc::new(EntityLocks::new()));
    let task = EntityId::new();
    ledger
        .record("task", task, EventAction::Created, json!({"title": "shared"}))
        .await
        .unwrap();

    let writers: Vec<_> = (0..8i64)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let mut fields = serde_json::Map::new();
                fields.insert(format!("field{i}"), json!(i));
                ledger
                    .record("task", task, EventAction::Updated, serde_json::Value::Object(fields))
                    .await
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let projection = store.entities().get(&task).unwrap().unwrap();
    assert_eq!(projection.get_str("title"), Some("shared"));
    for i in 0..8i64 {
        assert_eq!(projection.get_i64(&format!("field{i}")), Some(i));
    }
    assert!(store.events().unapplied_events(100).unwrap().is_empty());
    let sequences: Vec<u64> = store
        .events()
        .pending_events(100)
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, (1..=9).collect::<Vec<u64>>());
}

// ── Periodic loop ────────────────────────────────────────────────

#[tokio::test]
async fn run_loop_handles_commands_and_shuts_down() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let sync = manager(&store, &transport, test_config());
    let ledger = EventLedger::new(store.clone(), sync.locks().clone());
    record_tasks(&ledger, 1).await;

    let (handle, command_rx) = SyncHandle::channel();
    let runner = sync.clone();
    let task = tokio::spawn(async move { runner.run(command_rx).await });

    handle.sync_now().await.unwrap();
    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.events().pending_count().unwrap(), 0);
    assert!(matches!(handle.push_now().await, Err(SyncError::ChannelClosed)));
}

#[tokio::test(start_paused = true)]
async fn run_loop_syncs_on_interval() {
    let store = device("laptop");
    let transport = MockTransport::new();
    let mut config = test_config();
    config.sync_interval_secs = 30;
    let sync = manager(&store, &transport, config);
    transport.seed(vec![remote_created("remote")]);

    let (handle, command_rx) = SyncHandle::channel();
    let runner = sync.clone();
    let task = tokio::spawn(async move { runner.run(command_rx).await });

    tokio::time::sleep(Duration::from_secs(31)).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert!(!transport.pull_cursors().is_empty());
}
