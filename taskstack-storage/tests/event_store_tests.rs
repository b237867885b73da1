use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use taskstack_storage::{EventStore, LocalStore};
use taskstack_types::{DeviceId, EntityId, Event, EventAction, EventId, NewEvent};

fn draft(entity: EntityId, title: &str) -> NewEvent {
    NewEvent::new(
        "task",
        EventAction::Updated,
        entity,
        serde_json::json!({ "title": title }),
    )
}

fn remote_event(origin: DeviceId, sequence: u64, ts_ms: i64) -> Event {
    Event {
        id: EventId::new(),
        event_type: "task.created".into(),
        entity_id: EntityId::new(),
        payload: serde_json::json!({ "title": "remote" }),
        origin_device_id: origin,
        timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap(),
        sequence,
        is_synced: false,
        synced_at: None,
    }
}

// ── Append ───────────────────────────────────────────────────────

#[test]
fn append_assigns_gapless_sequences() {
    let device = DeviceId::new();
    let store = EventStore::open_in_memory(device).unwrap();
    let entity = EntityId::new();

    let seqs: Vec<u64> = (0..5)
        .map(|i| store.append(draft(entity, &format!("t{i}"))).unwrap().sequence)
        .collect();

    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(store.last_local_sequence().unwrap(), 5);
}

#[test]
fn append_stores_unsynced_event_with_origin() {
    let device = DeviceId::new();
    let store = EventStore::open_in_memory(device).unwrap();
    let event = store.append(draft(EntityId::new(), "a")).unwrap();

    assert!(!event.is_synced);
    assert_eq!(event.origin_device_id, device);

    let loaded = store.get_event(&event.id).unwrap().unwrap();
    assert_eq!(loaded, event);
}

#[test]
fn sequences_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.duckdb");
    let device = DeviceId::new();

    {
        let store = EventStore::open(&path, device).unwrap();
        store.append(draft(EntityId::new(), "a")).unwrap();
        store.append(draft(EntityId::new(), "b")).unwrap();
    }

    let store = EventStore::open(&path, device).unwrap();
    let event = store.append(draft(EntityId::new(), "c")).unwrap();
    assert_eq!(event.sequence, 3);
}

// ── Sync marks ───────────────────────────────────────────────────

#[test]
fn pending_events_ascend_by_sequence_and_respect_limit() {
    let store = EventStore::open_in_memory(DeviceId::new()).unwrap();
    let entity = EntityId::new();
    for i in 0..4 {
        store.append(draft(entity, &i.to_string())).unwrap();
    }

    let pending = store.pending_events(3).unwrap();
    assert_eq!(
        pending.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(store.pending_count().unwrap(), 4);
}

#[test]
fn mark_synced_is_idempotent() {
    let store = EventStore::open_in_memory(DeviceId::new()).unwrap();
    let a = store.append(draft(EntityId::new(), "a")).unwrap();
    let b = store.append(draft(EntityId::new(), "b")).unwrap();

    let first_at = Utc::now();
    assert_eq!(store.mark_synced(&[a.id], first_at).unwrap(), 1);
    assert_eq!(store.mark_synced(&[a.id, b.id], Utc::now()).unwrap(), 1);
    assert_eq!(store.mark_synced(&[a.id, b.id], Utc::now()).unwrap(), 0);

    let a = store.get_event(&a.id).unwrap().unwrap();
    assert!(a.is_synced);
    assert_eq!(
        a.synced_at.unwrap().timestamp_millis(),
        first_at.timestamp_millis()
    );
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn mark_synced_ignores_unknown_ids() {
    let store = EventStore::open_in_memory(DeviceId::new()).unwrap();
    assert_eq!(store.mark_synced(&[EventId::new()], Utc::now()).unwrap(), 0);
    assert_eq!(store.mark_synced(&[], Utc::now()).unwrap(), 0);
}

#[test]
fn remote_events_are_synced_and_not_pending() {
    let store = EventStore::open_in_memory(DeviceId::new()).unwrap();
    let remote = remote_event(DeviceId::new(), 7, 1_000);

    assert!(store.insert_remote(&remote, Utc::now()).unwrap());
    assert!(!store.insert_remote(&remote, Utc::now()).unwrap());

    let loaded = store.get_event(&remote.id).unwrap().unwrap();
    assert!(loaded.is_synced);
    assert!(store.pending_events(10).unwrap().is_empty());
    assert_eq!(store.count().unwrap(), 1);
}

// ── Queries ──────────────────────────────────────────────────────

#[test]
fn events_since_pages_in_version_order() {
    let store = EventStore::open_in_memory(DeviceId::new()).unwrap();
    let origin = DeviceId::new();
    let e3 = remote_event(origin, 3, 3_000);
    let e1 = remote_event(origin, 1, 1_000);
    let e2 = remote_event(origin, 2, 1_000);
    for e in [&e3, &e1, &e2] {
        store.insert_remote(e, Utc::now()).unwrap();
    }

    let first = store.events_since(None, 2).unwrap();
    assert_eq!(first.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e1.id, e2.id]);

    let cursor = first.last().unwrap().version();
    let rest = store.events_since(Some(&cursor), 10).unwrap();
    assert_eq!(rest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e3.id]);
}

#[test]
fn unapplied_events_excludes_applied_ones() {
    let local = LocalStore::open_in_memory().unwrap();
    let events = local.events();
    let a = events.append(draft(EntityId::new(), "a")).unwrap();
    let b = events.append(draft(EntityId::new(), "b")).unwrap();

    local.entities().mark_applied(&a).unwrap();

    let unapplied = events.unapplied_events(10).unwrap();
    assert_eq!(unapplied.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id]);
}

#[test]
fn events_for_entity_filters_by_entity() {
    let store = EventStore::open_in_memory(DeviceId::new()).unwrap();
    let target = EntityId::new();
    store.append(draft(target, "a")).unwrap();
    store.append(draft(EntityId::new(), "other")).unwrap();
    store.append(draft(target, "b")).unwrap();

    let events = store.events_for_entity(&target).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.entity_id == target));
    assert!(store.contains(&events[0].id).unwrap());
}
