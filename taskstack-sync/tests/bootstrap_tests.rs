mod support;

use chrono::DateTime;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::Ordering;
use support::{device, manager, test_config, MockTransport};
use taskstack_storage::BootstrapState;
use taskstack_sync::{BootstrapOutcome, Bootstrapper, ConnectionStatus, SyncConfig};
use taskstack_types::{DeviceId, EntityId, Event, EventId};

fn history(n: usize) -> Vec<Event> {
    let origin = DeviceId::new();
    (0..n)
        .map(|i| Event {
            id: EventId::new(),
            event_type: "task.created".into(),
            entity_id: EntityId::new(),
            payload: json!({ "title": format!("task {i}") }),
            origin_device_id: origin,
            timestamp: DateTime::from_timestamp_millis(1_000 + i as i64).unwrap(),
            sequence: i as u64 + 1,
            is_synced: false,
            synced_at: None,
        })
        .collect()
}

fn paged_config() -> SyncConfig {
    let mut config = test_config();
    config.pull_page_size = 2;
    config
}

#[tokio::test]
async fn fresh_bootstrap_pulls_everything_then_opens_gate() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(5));
    transport.report_total.store(true, Ordering::SeqCst);
    let sync = manager(&store, &transport, paged_config());
    let bootstrapper = Bootstrapper::new(sync.clone());
    let gate = bootstrapper.ready_gate();

    assert!(bootstrapper.is_needed().await.unwrap());
    assert!(!gate.is_ready());

    let outcome = bootstrapper.run().await.unwrap();
    assert_eq!(
        outcome,
        BootstrapOutcome::Completed {
            pages: 3,
            events_processed: 5
        }
    );
    assert!(gate.is_ready());
    assert_eq!(store.entities().count().unwrap(), 5);
    assert_eq!(store.sync_state().bootstrap_state().unwrap(), BootstrapState::Complete);
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(5));
    assert_eq!(sync.connection_status(), ConnectionStatus::Connected);

    let progress = *bootstrapper.progress().borrow();
    assert!(progress.complete);
    assert_eq!(progress.events_processed, 5);
    assert_eq!(progress.total, Some(5));
    assert_eq!(progress.ratio(), Some(1.0));
    assert!(!bootstrapper.is_needed().await.unwrap());
}

#[tokio::test]
async fn last_page_without_cursor_still_counts_toward_progress() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(3));
    transport.report_total.store(true, Ordering::SeqCst);
    transport.omit_final_cursor.store(true, Ordering::SeqCst);
    let bootstrapper = Bootstrapper::new(manager(&store, &transport, paged_config()));

    let outcome = bootstrapper.run().await.unwrap();

    assert_eq!(
        outcome,
        BootstrapOutcome::Completed {
            pages: 2,
            events_processed: 3
        }
    );
    assert_eq!(store.entities().count().unwrap(), 3);
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(2));
    let progress = *bootstrapper.progress().borrow();
    assert_eq!(progress.events_processed, 3);
    assert_eq!(progress.total, Some(3));
}

#[tokio::test]
async fn stopped_bootstrap_pulls_nothing_and_resumes_later() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(3));
    let stopped = Bootstrapper::new(manager(&store, &transport, paged_config()));
    stopped.stop();

    let outcome = stopped.run().await.unwrap();
    assert_eq!(
        outcome,
        BootstrapOutcome::Stopped {
            pages: 0,
            events_processed: 0
        }
    );
    assert!(!stopped.ready_gate().is_ready());
    assert!(transport.pull_cursors().is_empty());
    assert_eq!(store.sync_state().bootstrap_state().unwrap(), BootstrapState::InProgress);

    let resumed = Bootstrapper::new(manager(&store, &transport, paged_config()));
    assert_eq!(
        resumed.run().await.unwrap(),
        BootstrapOutcome::Completed {
            pages: 2,
            events_processed: 3
        }
    );
}

#[tokio::test]
async fn interrupted_bootstrap_resumes_from_last_page() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(6));

    let first = Bootstrapper::new(manager(&store, &transport, paged_config()));
    let gate = first.ready_gate();
    transport.fail_pulls_after(1);

    assert!(first.run().await.is_err());
    assert!(!gate.is_ready());
    assert_eq!(store.sync_state().bootstrap_state().unwrap(), BootstrapState::InProgress);
    assert_eq!(store.sync_state().checkpoint().unwrap(), Some(2));
    assert_eq!(store.sync_state().bootstrap_events_processed().unwrap(), 2);
    assert_eq!(store.entities().count().unwrap(), 2);

    // App restart: a new bootstrapper over the same store.
    transport.fail_pulls_after(usize::MAX);
    let second = Bootstrapper::new(manager(&store, &transport, paged_config()));
    assert!(second.is_needed().await.unwrap());

    let outcome = second.run().await.unwrap();
    assert_eq!(
        outcome,
        BootstrapOutcome::Completed {
            pages: 2,
            events_processed: 6
        }
    );
    assert!(second.ready_gate().is_ready());
    assert_eq!(store.entities().count().unwrap(), 6);
    assert_eq!(
        transport.pull_cursors(),
        vec![None, Some(2), Some(2), Some(4)]
    );
}

#[tokio::test]
async fn progress_without_total_is_indeterminate() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(4));
    transport.fail_pulls_after(1);

    let bootstrapper = Bootstrapper::new(manager(&store, &transport, paged_config()));
    let progress = bootstrapper.progress();
    let _ = bootstrapper.run().await;

    let snapshot = *progress.borrow();
    assert_eq!(snapshot.events_processed, 2);
    assert_eq!(snapshot.total, None);
    assert_eq!(snapshot.ratio(), None);
    assert!(!snapshot.complete);
}

#[tokio::test]
async fn empty_server_completes_immediately() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    let bootstrapper = Bootstrapper::new(manager(&store, &transport, paged_config()));

    let outcome = bootstrapper.run().await.unwrap();
    assert_eq!(
        outcome,
        BootstrapOutcome::Completed {
            pages: 1,
            events_processed: 0
        }
    );
    assert!(bootstrapper.ready_gate().is_ready());
    assert_eq!(store.sync_state().checkpoint().unwrap(), None);
}

#[tokio::test]
async fn completed_bootstrap_is_not_repeated() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(3));

    Bootstrapper::new(manager(&store, &transport, paged_config()))
        .run()
        .await
        .unwrap();
    let pulls = transport.pull_cursors().len();

    let again = Bootstrapper::new(manager(&store, &transport, paged_config()));
    assert!(!again.ready_gate().is_ready());
    assert_eq!(again.run().await.unwrap(), BootstrapOutcome::AlreadyComplete);
    assert!(again.ready_gate().is_ready());
    assert_eq!(transport.pull_cursors().len(), pulls);
}

#[tokio::test]
async fn wait_ready_returns_once_bootstrap_finishes() {
    let store = device("new-phone");
    let transport = MockTransport::new();
    transport.seed(history(3));
    let bootstrapper = Bootstrapper::new(manager(&store, &transport, paged_config()));
    let gate = bootstrapper.ready_gate();

    let waiter = tokio::spawn(async move { gate.wait_ready().await });
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    bootstrapper.run().await.unwrap();
    waiter.await.unwrap().unwrap();
}
