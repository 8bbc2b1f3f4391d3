//! End-to-end tests for the sync pipeline
//!
//! These tests drive a full `SyncService` over the in-process transport and
//! data source, using the captured stream in `tests/fixtures/`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hangout_core::replay::{load_changes, load_snapshot};
use hangout_core::{
    ChangeEvent, Config, ConnectionSignal, DataSource, Domain, LocalTransport, MemoryDataSource,
    Operation, Record, Section, Session, SubscriptionStatus, SyncService,
};
use serde_json::json;

/// Get the path to a fixture file
fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

struct Harness {
    service: SyncService,
    transport: LocalTransport,
    source: Arc<MemoryDataSource>,
}

fn harness(domains: &[Domain]) -> Harness {
    hangout_core::logging::init_test();

    let mut config = Config::default();
    config.realtime.domains = domains.to_vec();
    config.realtime.backstop_secs = 0;

    let transport = LocalTransport::default();
    let source = Arc::new(MemoryDataSource::new());
    let service = SyncService::new(
        &config,
        Arc::new(transport.clone()),
        Arc::clone(&source) as Arc<dyn DataSource>,
    )
    .unwrap();

    Harness {
        service,
        transport,
        source,
    }
}

fn row(value: serde_json::Value) -> Record {
    Record::from_row(value).unwrap()
}

fn unread_total(service: &SyncService) -> usize {
    Domain::ALL
        .iter()
        .map(|domain| {
            service
                .collection(*domain)
                .records()
                .filter(|record| record.is_unread())
                .count()
        })
        .sum()
}

// ============================================
// Replay of the captured stream
// ============================================

#[tokio::test(start_paused = true)]
async fn test_replay_fixture_stream() {
    let h = harness(&Domain::ALL);
    for (domain, records) in load_snapshot(&fixture_path("snapshot.json")).unwrap() {
        h.source.set(domain, records);
    }
    let log = load_changes(&fixture_path("events.jsonl")).unwrap();
    assert!(log.warnings.is_empty());
    assert_eq!(log.events.len(), 6);

    h.service.on_session_acquired(Session::new("token"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let counts = h.service.unread_counts();
    assert_eq!(counts.get(Section::Active), 1);
    assert_eq!(counts.get(Section::Completed), 1);
    assert_eq!(counts.get(Section::Invitations), 1);

    for event in log.events {
        h.transport.publish(event);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let counts = h.service.unread_counts();
    assert_eq!(counts.get(Section::Active), 0);
    assert_eq!(counts.get(Section::Completed), 1);
    assert_eq!(counts.get(Section::Invitations), 1);
    assert_eq!(counts.get(Section::Notifications), 1);
    assert_eq!(counts.get(Section::Friends), 0);
    assert_eq!(counts.total(), 3);
    assert_eq!(counts.total(), unread_total(&h.service));

    // The out-of-order title update was rejected.
    let plans = h.service.collection(Domain::Plans);
    assert_eq!(
        plans.get("p1").unwrap().str_field("title"),
        Some("Picnic at the lake")
    );
    assert!(h.service.collection(Domain::Friends).is_empty());
}

// ============================================
// Session lifecycle
// ============================================

#[tokio::test(start_paused = true)]
async fn test_unauthenticated_start() {
    let h = harness(&[Domain::Plans, Domain::Friends]);

    h.service.start();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        h.service.subscription_status(Domain::Plans),
        SubscriptionStatus::Inactive
    );
    assert_eq!(
        h.service.subscription_status(Domain::Friends),
        SubscriptionStatus::Inactive
    );
    assert_eq!(h.transport.open_channels(), 0);
    assert_eq!(h.service.connection_signal(), ConnectionSignal::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_no_events_after_stop() {
    let h = harness(&[Domain::Plans]);
    h.service.on_session_acquired(Session::new("token"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut plans = h.service.subscribe_to_collection(Domain::Plans);
    plans.borrow_and_update();

    h.transport.publish(
        ChangeEvent::new(Domain::Plans, "p1", Operation::Insert)
            .with_payload(json!({"unread": true})),
    );
    h.service.stop();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(!plans.has_changed().unwrap());
    assert!(h.service.collection(Domain::Plans).is_empty());
    assert_eq!(h.transport.open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_clears_and_sign_in_reloads() {
    let h = harness(&[Domain::Invitations]);
    h.source.set(
        Domain::Invitations,
        vec![row(json!({"id": "i1", "unread": true}))],
    );

    h.service.on_session_acquired(Session::new("first"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.service.unread_counts().total(), 1);

    h.service.on_session_lost();
    assert_eq!(h.service.unread_counts().total(), 0);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transport.open_channels(), 0);

    h.service.on_session_acquired(Session::new("second"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.service.unread_counts().total(), 1);
    assert_eq!(h.source.fetch_count(Domain::Invitations), 2);
}

// ============================================
// Reconnect
// ============================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_converges_to_server_state() {
    let h = harness(&[Domain::Plans]);
    h.source.set(
        Domain::Plans,
        vec![row(json!({"id": "p1", "unread": true}))],
    );
    h.service.on_session_acquired(Session::new("token"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.service.connection_signal(), ConnectionSignal::Live);

    // Events committed while the channel is down are never delivered.
    h.transport.fail_next_connects(Domain::Plans, 2);
    h.transport.disconnect(Domain::Plans, "network down");
    let server_rows = vec![
        row(json!({"id": "p1", "unread": false, "title": "renamed"})),
        row(json!({"id": "p2", "unread": true})),
    ];
    h.source.set(Domain::Plans, server_rows.clone());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.service.connection_signal(), ConnectionSignal::Reconnecting);

    // Retries at +1s, +3s and +7s, then the debounced reload.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(
        h.service.subscription_status(Domain::Plans),
        SubscriptionStatus::Active
    );
    assert_eq!(h.transport.connect_attempts(Domain::Plans).len(), 4);

    let expected: BTreeMap<String, Record> = server_rows
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect();
    let held: BTreeMap<String, Record> = h
        .service
        .collection(Domain::Plans)
        .records()
        .map(|record| (record.id.clone(), record.clone()))
        .collect();
    assert_eq!(held, expected);
    assert_eq!(h.service.unread_counts().get(Section::Active), 1);
}

// ============================================
// Presentation surface
// ============================================

#[tokio::test(start_paused = true)]
async fn test_mark_read_notifies_observers() {
    let h = harness(&[Domain::Notifications]);
    h.source.set(
        Domain::Notifications,
        vec![
            row(json!({"id": "n1", "unread": true})),
            row(json!({"id": "n2", "unread": true})),
        ],
    );
    h.service.on_session_acquired(Session::new("token"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _handle = h
        .service
        .on_collection_change(Domain::Notifications, move |collection| {
            let unread = collection.records().filter(|r| r.is_unread()).count();
            sink.lock().unwrap().push(unread);
        });
    let mut counts = h.service.watch_unread_counts();
    counts.borrow_and_update();
    tokio::task::yield_now().await;

    assert!(h.service.mark_read(Domain::Notifications, "n1"));
    assert!(!h.service.mark_read(Domain::Notifications, "n1"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(counts.has_changed().unwrap());
    assert_eq!(counts.borrow_and_update().get(Section::Notifications), 1);
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_burst_fetches_once() {
    let h = harness(&[Domain::Friends]);
    h.service.on_session_acquired(Session::new("token"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.source.fetch_count(Domain::Friends), 1);

    for _ in 0..5 {
        h.service.request_refresh(Domain::Friends);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.source.fetch_count(Domain::Friends), 2);
}
