//! Queue Listener Tests
//!
//! Tests the request queue listener including:
//! - Requests applied through the reconciler
//! - Cleared and invalid entries skipped
//! - Failures logged without stopping the listener

use std::sync::Arc;
use std::time::Duration;

use blueservo_core::config::SyncConfig;
use blueservo_core::{ActuatorState, DeviceIdentity, EventBus, ServoEvent, StateStore};
use blueservo_devices::{MockTransport, SessionConfig, SessionManager};
use blueservo_storage::MemoryStateStore;
use blueservo_sync::{QueueListener, StateReconciler};

fn reconciler_for(transport: &MockTransport, store: Arc<MemoryStateStore>) -> StateReconciler {
    StateReconciler::new(
        store,
        SessionManager::new(
            Arc::new(transport.clone()),
            SessionConfig::new(DeviceIdentity::new("servo-1")),
        ),
        SyncConfig::default(),
        Duration::from_secs(5),
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(start_paused = true)]
async fn test_request_is_applied() {
    let transport = MockTransport::new("servo-1");
    let store = Arc::new(MemoryStateStore::new());
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let reconciler = Arc::new(reconciler_for(&transport, store.clone()).with_event_bus(bus));

    let handle = QueueListener::new(reconciler).spawn();
    store.submit_request(ActuatorState::On).await.unwrap();
    settle().await;

    assert_eq!(transport.servo_state(), ActuatorState::On);
    assert_eq!(store.last_known_state().await.unwrap(), Some(ActuatorState::On));
    assert!(!store.has_pending_request());

    let stats = handle.stop().await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.applied, 1);

    assert!(matches!(
        events.recv().await,
        Some(ServoEvent::RequestReceived {
            desired: ActuatorState::On,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_pending_request_applied_on_start() {
    let transport = MockTransport::new("servo-1");
    let store = Arc::new(MemoryStateStore::new());
    store.submit_request(ActuatorState::On).await.unwrap();
    store.submit_request(ActuatorState::Off).await.unwrap();
    store.record_state(ActuatorState::On).await.unwrap();

    let handle = QueueListener::new(Arc::new(reconciler_for(&transport, store.clone()))).spawn();
    settle().await;
    let stats = handle.stop().await;

    // Only the latest request is delivered
    assert_eq!(stats.delivered, 1);
    assert_eq!(transport.written_frames(), vec![b"!S0".to_vec()]);
    assert_eq!(store.last_known_state().await.unwrap(), Some(ActuatorState::Off));
}

#[tokio::test(start_paused = true)]
async fn test_cleared_and_invalid_entries_are_skipped() {
    let transport = MockTransport::new("servo-1");
    let store = Arc::new(MemoryStateStore::new());
    let handle = QueueListener::new(Arc::new(reconciler_for(&transport, store.clone()))).spawn();

    store.submit_raw_request("");
    settle().await;
    store.submit_raw_request("upside-down");
    settle().await;

    let stats = handle.stop().await;
    assert_eq!(stats.ignored, 1);
    assert_eq!(stats.invalid, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(transport.scan_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_does_not_stop_listener() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.advertise = false);
    let store = Arc::new(MemoryStateStore::new());
    let handle = QueueListener::new(Arc::new(reconciler_for(&transport, store.clone()))).spawn();

    store.submit_request(ActuatorState::On).await.unwrap();
    // Longer than the scan timeout
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(handle.stats().failed, 1);
    assert!(!handle.is_finished());

    transport.configure(|b| b.advertise = true);
    store.submit_request(ActuatorState::On).await.unwrap();
    settle().await;

    let stats = handle.stop().await;
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(store.last_known_state().await.unwrap(), Some(ActuatorState::On));
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_requests() {
    let transport = MockTransport::new("servo-1");
    let store = Arc::new(MemoryStateStore::new());
    let handle = QueueListener::new(Arc::new(reconciler_for(&transport, store))).spawn();

    settle().await;
    let stats = handle.stop().await;

    assert_eq!(stats, Default::default());
}
