//! Session Manager Tests
//!
//! Tests session establishment against the simulated peripheral including:
//! - Single-flight acquisition under concurrency
//! - Phase failures (radio, scan, connect, discovery) and their cleanup
//! - Teardown on close and on remote disconnect
//! - Shutdown while an attempt is still connecting

use std::sync::Arc;
use std::time::Duration;

use blueservo_core::{DeviceIdentity, Error, EventBus, ServoEvent};
use blueservo_devices::{
    Advertisement, MockBehavior, MockTransport, RadioState, SessionConfig, SessionManager,
};

fn manager_for(transport: &MockTransport) -> SessionManager {
    SessionManager::new(
        Arc::new(transport.clone()),
        SessionConfig::new(DeviceIdentity::new("servo-1")),
    )
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_shares_one_attempt() {
    let transport = MockTransport::new("servo-1");
    let manager = manager_for(&transport);

    let (a, b) = tokio::join!(manager.acquire_session(), manager.acquire_session());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(transport.scan_count(), 1);
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_live_session_is_reused() {
    let transport = MockTransport::new("servo-1");
    let manager = manager_for(&transport);

    let first = manager.acquire_session().await.unwrap();
    let second = manager.acquire_session().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(transport.scan_count(), 1);
    assert!(manager.current().is_some());
    assert!(!manager.is_connecting());
}

#[tokio::test(start_paused = true)]
async fn test_scan_timeout_stops_scanning() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        advertise: false,
        ..Default::default()
    });
    let manager = manager_for(&transport);

    let err = manager.acquire_session().await.unwrap_err();

    assert_eq!(err, Error::ScanTimeout(10_000));
    assert!(!transport.is_scanning());
    assert_eq!(transport.connect_count(), 0);
    assert!(manager.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_other_devices_are_ignored() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        other_advertisements: vec![Advertisement::new("lamp"), Advertisement::new("sensor")],
        ..Default::default()
    });
    let manager = manager_for(&transport);

    let session = manager.acquire_session().await.unwrap();

    assert_eq!(session.peripheral(), "servo-1");
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_identity_matches_address() {
    let transport = MockTransport::from_advertisement(
        Advertisement::new("hci0/dev_1").with_address("C4:7F:51:00:00:01"),
    );
    let manager = SessionManager::new(
        Arc::new(transport.clone()),
        SessionConfig::new(DeviceIdentity::new("c4:7f:51:00:00:01")),
    );

    let session = manager.acquire_session().await.unwrap();
    assert_eq!(session.peripheral(), "hci0/dev_1");
}

#[tokio::test(start_paused = true)]
async fn test_powered_off_radio() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        radio: RadioState::PoweredOff,
        ..Default::default()
    });
    let manager = manager_for(&transport);

    assert_eq!(manager.acquire_session().await.unwrap_err(), Error::PoweredOff);
    assert_eq!(transport.scan_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_radio_never_ready_is_powered_off() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        radio: RadioState::Unknown,
        ..Default::default()
    });
    let manager = manager_for(&transport);

    assert_eq!(manager.acquire_session().await.unwrap_err(), Error::PoweredOff);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_cleans_up() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        connect_delay: Duration::from_secs(30),
        ..Default::default()
    });
    let manager = manager_for(&transport);

    let err = manager.acquire_session().await.unwrap_err();

    assert_eq!(err, Error::ConnectTimeout(5_000));
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_error_cleans_up() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        connect_error: Some("link refused".into()),
        ..Default::default()
    });
    let manager = manager_for(&transport);

    let err = manager.acquire_session().await.unwrap_err();

    assert!(matches!(err, Error::ConnectError(ref msg) if msg.contains("link refused")));
    assert_eq!(transport.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_services_disconnects() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        services: 0,
        ..Default::default()
    });
    let manager = manager_for(&transport);

    assert_eq!(manager.acquire_session().await.unwrap_err(), Error::NoServices);
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_disconnects() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        services: 2,
        expose_notify: false,
        ..Default::default()
    });
    let manager = manager_for(&transport);

    assert_eq!(
        manager.acquire_session().await.unwrap_err(),
        Error::NoCharacteristics(2_000)
    );
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempt_is_not_cached() {
    let transport = MockTransport::new("servo-1").with_behavior(MockBehavior {
        connect_error: Some("busy".into()),
        ..Default::default()
    });
    let manager = manager_for(&transport);

    assert!(manager.acquire_session().await.is_err());

    transport.configure(|b| b.connect_error = None);
    let session = manager.acquire_session().await.unwrap();

    assert!(session.is_alive());
    assert_eq!(transport.scan_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_remote_disconnect_invalidates_session() {
    let transport = MockTransport::new("servo-1");
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let manager = SessionManager::with_event_bus(
        Arc::new(transport.clone()),
        SessionConfig::new(DeviceIdentity::new("servo-1")),
        bus,
    );

    let session = manager.acquire_session().await.unwrap();
    assert!(matches!(
        events.recv().await,
        Some(ServoEvent::SessionEstablished { .. })
    ));

    transport.trigger_disconnect();
    session.closed().await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(!session.is_alive());
    assert_eq!(session.close_reason().as_deref(), Some("remote disconnect"));
    assert!(manager.current().is_none());
    assert!(matches!(
        events.recv().await,
        Some(ServoEvent::SessionClosed { .. })
    ));

    // The next acquisition starts from scratch
    let next = manager.acquire_session().await.unwrap();
    assert_ne!(next.id(), session.id());
    assert_eq!(transport.scan_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_disconnects_once() {
    let transport = MockTransport::new("servo-1");
    let manager = manager_for(&transport);

    let session = manager.acquire_session().await.unwrap();
    manager.invalidate(&session, "test").await;
    manager.invalidate(&session, "again").await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(transport.disconnect_count(), 1);
    assert_eq!(session.close_reason().as_deref(), Some("test"));
    assert!(manager.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_session() {
    let transport = MockTransport::new("servo-1");
    let manager = manager_for(&transport);

    manager.shutdown().await;
    assert_eq!(transport.disconnect_count(), 0);

    manager.acquire_session().await.unwrap();
    manager.shutdown().await;
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_resolving_characteristics() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.discovery_delay = Duration::from_secs(1));
    let manager = manager_for(&transport);

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire_session().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.is_connecting());
    assert!(transport.is_connected());

    manager.shutdown().await;
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!transport.is_connected());

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, Error::Disconnected);
    assert_eq!(transport.disconnect_count(), 1);
    assert!(!manager.is_connecting());

    // Nothing is left over from the interrupted attempt
    transport.configure(|b| b.discovery_delay = Duration::ZERO);
    manager.acquire_session().await.unwrap();
    assert_eq!(transport.scan_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_connecting() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.connect_delay = Duration::from_secs(1));
    let manager = manager_for(&transport);

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire_session().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connect_count(), 1);

    manager.shutdown().await;
    assert_eq!(transport.disconnect_count(), 1);

    // The connection that completes afterwards is dropped again
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, Error::Disconnected);
    assert_eq!(transport.disconnect_count(), 2);
    assert!(!transport.is_connected());
    assert!(manager.current().is_none());
}
