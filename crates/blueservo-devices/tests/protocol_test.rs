//! Command Protocol Tests
//!
//! Tests the write/notify exchange over a live session including:
//! - One write and one confirming read per command
//! - Undecodable replies, missing replies and write failures
//! - Disconnects while a reply is pending

use std::sync::Arc;
use std::time::Duration;

use blueservo_core::{ActuatorState, DeviceIdentity, Error};
use blueservo_devices::{
    exchange, read_observed_state, write_command, MockTransport, SessionConfig, SessionManager,
};

const WAIT: Duration = Duration::from_secs(5);

fn manager_for(transport: &MockTransport) -> SessionManager {
    SessionManager::new(
        Arc::new(transport.clone()),
        SessionConfig::new(DeviceIdentity::new("servo-1")),
    )
}

#[tokio::test(start_paused = true)]
async fn test_exchange_confirms_state() {
    let transport = MockTransport::new("servo-1");
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let observed = exchange(&session, ActuatorState::On, WAIT).await.unwrap();

    assert_eq!(observed, ActuatorState::On);
    assert_eq!(transport.servo_state(), ActuatorState::On);
    assert_eq!(transport.written_frames(), vec![b"!S1".to_vec()]);
    assert_eq!(transport.write_count(), 1);
    assert_eq!(transport.subscribe_count(), 1);
    assert!(session.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_exchange_reports_device_state_not_request() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.status_override = Some(b"!S0".to_vec()));
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let observed = exchange(&session, ActuatorState::On, WAIT).await.unwrap();
    assert_eq!(observed, ActuatorState::Off);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_reply_is_awaited() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.notify_delay = Duration::from_secs(2));
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let observed = exchange(&session, ActuatorState::Off, WAIT).await.unwrap();
    assert_eq!(observed, ActuatorState::Off);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_reply_invalidates_session() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.status_override = Some(b"!S5".to_vec()));
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let err = exchange(&session, ActuatorState::On, WAIT).await.unwrap_err();

    assert!(matches!(err, Error::DecodeFailed(_)));
    assert!(!session.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_missing_reply_times_out() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.respond = false);
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let err = exchange(&session, ActuatorState::On, WAIT).await.unwrap_err();

    assert_eq!(err, Error::NotifyTimeout(5_000));
    assert!(!session.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_wins() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.write_error = Some("gatt busy".into()));
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let err = exchange(&session, ActuatorState::On, WAIT).await.unwrap_err();

    assert!(matches!(err, Error::WriteFailed(ref msg) if msg.contains("gatt busy")));
    assert!(!session.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_waiting_for_reply() {
    let transport = MockTransport::new("servo-1");
    transport.configure(|b| b.notify_delay = Duration::from_secs(60));
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            exchange(&session, ActuatorState::On, Duration::from_secs(120)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.trigger_disconnect();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, Error::Disconnected);
    assert!(manager.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_operations_on_closed_session() {
    let transport = MockTransport::new("servo-1");
    let manager = manager_for(&transport);
    let session = manager.acquire_session().await.unwrap();
    manager.release(&session).await;

    assert_eq!(
        write_command(&session, ActuatorState::On).await.unwrap_err(),
        Error::Disconnected
    );
    assert_eq!(
        read_observed_state(&session, WAIT).await.unwrap_err(),
        Error::Disconnected
    );
    assert_eq!(transport.write_count(), 0);
}
