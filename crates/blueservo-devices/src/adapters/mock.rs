//! In-process transport simulating the servo peripheral.
//!
//! The simulated device advertises the servo service, exposes the write and
//! notify characteristics and answers every `!S1`/`!S0` write with a status
//! notification. Each step can be slowed down or made to fail through
//! [`MockBehavior`], and counters record what the session manager did.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blueservo_core::config::gatt;
use blueservo_core::ActuatorState;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::adapter::{
    Advertisement, AdvertisementStream, CharacteristicHandle, ConnectionHandle,
    NotificationStream, RadioState, ServiceHandle, Transport, TransportError, TransportResult,
};
use crate::protocol::status_frame;

/// Knobs controlling how the simulated peripheral behaves.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Reported radio state. `Unknown` never resolves.
    pub radio: RadioState,
    /// Whether the servo advertises at all.
    pub advertise: bool,
    pub advertise_delay: Duration,
    /// Advertisements of other devices, seen before the servo.
    pub other_advertisements: Vec<Advertisement>,
    pub connect_delay: Duration,
    pub connect_error: Option<String>,
    /// Number of matching services reported after connecting.
    pub services: usize,
    /// Time each characteristic discovery takes.
    pub discovery_delay: Duration,
    pub expose_write: bool,
    pub expose_notify: bool,
    pub write_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
    pub write_error: Option<String>,
    pub subscribe_error: Option<String>,
    /// Whether writes are answered with a status notification.
    pub respond: bool,
    /// Payload sent instead of the real status.
    pub status_override: Option<Vec<u8>>,
    pub notify_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            radio: RadioState::PoweredOn,
            advertise: true,
            advertise_delay: Duration::from_millis(10),
            other_advertisements: Vec::new(),
            connect_delay: Duration::ZERO,
            connect_error: None,
            services: 1,
            discovery_delay: Duration::ZERO,
            expose_write: true,
            expose_notify: true,
            write_characteristic_uuid: gatt::WRITE_CHARACTERISTIC_UUID,
            notify_characteristic_uuid: gatt::NOTIFY_CHARACTERISTIC_UUID,
            write_error: None,
            subscribe_error: None,
            respond: true,
            status_override: None,
            notify_delay: Duration::ZERO,
        }
    }
}

/// Simulated servo transport.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    name: &'static str,
    advertisement: Advertisement,
    behavior: Mutex<MockBehavior>,
    servo: Mutex<ActuatorState>,
    scanning: AtomicBool,
    /// Id of the live connection, 0 when disconnected.
    connection: watch::Sender<u64>,
    next_connection: AtomicU64,
    notifications: broadcast::Sender<Vec<u8>>,
    written: Mutex<Vec<Vec<u8>>>,
    scans: AtomicUsize,
    connects: AtomicUsize,
    writes: AtomicUsize,
    subscribes: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockTransport {
    /// Create a mock peripheral advertising under `peripheral_id`.
    pub fn new(peripheral_id: impl Into<String>) -> Self {
        Self::from_advertisement(Advertisement::new(peripheral_id).with_local_name("servo"))
    }

    /// Mock peripheral with a custom advertisement, e.g. one carrying an address.
    pub fn from_advertisement(advertisement: Advertisement) -> Self {
        Self::build("mock", advertisement)
    }

    /// Mock used when the CLI runs without radio hardware.
    pub fn simulated(peripheral_id: impl Into<String>) -> Self {
        Self::build(
            "simulated",
            Advertisement::new(peripheral_id).with_local_name("servo"),
        )
    }

    fn build(name: &'static str, advertisement: Advertisement) -> Self {
        let (connection, _) = watch::channel(0);
        let (notifications, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(MockInner {
                name,
                advertisement,
                behavior: Mutex::new(MockBehavior::default()),
                servo: Mutex::new(ActuatorState::Off),
                scanning: AtomicBool::new(false),
                connection,
                next_connection: AtomicU64::new(0),
                notifications,
                written: Mutex::new(Vec::new()),
                scans: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *self.inner.behavior.lock() = behavior;
        self
    }

    /// Change behavior in place, e.g. between two reconcile calls.
    pub fn configure(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.inner.behavior.lock());
    }

    pub fn servo_state(&self) -> ActuatorState {
        *self.inner.servo.lock()
    }

    pub fn set_servo_state(&self, state: ActuatorState) {
        *self.inner.servo.lock() = state;
    }

    /// Simulate the peripheral dropping the link.
    pub fn trigger_disconnect(&self) {
        debug!("Simulating remote disconnect");
        self.inner.connection.send_replace(0);
    }

    /// Push an unsolicited notification to subscribers.
    pub fn notify(&self, payload: impl Into<Vec<u8>>) {
        let _ = self.inner.notifications.send(payload.into());
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connection.borrow() != 0
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.inner.written.lock().clone()
    }

    pub fn scan_count(&self) -> usize {
        self.inner.scans.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> MockBehavior {
        self.inner.behavior.lock().clone()
    }

    fn ensure_connected(&self, connection: &ConnectionHandle) -> TransportResult<()> {
        let live = *self.inner.connection.borrow();
        if live != 0 && live == connection.id {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        self.inner.name
    }

    async fn wait_ready(&self) -> RadioState {
        match self.behavior().radio {
            RadioState::Unknown => futures::future::pending().await,
            state => state,
        }
    }

    async fn start_scan(&self, service: Uuid) -> TransportResult<AdvertisementStream> {
        self.inner.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.scanning.store(true, Ordering::SeqCst);
        trace!(%service, "Mock scan started");

        let behavior = self.behavior();
        let inner = self.inner.clone();
        Ok(Box::pin(async_stream::stream! {
            for advertisement in behavior.other_advertisements {
                if !inner.scanning.load(Ordering::SeqCst) {
                    return;
                }
                yield advertisement;
            }
            if behavior.advertise {
                tokio::time::sleep(behavior.advertise_delay).await;
                if inner.scanning.load(Ordering::SeqCst) {
                    yield inner.advertisement.clone();
                }
            }
            futures::future::pending::<()>().await;
        }))
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.inner.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, peripheral: &Advertisement) -> TransportResult<ConnectionHandle> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior();

        if !behavior.connect_delay.is_zero() {
            tokio::time::sleep(behavior.connect_delay).await;
        }
        if let Some(error) = behavior.connect_error {
            return Err(TransportError::Connection(error));
        }
        if peripheral.id != self.inner.advertisement.id {
            return Err(TransportError::NotFound(peripheral.id.clone()));
        }

        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.connection.send_replace(id);
        Ok(ConnectionHandle::new(peripheral.id.clone(), id))
    }

    async fn wait_disconnected(&self, connection: &ConnectionHandle) {
        let mut rx = self.inner.connection.subscribe();
        loop {
            if *rx.borrow_and_update() != connection.id {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
        service: Uuid,
    ) -> TransportResult<Vec<ServiceHandle>> {
        self.ensure_connected(connection)?;
        Ok((0..self.behavior().services)
            .map(|index| ServiceHandle {
                connection: connection.clone(),
                uuid: service,
                index,
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        uuids: &[Uuid],
    ) -> TransportResult<Vec<CharacteristicHandle>> {
        let delay = self.behavior().discovery_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_connected(&service.connection)?;
        // Only the first service carries characteristics
        if service.index != 0 {
            return Ok(Vec::new());
        }

        let behavior = self.behavior();
        let mut exposed = Vec::new();
        if behavior.expose_write {
            exposed.push(behavior.write_characteristic_uuid);
        }
        if behavior.expose_notify {
            exposed.push(behavior.notify_characteristic_uuid);
        }

        Ok(exposed
            .into_iter()
            .filter(|uuid| uuids.contains(uuid))
            .map(|uuid| CharacteristicHandle {
                connection: service.connection.clone(),
                service: service.uuid,
                uuid,
            })
            .collect())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> TransportResult<()> {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected(&characteristic.connection)?;

        let behavior = self.behavior();
        if let Some(error) = behavior.write_error {
            return Err(TransportError::Communication(error));
        }

        let state = match data {
            b"!S1" => ActuatorState::On,
            b"!S0" => ActuatorState::Off,
            other => {
                return Err(TransportError::Communication(format!(
                    "unrecognized command {:?}",
                    other
                )))
            }
        };
        self.inner.written.lock().push(data.to_vec());
        *self.inner.servo.lock() = state;

        if !behavior.respond {
            return Ok(());
        }

        let payload = behavior
            .status_override
            .unwrap_or_else(|| status_frame(state).to_vec());
        if behavior.notify_delay.is_zero() {
            let _ = self.inner.notifications.send(payload);
        } else {
            let notifications = self.inner.notifications.clone();
            let delay = behavior.notify_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = notifications.send(payload);
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<NotificationStream> {
        self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected(&characteristic.connection)?;

        if let Some(error) = self.behavior().subscribe_error {
            return Err(TransportError::Communication(error));
        }

        let mut rx = self.inner.notifications.subscribe();
        Ok(Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(payload) => yield payload,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> TransportResult<()> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        // Id 0 cancels whatever connection is underway
        self.inner.connection.send_if_modified(|live| {
            if *live != 0 && (connection.id == 0 || *live == connection.id) {
                *live = 0;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_write_is_answered() {
        let transport = MockTransport::new("servo-1");
        let mut ads = transport.start_scan(gatt::SERVICE_UUID).await.unwrap();
        let ad = ads.next().await.unwrap();
        assert_eq!(ad.id, "servo-1");

        let conn = transport.connect(&ad).await.unwrap();
        let services = transport
            .discover_services(&conn, gatt::SERVICE_UUID)
            .await
            .unwrap();
        let chars = transport
            .discover_characteristics(
                &services[0],
                &[gatt::WRITE_CHARACTERISTIC_UUID, gatt::NOTIFY_CHARACTERISTIC_UUID],
            )
            .await
            .unwrap();
        assert_eq!(chars.len(), 2);

        let mut notifications = transport.subscribe(&chars[1]).await.unwrap();
        transport.write(&chars[0], b"!S1").await.unwrap();
        assert_eq!(notifications.next().await.unwrap(), b"!S1".to_vec());
        assert_eq!(transport.servo_state(), ActuatorState::On);
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let transport = MockTransport::new("servo-1");
        let conn = transport
            .connect(&Advertisement::new("servo-1"))
            .await
            .unwrap();
        transport
            .disconnect(&ConnectionHandle::new("servo-1", conn.id + 1))
            .await
            .unwrap();
        assert!(transport.is_connected());

        transport.disconnect(&conn).await.unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.disconnect_count(), 2);
    }
}
