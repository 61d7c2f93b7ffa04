//! Session management for the single servo peripheral.
//!
//! A [`Session`] is a connected peripheral whose write and notify
//! characteristics are both resolved. The [`SessionManager`] owns the only
//! session, establishes it phase by phase (radio ready, scan, connect,
//! service and characteristic discovery) with a deadline on each phase, and
//! tears it down on explicit close, remote disconnect or protocol failure.
//!
//! Concurrent callers of [`SessionManager::acquire_session`] share one
//! in-flight attempt, so there is never more than one scan or connect at a
//! time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use blueservo_core::config::ServoConfig;
use blueservo_core::{now_millis, DeviceIdentity, Error, EventBus, Result, ServoEvent};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::adapter::{
    Advertisement, CharacteristicHandle, ConnectionHandle, RadioState, Transport,
};

/// Parameters of session establishment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: DeviceIdentity,
    pub service_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl SessionConfig {
    /// Defaults for the servo firmware, targeting `identity`.
    pub fn new(identity: DeviceIdentity) -> Self {
        let mut config = Self::from_config(&ServoConfig::default());
        config.identity = identity;
        config
    }

    pub fn from_config(config: &ServoConfig) -> Self {
        Self {
            identity: config.device.identity(),
            service_uuid: config.device.service_uuid,
            write_characteristic_uuid: config.device.write_characteristic_uuid,
            notify_characteristic_uuid: config.device.notify_characteristic_uuid,
            scan_timeout: config.timeouts.scan(),
            connect_timeout: config.timeouts.connect(),
            discovery_timeout: config.timeouts.discovery(),
        }
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}

/// A live, characteristic-resolved connection.
pub struct Session {
    id: u64,
    transport: Arc<dyn Transport>,
    connection: ConnectionHandle,
    write: CharacteristicHandle,
    notify: CharacteristicHandle,
    created_at: DateTime<Utc>,
    alive: watch::Sender<bool>,
    close_reason: Mutex<Option<String>>,
    torn_down: AtomicBool,
}

impl Session {
    fn new(
        id: u64,
        transport: Arc<dyn Transport>,
        connection: ConnectionHandle,
        write: CharacteristicHandle,
        notify: CharacteristicHandle,
    ) -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            id,
            transport,
            connection,
            write,
            notify,
            created_at: Utc::now(),
            alive,
            close_reason: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn peripheral(&self) -> &str {
        &self.connection.peripheral
    }

    pub fn write_characteristic(&self) -> &CharacteristicHandle {
        &self.write
    }

    pub fn notify_characteristic(&self) -> &CharacteristicHandle {
        &self.notify
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Mark the session unusable. The first reason given is kept.
    pub fn invalidate(&self, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.alive.send_replace(false);
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Resolve once the session has been invalidated.
    pub async fn closed(&self) {
        let mut rx = self.alive.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Returns true for the single caller allowed to tear the session down.
    fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("connection", &self.connection)
            .field("created_at", &self.created_at)
            .field("alive", &self.is_alive())
            .finish()
    }
}

type SharedAttempt = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

enum SessionSlot {
    Idle,
    Pending { attempt: u64, future: SharedAttempt },
    Ready(Arc<Session>),
}

/// Owner of the single peripheral session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    slot: Mutex<SessionSlot>,
    /// Connection of an attempt that has not resolved its characteristics yet
    partial: Mutex<Option<ConnectionHandle>>,
    next_attempt: AtomicU64,
    next_session: AtomicU64,
    event_bus: Option<EventBus>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self::build(transport, config, None)
    }

    /// Create a manager that publishes session events on `event_bus`.
    pub fn with_event_bus(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        event_bus: EventBus,
    ) -> Self {
        Self::build(transport, config, Some(event_bus))
    }

    fn build(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        event_bus: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                slot: Mutex::new(SessionSlot::Idle),
                partial: Mutex::new(None),
                next_attempt: AtomicU64::new(0),
                next_session: AtomicU64::new(0),
                event_bus,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Return the live session, establishing one if needed.
    ///
    /// Overlapping calls share the same attempt. A failed attempt is
    /// forgotten, so the next call starts again from the radio check.
    pub async fn acquire_session(&self) -> Result<Arc<Session>> {
        let attempt = {
            let mut slot = self.inner.slot.lock();
            let in_flight = match &*slot {
                SessionSlot::Ready(session) if session.is_alive() => {
                    return Ok(session.clone());
                }
                SessionSlot::Pending { future, .. } => Some(future.clone()),
                _ => None,
            };
            match in_flight {
                Some(future) => {
                    trace!("Joining in-flight session attempt");
                    future
                }
                None => {
                    let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = self.inner.clone();
                    let future = async move { inner.establish(attempt).await }
                        .boxed()
                        .shared();
                    *slot = SessionSlot::Pending {
                        attempt,
                        future: future.clone(),
                    };
                    future
                }
            }
        };
        attempt.await
    }

    /// The live session, without establishing one.
    pub fn current(&self) -> Option<Arc<Session>> {
        match &*self.inner.slot.lock() {
            SessionSlot::Ready(session) if session.is_alive() => Some(session.clone()),
            _ => None,
        }
    }

    /// Whether an establishment attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(&*self.inner.slot.lock(), SessionSlot::Pending { .. })
    }

    /// Invalidate a session, drop it if current and disconnect it.
    pub async fn invalidate(&self, session: &Arc<Session>, reason: &str) {
        session.invalidate(reason);
        self.inner.teardown(session, true).await;
    }

    /// Disconnect a healthy session after use.
    pub async fn release(&self, session: &Arc<Session>) {
        debug!(session_id = session.id(), "Releasing session");
        self.invalidate(session, "released").await;
    }

    /// Best-effort disconnect of the active session, if any.
    ///
    /// A connection still being set up by an in-flight attempt is
    /// disconnected too; that attempt then fails with `Disconnected`.
    pub async fn shutdown(&self) {
        let session = {
            let slot = self.inner.slot.lock();
            match &*slot {
                SessionSlot::Ready(session) => Some(session.clone()),
                _ => None,
            }
        };
        let partial = self.inner.partial.lock().take();

        if let Some(connection) = partial {
            info!(peripheral = %connection.peripheral, "Disconnecting unfinished session on shutdown");
            self.inner.disconnect_quietly(&connection).await;
        }
        match session {
            Some(session) => {
                info!(session_id = session.id(), "Disconnecting on shutdown");
                self.invalidate(&session, "shutdown").await;
            }
            None => debug!("No active session to disconnect"),
        }
    }
}

impl ManagerInner {
    async fn establish(self: Arc<Self>, attempt: u64) -> Result<Arc<Session>> {
        let result = self.open_session().await;

        {
            let mut slot = self.slot.lock();
            if matches!(&*slot, SessionSlot::Pending { attempt: current, .. } if *current == attempt)
            {
                *slot = match &result {
                    Ok(session) => SessionSlot::Ready(session.clone()),
                    Err(_) => SessionSlot::Idle,
                };
            }
        }

        match &result {
            Ok(session) => {
                info!(
                    session_id = session.id(),
                    peripheral = session.peripheral(),
                    "Session established"
                );
                self.publish(ServoEvent::SessionEstablished {
                    session_id: session.id(),
                    peripheral: session.peripheral().to_string(),
                    timestamp: now_millis(),
                });
                self.watch_session(session.clone());
            }
            Err(e) => warn!(error = %e, "Session attempt failed"),
        }

        result
    }

    async fn open_session(&self) -> Result<Arc<Session>> {
        self.ensure_powered_on().await?;
        let advertisement = self.scan_for_target().await?;

        *self.partial.lock() = Some(ConnectionHandle::unestablished(&advertisement.id));
        let connection = match self.connect(&advertisement).await {
            Ok(connection) => connection,
            Err(e) => {
                self.partial.lock().take();
                return Err(e);
            }
        };
        if !self.claim_partial(&connection) {
            debug!(peripheral = %connection.peripheral, "Shut down while connecting");
            self.disconnect_quietly(&connection).await;
            return Err(Error::Disconnected);
        }

        let resolved = self.resolve_characteristics(&connection).await;
        // Gone when shutdown already disconnected it
        if self.partial.lock().take().is_none() {
            debug!(peripheral = %connection.peripheral, "Shut down while resolving characteristics");
            return Err(Error::Disconnected);
        }

        match resolved {
            Ok((write, notify)) => {
                let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Arc::new(Session::new(
                    id,
                    self.transport.clone(),
                    connection,
                    write,
                    notify,
                )))
            }
            Err(e) => {
                self.disconnect_quietly(&connection).await;
                Err(e)
            }
        }
    }

    /// Replace the placeholder handle with the established one, unless
    /// shutdown took it in the meantime.
    fn claim_partial(&self, connection: &ConnectionHandle) -> bool {
        let mut partial = self.partial.lock();
        match partial.as_mut() {
            Some(handle) => {
                *handle = connection.clone();
                true
            }
            None => false,
        }
    }

    async fn ensure_powered_on(&self) -> Result<()> {
        match timeout(self.config.scan_timeout, self.transport.wait_ready()).await {
            Ok(RadioState::PoweredOn) => Ok(()),
            Ok(state) => {
                warn!(%state, "Radio is not powered on");
                Err(Error::PoweredOff)
            }
            Err(_) => {
                warn!(
                    "Radio did not report ready within {:?}",
                    self.config.scan_timeout
                );
                Err(Error::PoweredOff)
            }
        }
    }

    async fn scan_for_target(&self) -> Result<Advertisement> {
        let config = &self.config;
        debug!(service = %config.service_uuid, target = %config.identity, "Start scanning");

        let mut advertisements = self
            .transport
            .start_scan(config.service_uuid)
            .await
            .map_err(|e| Error::ConnectError(format!("scan failed: {}", e)))?;

        let found = timeout(config.scan_timeout, async {
            while let Some(advertisement) = advertisements.next().await {
                if config
                    .identity
                    .matches(&advertisement.id, advertisement.address.as_deref())
                {
                    return Some(advertisement);
                }
                trace!(id = %advertisement.id, "Ignoring advertisement");
            }
            None
        })
        .await;
        drop(advertisements);

        if let Err(e) = self.transport.stop_scan().await {
            warn!(error = %e, "Failed to stop scanning");
        }

        match found {
            Ok(Some(advertisement)) => {
                info!(id = %advertisement.id, "Found peripheral");
                Ok(advertisement)
            }
            Ok(None) => {
                warn!("Scan ended without finding {}", config.identity);
                Err(Error::ScanTimeout(millis(config.scan_timeout)))
            }
            Err(_) => {
                warn!("Scanning timed out after {:?}", config.scan_timeout);
                Err(Error::ScanTimeout(millis(config.scan_timeout)))
            }
        }
    }

    async fn connect(&self, advertisement: &Advertisement) -> Result<ConnectionHandle> {
        debug!(id = %advertisement.id, "Connect to peripheral");
        match timeout(
            self.config.connect_timeout,
            self.transport.connect(advertisement),
        )
        .await
        {
            Ok(Ok(connection)) => {
                debug!(id = %advertisement.id, "Connected to peripheral");
                Ok(connection)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Connection failed");
                self.disconnect_quietly(&ConnectionHandle::unestablished(&advertisement.id))
                    .await;
                Err(Error::ConnectError(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Connection to peripheral {} timed out after {:?}",
                    advertisement.id, self.config.connect_timeout
                );
                self.disconnect_quietly(&ConnectionHandle::unestablished(&advertisement.id))
                    .await;
                Err(Error::ConnectTimeout(millis(self.config.connect_timeout)))
            }
        }
    }

    async fn resolve_characteristics(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<(CharacteristicHandle, CharacteristicHandle)> {
        let config = &self.config;

        let services = match timeout(
            config.connect_timeout,
            self.transport
                .discover_services(connection, config.service_uuid),
        )
        .await
        {
            Ok(Ok(services)) => services,
            Ok(Err(e)) => {
                return Err(Error::ConnectError(format!(
                    "service discovery failed: {}",
                    e
                )))
            }
            Err(_) => return Err(Error::ConnectTimeout(millis(config.connect_timeout))),
        };

        debug!("Number of services found: {}", services.len());
        if services.is_empty() {
            return Err(Error::NoServices);
        }

        let wanted = [
            config.write_characteristic_uuid,
            config.notify_characteristic_uuid,
        ];
        let resolved = timeout(config.discovery_timeout, async {
            let mut write = None;
            let mut notify = None;
            for service in &services {
                match self
                    .transport
                    .discover_characteristics(service, &wanted)
                    .await
                {
                    Ok(characteristics) => {
                        debug!(
                            service = %service.uuid,
                            "Number of characteristics found: {}",
                            characteristics.len()
                        );
                        for characteristic in characteristics {
                            if characteristic.uuid == config.write_characteristic_uuid {
                                if write.is_none() {
                                    write = Some(characteristic);
                                }
                            } else if characteristic.uuid == config.notify_characteristic_uuid
                                && notify.is_none()
                            {
                                notify = Some(characteristic);
                            }
                        }
                    }
                    Err(e) => warn!(service = %service.uuid, error = %e, "Characteristic discovery failed"),
                }

                if let (Some(write), Some(notify)) = (&write, &notify) {
                    return Some((write.clone(), notify.clone()));
                }
            }
            None
        })
        .await;

        match resolved {
            Ok(Some(pair)) => Ok(pair),
            _ => Err(Error::NoCharacteristics(millis(config.discovery_timeout))),
        }
    }

    /// Tear the session down once it is invalidated or the link drops.
    fn watch_session(self: &Arc<Self>, session: Arc<Session>) {
        let manager: Weak<ManagerInner> = Arc::downgrade(self);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let remote = tokio::select! {
                _ = transport.wait_disconnected(session.connection()) => true,
                _ = session.closed() => false,
            };
            if remote {
                info!(session_id = session.id(), "Peripheral disconnected");
                session.invalidate("remote disconnect");
            }
            if let Some(manager) = manager.upgrade() {
                manager.teardown(&session, !remote).await;
            }
        });
    }

    async fn teardown(&self, session: &Arc<Session>, disconnect: bool) {
        {
            let mut slot = self.slot.lock();
            if matches!(&*slot, SessionSlot::Ready(current) if current.id() == session.id()) {
                *slot = SessionSlot::Idle;
            }
        }

        if !session.begin_teardown() {
            return;
        }

        if disconnect {
            self.disconnect_quietly(session.connection()).await;
        }

        let reason = session
            .close_reason()
            .unwrap_or_else(|| "closed".to_string());
        info!(session_id = session.id(), %reason, "Session closed");
        self.publish(ServoEvent::SessionClosed {
            session_id: session.id(),
            reason,
            timestamp: now_millis(),
        });
    }

    async fn disconnect_quietly(&self, connection: &ConnectionHandle) {
        if let Err(e) = self.transport.disconnect(connection).await {
            warn!(peripheral = %connection.peripheral, error = %e, "Disconnect failed");
        }
    }

    fn publish(&self, event: ServoEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
