//! Bluetooth Low Energy transport backed by btleplug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{
    Advertisement, AdvertisementStream, CharacteristicHandle, ConnectionHandle,
    NotificationStream, RadioState, ServiceHandle, Transport, TransportError, TransportResult,
};

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn ble_error(e: btleplug::Error) -> TransportError {
    TransportError::Communication(e.to_string())
}

/// Transport using the first Bluetooth adapter of the host.
pub struct BleTransport {
    adapter: Adapter,
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    connections: RwLock<HashMap<String, u64>>,
    next_connection: AtomicU64,
}

impl BleTransport {
    pub async fn new() -> TransportResult<Self> {
        let manager = Manager::new().await.map_err(ble_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Configuration("no Bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => warn!(error = %e, "Could not read adapter info"),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
        })
    }

    fn peripheral(&self, id: &str) -> TransportResult<Peripheral> {
        self.peripherals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }

    fn connected_peripheral(&self, connection: &ConnectionHandle) -> TransportResult<Peripheral> {
        match self.connections.read().get(&connection.peripheral) {
            Some(id) if *id == connection.id => {}
            _ => return Err(TransportError::NotConnected),
        }
        self.peripheral(&connection.peripheral)
    }

    fn characteristic(
        &self,
        handle: &CharacteristicHandle,
    ) -> TransportResult<(Peripheral, Characteristic)> {
        let peripheral = self.connected_peripheral(&handle.connection)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
            .ok_or_else(|| TransportError::NotFound(handle.uuid.to_string()))?;
        Ok((peripheral, characteristic))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn name(&self) -> &str {
        "ble"
    }

    async fn wait_ready(&self) -> RadioState {
        loop {
            match self.adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => return RadioState::PoweredOn,
                Ok(CentralState::PoweredOff) => return RadioState::PoweredOff,
                Ok(CentralState::Unknown) => {}
                Err(e) => debug!(error = %e, "Adapter state unavailable"),
            }
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
    }

    async fn start_scan(&self, service: Uuid) -> TransportResult<AdvertisementStream> {
        let mut events = self.adapter.events().await.map_err(ble_error)?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(ble_error)?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        // Resolve properties off the event stream so slow lookups do not stall it
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    continue;
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let mut advertisement = Advertisement::new(id.to_string());
                if let Ok(Some(properties)) = peripheral.properties().await {
                    advertisement.address = Some(properties.address.to_string());
                    advertisement.local_name = properties.local_name;
                    advertisement.rssi = properties.rssi;
                }
                peripherals
                    .write()
                    .insert(advertisement.id.clone(), peripheral);
                if tx.send(advertisement).is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(async_stream::stream! {
            while let Some(advertisement) = rx.recv().await {
                yield advertisement;
            }
        }))
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.adapter.stop_scan().await.map_err(ble_error)
    }

    async fn connect(&self, advertisement: &Advertisement) -> TransportResult<ConnectionHandle> {
        let peripheral = self.lookup(&advertisement.id).await?;
        peripheral.connect().await.map_err(|e| TransportError::Connection(e.to_string()))?;

        let id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.connections.write().insert(advertisement.id.clone(), id);
        debug!(peripheral = %advertisement.id, "Connected");
        Ok(ConnectionHandle::new(advertisement.id.clone(), id))
    }

    async fn wait_disconnected(&self, connection: &ConnectionHandle) {
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Cannot watch for disconnects");
                return futures::future::pending().await;
            }
        };
        loop {
            if self.connected_peripheral(connection).is_err() {
                return;
            }
            match events.next().await {
                Some(CentralEvent::DeviceDisconnected(id)) if id.to_string() == connection.peripheral => {
                    self.connections.write().remove(&connection.peripheral);
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
    }

    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
        service: Uuid,
    ) -> TransportResult<Vec<ServiceHandle>> {
        let peripheral = self.connected_peripheral(connection)?;
        peripheral.discover_services().await.map_err(ble_error)?;
        Ok(peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .enumerate()
            .map(|(index, s)| ServiceHandle {
                connection: connection.clone(),
                uuid: s.uuid,
                index,
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        uuids: &[Uuid],
    ) -> TransportResult<Vec<CharacteristicHandle>> {
        let peripheral = self.connected_peripheral(&service.connection)?;
        let found = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service.uuid)
            .nth(service.index)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .filter(|c| uuids.contains(&c.uuid))
                    .map(|c| CharacteristicHandle {
                        connection: service.connection.clone(),
                        service: s.uuid,
                        uuid: c.uuid,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> TransportResult<()> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        peripheral
            .write(&target, data, WriteType::WithoutResponse)
            .await
            .map_err(ble_error)
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<NotificationStream> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        let notifications = peripheral.notifications().await.map_err(ble_error)?;
        peripheral.subscribe(&target).await.map_err(ble_error)?;

        let uuid = target.uuid;
        Ok(Box::pin(notifications.filter_map(move |n| async move {
            (n.uuid == uuid).then_some(n.value)
        })))
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> TransportResult<()> {
        let live = self.connections.read().get(&connection.peripheral).copied();
        match live {
            Some(id) if connection.id == 0 || id == connection.id => {
                self.connections.write().remove(&connection.peripheral);
            }
            Some(_) => return Ok(()),
            None if connection.id != 0 => return Ok(()),
            None => {}
        }

        let Ok(peripheral) = self.peripheral(&connection.peripheral) else {
            return Ok(());
        };
        match peripheral.is_connected().await {
            Ok(false) => Ok(()),
            _ => peripheral.disconnect().await.map_err(ble_error),
        }
    }
}

impl BleTransport {
    /// Find the peripheral for an advertisement id, asking the adapter if it
    /// was not seen through this transport's scan.
    async fn lookup(&self, id: &str) -> TransportResult<Peripheral> {
        if let Ok(peripheral) = self.peripheral(id) {
            return Ok(peripheral);
        }
        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(ble_error)?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
        self.peripherals
            .write()
            .insert(id.to_string(), peripheral.clone());
        Ok(peripheral)
    }
}
