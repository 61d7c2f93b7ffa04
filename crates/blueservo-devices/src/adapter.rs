//! Transport adapter interface.
//!
//! The session manager talks to the radio stack only through [`Transport`].
//! Each primitive of the stack (discovery, connect, service and
//! characteristic discovery, write, notify, disconnect) is a single async
//! operation; event callbacks of the underlying stack are surfaced as streams.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use uuid::Uuid;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Adapter configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// Peripheral, service or characteristic not known to the adapter
    #[error("Not found: {0}")]
    NotFound(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Other error
    #[error("Transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Power state of the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unknown,
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "powered-on"),
            Self::PoweredOff => write!(f, "powered-off"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// An advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral id
    pub id: String,
    /// Hardware address, when the platform exposes it
    pub address: Option<String>,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
            local_name: None,
            rssi: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }
}

/// A connection established by the transport.
///
/// `id` distinguishes successive connections to the same peripheral; `0`
/// refers to whatever connection attempt is underway for the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub peripheral: String,
    pub id: u64,
}

impl ConnectionHandle {
    pub fn new(peripheral: impl Into<String>, id: u64) -> Self {
        Self {
            peripheral: peripheral.into(),
            id,
        }
    }

    /// Handle naming a connection that never completed, used for cleanup.
    pub fn unestablished(peripheral: impl Into<String>) -> Self {
        Self::new(peripheral, 0)
    }
}

/// A GATT service discovered on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub connection: ConnectionHandle,
    pub uuid: Uuid,
    /// Position among services with the same uuid
    pub index: usize,
}

/// A GATT characteristic discovered on a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub connection: ConnectionHandle,
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Advertisements in discovery order.
pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Notification payloads in arrival order.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Transport adapter trait.
///
/// Implementations wrap a wireless stack. None of the operations carry their
/// own deadline; the session manager bounds every phase.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the adapter name.
    fn name(&self) -> &str;

    /// Resolve once the radio reports a definite power state.
    async fn wait_ready(&self) -> RadioState;

    /// Start scanning for peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> TransportResult<AdvertisementStream>;

    /// Stop scanning. Advertisement streams stop yielding afterwards.
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Connect to an advertised peripheral.
    async fn connect(&self, peripheral: &Advertisement) -> TransportResult<ConnectionHandle>;

    /// Resolve when the connection goes away, for any reason.
    async fn wait_disconnected(&self, connection: &ConnectionHandle);

    /// Discover services matching `service` on a connection.
    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
        service: Uuid,
    ) -> TransportResult<Vec<ServiceHandle>>;

    /// Discover characteristics of a service whose uuid is in `uuids`.
    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
        uuids: &[Uuid],
    ) -> TransportResult<Vec<CharacteristicHandle>>;

    /// Write without response.
    async fn write(&self, characteristic: &CharacteristicHandle, data: &[u8])
        -> TransportResult<()>;

    /// Enable notifications and return the notification stream.
    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<NotificationStream>;

    /// Disconnect. Disconnecting an already closed connection is not an error.
    async fn disconnect(&self, connection: &ConnectionHandle) -> TransportResult<()>;
}
