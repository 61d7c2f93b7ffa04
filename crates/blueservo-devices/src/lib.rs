//! BlueServo device layer.
//!
//! - **adapter**: the [`Transport`] trait over a wireless stack
//! - **adapters**: the simulated and Bluetooth LE transports
//! - **session**: single-flight establishment and teardown of the servo session
//! - **protocol**: command encoding, status decoding and the write/notify exchange

pub mod adapter;
pub mod adapters;
pub mod protocol;
pub mod session;

pub use adapter::{
    Advertisement, AdvertisementStream, CharacteristicHandle, ConnectionHandle,
    NotificationStream, RadioState, ServiceHandle, Transport, TransportError, TransportResult,
};
pub use adapters::{MockBehavior, MockTransport};
#[cfg(feature = "ble")]
pub use adapters::BleTransport;
pub use protocol::{decode_status, encode_command, exchange, read_observed_state, write_command};
pub use session::{Session, SessionConfig, SessionManager};
