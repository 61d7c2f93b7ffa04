//! Transport implementations.
//!
//! - `mock`: in-process simulated servo, always available
//! - `ble`: Bluetooth Low Energy via btleplug (feature `ble`)

pub mod mock;

#[cfg(feature = "ble")]
pub mod ble;

pub use mock::{MockBehavior, MockTransport};

#[cfg(feature = "ble")]
pub use ble::BleTransport;
