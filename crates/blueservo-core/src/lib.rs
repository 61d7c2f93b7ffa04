//! Core traits and types for BlueServo.
//!
//! This crate defines the foundational abstractions shared by the device,
//! storage and synchronization crates:
//! - **ActuatorState / DeviceIdentity**: the domain values
//! - **Error**: the failure taxonomy surfaced by every reconcile call
//! - **ServoConfig**: TOML configuration with environment overrides
//! - **EventBus**: broadcast of session and state events
//! - **StateStore**: the contract of the durable state mirror and request queue

pub mod config;
pub mod error;
pub mod eventbus;
pub mod state;
pub mod store;

pub use config::ServoConfig;
pub use error::{Error, Result};
pub use eventbus::{EventBus, EventBusReceiver, ServoEvent, DEFAULT_CHANNEL_CAPACITY};
pub use state::{now_millis, ActuatorState, DeviceIdentity, StateRecord};
pub use store::{RequestStream, StateStore};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{
        DeviceConfig, ServoConfig, StorageBackendKind, StorageConfig, SyncConfig,
        TimeoutConfig, TransportConfig, TransportKind,
    };
    pub use crate::error::{Error, Result};
    pub use crate::eventbus::{EventBus, ServoEvent};
    pub use crate::state::{ActuatorState, DeviceIdentity, StateRecord};
    pub use crate::store::{RequestStream, StateStore};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
