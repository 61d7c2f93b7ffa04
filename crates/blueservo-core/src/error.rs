//! Error taxonomy shared across BlueServo crates.
//!
//! Every failure a `reconcile` call can surface maps onto one variant here.
//! Crate-local errors (transport, storage) convert into this type at the
//! crate boundary.

use thiserror::Error;

/// Result type for BlueServo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// BlueServo error types.
///
/// The type is `Clone` so a single in-flight session attempt can hand the
/// same failure to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The radio is not powered on (or never reported ready).
    #[error("Radio is powered off")]
    PoweredOff,

    /// The target peripheral was not seen before the scan deadline.
    #[error("Scanning timed out after {0}ms")]
    ScanTimeout(u64),

    /// The transport reported a failure while connecting or discovering services.
    #[error("Connection error: {0}")]
    ConnectError(String),

    /// The connect handshake did not complete in time.
    #[error("Connection timed out after {0}ms")]
    ConnectTimeout(u64),

    /// The peripheral exposes no service matching the filter.
    #[error("No services found")]
    NoServices,

    /// The write/notify characteristic pair was not resolved.
    #[error("Characteristics not resolved within {0}ms")]
    NoCharacteristics(u64),

    /// The session was invalidated while an operation was using it.
    #[error("Peripheral disconnected")]
    Disconnected,

    /// A textual state that is neither "on" nor "off".
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The command write was rejected by the transport.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Notification subscription was rejected by the transport.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// No status notification arrived in time.
    #[error("No status notification within {0}ms")]
    NotifyTimeout(u64),

    /// The device reported a state the protocol does not recognize.
    #[error("Servo state is unknown: {0}")]
    DecodeFailed(String),

    /// The state store could not be queried or written.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error happened while establishing a session.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::PoweredOff
                | Self::ScanTimeout(_)
                | Self::ConnectError(_)
                | Self::ConnectTimeout(_)
                | Self::NoServices
                | Self::NoCharacteristics(_)
        )
    }

    /// Whether a session that produced this error must not be reused.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::WriteFailed(_)
                | Self::SubscribeFailed(_)
                | Self::NotifyTimeout(_)
                | Self::DecodeFailed(_)
        )
    }

    /// Short machine-friendly name of the variant, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoweredOff => "powered_off",
            Self::ScanTimeout(_) => "scan_timeout",
            Self::ConnectError(_) => "connect_error",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::NoServices => "no_services",
            Self::NoCharacteristics(_) => "no_characteristics",
            Self::Disconnected => "disconnected",
            Self::InvalidState(_) => "invalid_state",
            Self::WriteFailed(_) => "write_failed",
            Self::SubscribeFailed(_) => "subscribe_failed",
            Self::NotifyTimeout(_) => "notify_timeout",
            Self::DecodeFailed(_) => "decode_failed",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Config(_) => "config",
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::PoweredOff.to_string(), "Radio is powered off");
        assert_eq!(
            Error::ScanTimeout(10_000).to_string(),
            "Scanning timed out after 10000ms"
        );
        assert!(Error::DecodeFailed("5".into()).to_string().contains('5'));
    }

    #[test]
    fn test_session_errors_do_not_invalidate() {
        for err in [
            Error::PoweredOff,
            Error::ScanTimeout(1),
            Error::ConnectError("boom".into()),
            Error::ConnectTimeout(1),
            Error::NoServices,
            Error::NoCharacteristics(1),
        ] {
            assert!(err.is_session_error(), "{err}");
            assert!(!err.invalidates_session(), "{err}");
        }
    }

    #[test]
    fn test_protocol_errors_invalidate() {
        assert!(Error::WriteFailed("x".into()).invalidates_session());
        assert!(Error::DecodeFailed("x".into()).invalidates_session());
        assert!(Error::Disconnected.invalidates_session());
        assert!(!Error::InvalidState("x".into()).invalidates_session());
        assert!(!Error::StoreUnavailable("x".into()).invalidates_session());
    }
}
