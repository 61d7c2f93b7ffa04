//! Servo domain values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// On/off state of the actuator.
///
/// Used both for the state a caller wants (desired) and the state the device
/// or store reports (observed). Absence of a prior state is `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorState {
    On,
    Off,
}

impl ActuatorState {
    /// Textual form used by the store and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActuatorState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(Error::InvalidState(s.to_string())),
        }
    }
}

/// Identifier of the single target peripheral (platform id or hardware address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether an advertisement with the given id and address names this device.
    ///
    /// Ids are compared exactly, addresses ignoring case.
    pub fn matches(&self, id: &str, address: Option<&str>) -> bool {
        if self.0 == id {
            return true;
        }
        address.is_some_and(|addr| !addr.is_empty() && addr.eq_ignore_ascii_case(&self.0))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted observation of the actuator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: ActuatorState,
    /// Creation timestamp (unix millis)
    pub created_at: i64,
}

impl StateRecord {
    /// Create a record stamped with the current time.
    pub fn now(state: ActuatorState) -> Self {
        Self {
            state,
            created_at: now_millis(),
        }
    }
}

/// Current time as unix millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!("on".parse::<ActuatorState>().unwrap(), ActuatorState::On);
        assert_eq!(" OFF ".parse::<ActuatorState>().unwrap(), ActuatorState::Off);
        assert!(matches!(
            "maybe".parse::<ActuatorState>(),
            Err(Error::InvalidState(s)) if s == "maybe"
        ));
    }

    #[test]
    fn test_state_serde_lowercase() {
        let json = serde_json::to_string(&ActuatorState::On).unwrap();
        assert_eq!(json, "\"on\"");
        let record = StateRecord {
            state: ActuatorState::Off,
            created_at: 42,
        };
        let back: StateRecord =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_identity_matches_id_or_address() {
        let identity = DeviceIdentity::new("C8:FD:19:0A:11:22");
        assert!(identity.matches("C8:FD:19:0A:11:22", None));
        assert!(identity.matches("hci0/dev_x", Some("c8:fd:19:0a:11:22")));
        assert!(!identity.matches("other", Some("00:00:00:00:00:00")));
        assert!(!identity.matches("other", Some("")));
    }
}
