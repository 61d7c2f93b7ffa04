//! Servo command protocol.
//!
//! Commands are three ASCII bytes, `!S1` (on) and `!S0` (off), written
//! without response to the write characteristic. The device answers on the
//! notify characteristic; the digit at byte offset 2 of the payload is the
//! state it actually reached.

use std::time::Duration;

use blueservo_core::{ActuatorState, Error, Result};
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::adapter::NotificationStream;
use crate::session::Session;

/// Length of a command frame.
pub const FRAME_LEN: usize = 3;

/// Offset of the state digit in a status payload.
pub const STATE_BYTE_OFFSET: usize = 2;

/// Encode a desired state as a command frame.
pub fn encode_command(state: ActuatorState) -> [u8; FRAME_LEN] {
    match state {
        ActuatorState::On => *b"!S1",
        ActuatorState::Off => *b"!S0",
    }
}

/// Encode a textual state. Anything but `on`/`off` is `InvalidState`.
pub fn encode_command_str(state: &str) -> Result<[u8; FRAME_LEN]> {
    Ok(encode_command(state.parse()?))
}

/// Build the status payload a device sends after reaching `state`.
pub fn status_frame(state: ActuatorState) -> [u8; FRAME_LEN] {
    encode_command(state)
}

/// Decode a status payload.
///
/// The byte at [`STATE_BYTE_OFFSET`] is read as a decimal digit: `0` is off,
/// `1` is on. Short payloads, non-digits and other digits are rejected.
pub fn decode_status(payload: &[u8]) -> Result<ActuatorState> {
    let byte = payload.get(STATE_BYTE_OFFSET).copied().ok_or_else(|| {
        Error::DecodeFailed(format!("payload too short ({} bytes)", payload.len()))
    })?;

    match (byte as char).to_digit(10) {
        Some(0) => Ok(ActuatorState::Off),
        Some(1) => Ok(ActuatorState::On),
        Some(digit) => Err(Error::DecodeFailed(format!("unexpected state digit {}", digit))),
        None => Err(Error::DecodeFailed(format!(
            "byte 0x{:02x} is not a digit",
            byte
        ))),
    }
}

/// Write the command for `desired` to the session.
pub async fn write_command(session: &Session, desired: ActuatorState) -> Result<()> {
    if !session.is_alive() {
        return Err(Error::Disconnected);
    }

    let frame = encode_command(desired);
    match session
        .transport()
        .write(session.write_characteristic(), &frame)
        .await
    {
        Ok(()) => {
            debug!(session_id = session.id(), "Wrote state {}", desired);
            Ok(())
        }
        Err(e) => {
            let err = Error::WriteFailed(e.to_string());
            warn!(session_id = session.id(), error = %e, "Write failed");
            session.invalidate(err.to_string());
            Err(err)
        }
    }
}

/// Subscribe to status notifications and wait for the next one.
pub async fn read_observed_state(session: &Session, wait: Duration) -> Result<ActuatorState> {
    let mut notifications = subscribe(session).await?;
    next_status(session, &mut notifications, wait).await
}

/// Send `desired` and return the state the device reports back.
///
/// The subscription is set up before the write goes out so the reply cannot
/// be missed. A write failure wins over a reply that arrives anyway, and a
/// disconnect wins over both.
pub async fn exchange(
    session: &Session,
    desired: ActuatorState,
    wait: Duration,
) -> Result<ActuatorState> {
    let read = read_observed_state(session, wait);
    let write = write_command(session, desired);
    tokio::pin!(read);
    tokio::pin!(write);

    let mut written = false;
    loop {
        tokio::select! {
            biased;
            observed = &mut read => {
                let write_result = if written { Ok(()) } else { (&mut write).await };
                return match (observed, write_result) {
                    (Err(Error::Disconnected), _) => Err(Error::Disconnected),
                    (_, Err(e)) => Err(e),
                    (Ok(state), Ok(())) => {
                        debug!(session_id = session.id(), "Device reports {}", state);
                        Ok(state)
                    }
                    (Err(e), Ok(())) => Err(e),
                };
            }
            result = &mut write, if !written => {
                result?;
                written = true;
            }
        }
    }
}

async fn subscribe(session: &Session) -> Result<NotificationStream> {
    if !session.is_alive() {
        return Err(Error::Disconnected);
    }

    session
        .transport()
        .subscribe(session.notify_characteristic())
        .await
        .map_err(|e| {
            let err = Error::SubscribeFailed(e.to_string());
            warn!(session_id = session.id(), error = %e, "Subscribe failed");
            session.invalidate(err.to_string());
            err
        })
}

async fn next_status(
    session: &Session,
    notifications: &mut NotificationStream,
    wait: Duration,
) -> Result<ActuatorState> {
    let result = tokio::select! {
        biased;
        _ = session.closed() => Err(Error::Disconnected),
        next = timeout(wait, notifications.next()) => match next {
            Ok(Some(payload)) => {
                debug!(session_id = session.id(), "Read data {:?}", payload);
                decode_status(&payload)
            }
            Ok(None) => Err(Error::Disconnected),
            Err(_) => Err(Error::NotifyTimeout(wait.as_millis() as u64)),
        },
    };

    if let Err(e) = &result {
        if e.invalidates_session() {
            session.invalidate(e.to_string());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        assert_eq!(&encode_command(ActuatorState::On), b"!S1");
        assert_eq!(&encode_command(ActuatorState::Off), b"!S0");
        assert_eq!(&encode_command_str(" ON ").unwrap(), b"!S1");
    }

    #[test]
    fn test_encode_invalid_state() {
        let err = encode_command_str("maybe").unwrap_err();
        assert!(matches!(err, Error::InvalidState(ref s) if s == "maybe"));
    }

    #[test]
    fn test_decode_reads_offset_two() {
        assert_eq!(decode_status(b"!S1").unwrap(), ActuatorState::On);
        assert_eq!(decode_status(b"!S0").unwrap(), ActuatorState::Off);
        // Only the third byte matters
        assert_eq!(decode_status(b"xx1trailing").unwrap(), ActuatorState::On);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(decode_status(b"!S5"), Err(Error::DecodeFailed(_))));
        assert!(matches!(decode_status(b"!Sx"), Err(Error::DecodeFailed(_))));
        assert!(matches!(decode_status(b"!S"), Err(Error::DecodeFailed(_))));
        assert!(matches!(decode_status(&[]), Err(Error::DecodeFailed(_))));
    }

    #[test]
    fn test_status_frame_decodes() {
        for state in [ActuatorState::On, ActuatorState::Off] {
            assert_eq!(decode_status(&status_frame(state)).unwrap(), state);
        }
    }
}
