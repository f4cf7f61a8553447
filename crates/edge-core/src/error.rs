//! Typed errors surfaced to the invoking context.
//!
//! Background failures (discovery) never reach these types; they are logged
//! and retried where they happen.  User-initiated operations (pairing,
//! acquiring a session) return one of the enums below so the caller can give
//! precise feedback and decide whether to retry.

use thiserror::Error;

use crate::domain::device::DeviceKey;

/// Outcome of a pairing attempt that did not produce a new record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PairingError {
    /// The registry already holds a record for this key.  Not a failure from
    /// the user's point of view: navigate to the device instead of retrying.
    #[error("device {0} is already paired")]
    AlreadyPaired(DeviceKey),
    /// The device could not be reached or its address could not be resolved.
    #[error("device {key} is unreachable: {reason}")]
    Unreachable { key: DeviceKey, reason: String },
    /// The device rejected the password or token.
    #[error("device {key} rejected the pairing credential: {reason}")]
    InvalidCredential { key: DeviceKey, reason: String },
    /// The device answered with something the handshake did not expect.
    #[error("pairing protocol error with {key}: {reason}")]
    ProtocolError { key: DeviceKey, reason: String },
    /// The handshake did not finish within the pairing timeout.
    #[error("pairing with {0} timed out")]
    Timeout(DeviceKey),
    /// Neither a password nor a session-config-token was supplied.
    #[error("pairing {0} needs a password or a session-config-token")]
    MissingCredential(DeviceKey),
    /// The invoking context cancelled the attempt.
    #[error("pairing with {0} was cancelled")]
    Cancelled(DeviceKey),
    /// The handshake succeeded but the registry could not be written.
    #[error("could not store pairing for {key}: {reason}")]
    Storage { key: DeviceKey, reason: String },
}

impl PairingError {
    /// Returns `true` for the one variant that is not a failure for the user.
    pub fn is_already_paired(&self) -> bool {
        matches!(self, Self::AlreadyPaired(_))
    }
}

/// Failure to obtain or use a connection handle.
///
/// `Clone` because a failed open is delivered to every concurrent waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// No pairing exists for the key, so no handle may be created.
    #[error("device {0} is not paired")]
    NotPaired(DeviceKey),
    /// The underlying connection could not be established.
    #[error("device {key} is unreachable: {reason}")]
    Unreachable { key: DeviceKey, reason: String },
    /// The device refused the stored session-config-token.
    #[error("device {key} rejected the session credentials: {reason}")]
    Rejected { key: DeviceKey, reason: String },
    /// The handle was released, force-closed, or its connection dropped.
    #[error("connection handle for {0} is no longer valid")]
    HandleInvalidated(DeviceKey),
    /// Connection establishment did not finish within the connect timeout.
    #[error("connecting to {0} timed out")]
    Timeout(DeviceKey),
    /// The invoking context stopped waiting.
    #[error("acquiring {0} was cancelled")]
    Cancelled(DeviceKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_already_paired_is_flagged_as_already_paired() {
        let key = DeviceKey::new("p", "d");
        assert!(PairingError::AlreadyPaired(key.clone()).is_already_paired());
        assert!(!PairingError::Timeout(key).is_already_paired());
    }

    #[test]
    fn test_connection_error_message_names_the_device() {
        let err = ConnectionError::HandleInvalidated(DeviceKey::new("p1", "d1"));
        assert_eq!(err.to_string(), "connection handle for p1/d1 is no longer valid");
    }
}
