//! Seams to the secure-tunnel SDK.
//!
//! The real handshake and tunnel are provided by an external client library.
//! The application layer only sees the traits below; the infrastructure layer
//! supplies implementations (a TCP reference transport for the binary, a
//! scripted transport for tests).
//!
//! Nothing outside [`SessionManager`](super::session_manager::SessionManager)
//! may call [`SessionTransport::open`]: the manager is the sole owner of every
//! [`TransportSession`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use edge_core::{DeviceKey, DiscoveredDevice};
use thiserror::Error;

/// Low-level failure reported by a transport implementation.
///
/// Never leaves the core as-is: the pairing engine and the session manager
/// map it into `PairingError` / `ConnectionError`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No route to the device, connection refused, or address unknown.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The device refused the credential that was presented.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The device answered with an unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The session is already closed.
    #[error("connection closed")]
    Closed,
}

/// The client's public identity as presented to devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Hex fingerprint of the client's long-lived key.
    pub fingerprint: String,
    /// Human-readable name shown on the device side.
    pub display_name: String,
}

/// Bootstrap secret used for a single pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingCredential {
    /// Shared password advertised by the device (single use, never stored).
    Password(String),
    /// Out-of-band session-config-token.
    Sct(String),
}

/// Everything the handshake needs to reach and authenticate to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTarget {
    pub key: DeviceKey,
    pub address: SocketAddr,
    pub credential: PairingCredential,
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOutcome {
    /// Scope-limited token issued by the device for later connections.
    pub sct: String,
    /// Name the device reports for itself, if any.
    pub device_name: Option<String>,
}

/// Parameters for opening a session to an already paired device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub key: DeviceKey,
    pub sct: String,
}

/// Executes the pairing handshake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PairingTransport: Send + Sync {
    /// Opens a transient connection, exchanges long-lived credentials, and
    /// returns the token the device issued.
    async fn pair(
        &self,
        target: &PairingTarget,
        identity: &ClientIdentity,
    ) -> Result<PairingOutcome, TransportError>;
}

/// Opens secure sessions to paired devices.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn open(
        &self,
        target: &SessionTarget,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// One live secure session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Sends one control message over the session.
    async fn send(&self, body: &str) -> Result<(), TransportError>;

    /// Resolves once the underlying link has dropped or been closed.
    async fn closed(&self);

    /// Shuts the session down.  Calling it twice is harmless.
    async fn close(&self);
}

/// Looks up where a device can currently be reached.
///
/// Implemented by the discovery service; used for manual pairing entries
/// without an address and by transports that connect by key.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, key: &DeviceKey) -> Option<DiscoveredDevice>;
}
