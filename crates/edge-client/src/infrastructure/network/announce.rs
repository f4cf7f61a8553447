//! UDP announcement scanner.
//!
//! Devices on the LAN periodically broadcast a small JSON datagram on the
//! discovery port:
//!
//! ```json
//! {"product_id":"pr-abc","device_id":"de-123","password":"open","name":"Porch","port":4433}
//! ```
//!
//! `password` and `name` are optional.  The scanner turns each valid datagram
//! into a [`DiscoveredDevice`] whose address is the datagram's *source IP*
//! combined with the advertised `port`, so devices never need to know their
//! own address.
//!
//! The socket is bound lazily on the first cycle and dropped after a receive
//! error, so the next cycle rebinds.  This is how the scanner recovers from
//! interfaces going away.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::{DeviceKey, DiscoveredDevice};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::discovery::{DeviceScanner, ScanError};

/// Large enough for any announcement; longer datagrams are truncated and fail to parse.
const MAX_DATAGRAM: usize = 2048;

/// Wire format of one announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub product_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port the device accepts connections on.
    pub port: u16,
}

impl Announcement {
    /// Builds the discovered device as seen from `source`.  Returns `None` for
    /// announcements whose identifiers do not form a well-formed key.
    pub fn into_device(self, source: SocketAddr) -> Option<DiscoveredDevice> {
        let key = DeviceKey::new(self.product_id, self.device_id);
        if !key.is_well_formed() {
            debug!("ignoring announcement from {source} with unusable key {key:?}");
            return None;
        }
        Some(DiscoveredDevice {
            key,
            password: self.password.filter(|p| !p.is_empty()),
            name: self.name.filter(|n| !n.is_empty()),
            address: SocketAddr::new(source.ip(), self.port),
        })
    }
}

/// Parses one datagram received from `source`.
pub fn parse_announcement(datagram: &[u8], source: SocketAddr) -> Option<DiscoveredDevice> {
    match serde_json::from_slice::<Announcement>(datagram) {
        Ok(announcement) => announcement.into_device(source),
        Err(e) => {
            debug!("ignoring malformed announcement from {source}: {e}");
            None
        }
    }
}

/// [`DeviceScanner`] listening for UDP announcements.
pub struct UdpAnnouncementScanner {
    bind_addr: SocketAddr,
    window: Duration,
    socket: Mutex<Option<UdpSocket>>,
}

impl UdpAnnouncementScanner {
    /// `window` is how long one scan cycle listens.
    pub fn new(bind_addr: SocketAddr, window: Duration) -> Self {
        Self {
            bind_addr,
            window,
            socket: Mutex::new(None),
        }
    }

    /// Binds the socket now instead of on the first cycle and returns the
    /// bound address.
    ///
    /// # Errors
    ///
    /// [`ScanError::BindFailed`] if the address is unavailable.
    pub async fn bind(&self) -> Result<SocketAddr, ScanError> {
        let mut slot = self.socket.lock().await;
        let socket = ensure_bound(&mut slot, self.bind_addr).await?;
        socket.local_addr().map_err(ScanError::Recv)
    }
}

#[async_trait]
impl DeviceScanner for UdpAnnouncementScanner {
    async fn scan(&self) -> Result<Vec<DiscoveredDevice>, ScanError> {
        let mut slot = self.socket.lock().await;
        let socket = ensure_bound(&mut slot, self.bind_addr).await?;

        let deadline = tokio::time::Instant::now() + self.window;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut heard = Vec::new();
        let failure = loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_window_over) => break None,
                Ok(Ok((len, source))) => {
                    if let Some(device) = parse_announcement(&buf[..len], source) {
                        heard.push(device);
                    }
                }
                Ok(Err(e)) => break Some(e),
            }
        };

        if let Some(e) = failure {
            *slot = None;
            return Err(ScanError::Recv(e));
        }
        Ok(heard)
    }
}

async fn ensure_bound(
    slot: &mut Option<UdpSocket>,
    addr: SocketAddr,
) -> Result<&UdpSocket, ScanError> {
    let socket = match slot.take() {
        Some(socket) => socket,
        None => {
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| ScanError::BindFailed { addr, source })?;
            info!("listening for device announcements on UDP {addr}");
            socket
        }
    };
    Ok(slot.insert(socket))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
