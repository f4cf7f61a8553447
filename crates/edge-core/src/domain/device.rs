//! Device identity and the records built around it.
//!
//! Every device in the system is identified by a [`DeviceKey`]: the pair of a
//! product identifier (the device family) and a device identifier (unique
//! within that product).  The same key links the three views of a device:
//!
//! ```text
//! DiscoveredDevice  ──pair──►  PairedDeviceRecord  ◄──refers──  BookmarkEntry
//!   (transient)                  (durable)                      (durable)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing a [`DeviceKey`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceKeyError {
    /// The text is not of the form `productId/deviceId`.
    #[error("device key must look like <productId>/<deviceId>, got {0:?}")]
    Malformed(String),
}

/// Globally unique identity of a device: `(productId, deviceId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Device-family identifier.
    pub product_id: String,
    /// Identifier unique within the product.
    pub device_id: String,
}

impl DeviceKey {
    /// Builds a key without validating it.
    ///
    /// Only [well-formed](DeviceKey::is_well_formed) keys survive the text
    /// forms (`Display`/`FromStr` and navigation routes).  Check keys built
    /// from network input before using them.
    pub fn new(product_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            device_id: device_id.into(),
        }
    }

    /// `true` if both ids are non-empty and free of the route separators
    /// `/`, `?` and `&`.
    pub fn is_well_formed(&self) -> bool {
        [&self.product_id, &self.device_id]
            .iter()
            .all(|id| !id.is_empty() && !id.contains(|c: char| matches!(c, '/' | '?' | '&')))
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product_id, self.device_id)
    }
}

impl FromStr for DeviceKey {
    type Err = DeviceKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_once('/')
            .map(|(product, device)| Self::new(product, device))
            .filter(DeviceKey::is_well_formed)
            .ok_or_else(|| DeviceKeyError::Malformed(s.to_string()))
    }
}

/// A device observed on the local network during the most recent scan cycles.
///
/// Not persisted.  Two observations with the same [`DeviceKey`] describe the
/// same device; the newer one wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub key: DeviceKey,
    /// Shared pairing secret, if the device advertises one.
    pub password: Option<String>,
    /// Friendly name, if the device advertises one.
    pub name: Option<String>,
    /// Where the device accepts connections.
    pub address: SocketAddr,
}

/// A device this client has completed pairing with.
///
/// Only the pairing engine creates these.  The `sct` is the scope-limited
/// token the device issued during the handshake; the bootstrap password is
/// never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDeviceRecord {
    pub product_id: String,
    pub device_id: String,
    pub display_name: String,
    pub sct: String,
    /// Seconds since the Unix epoch.
    pub paired_at: u64,
}

impl PairedDeviceRecord {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.product_id, &self.device_id)
    }

    /// Returns `true` if this record is stored under `key`.
    ///
    /// Compares in place so hot paths avoid building a [`DeviceKey`].
    pub fn has_key(&self, key: &DeviceKey) -> bool {
        self.product_id == key.product_id && self.device_id == key.device_id
    }
}

/// A user-curated shortcut to a paired device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkEntry {
    pub product_id: String,
    pub device_id: String,
    /// Seconds since the Unix epoch.
    pub added_at: u64,
}

impl BookmarkEntry {
    pub fn new(key: &DeviceKey, added_at: u64) -> Self {
        Self {
            product_id: key.product_id.clone(),
            device_id: key.device_id.clone(),
            added_at,
        }
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.product_id, &self.device_id)
    }
}
