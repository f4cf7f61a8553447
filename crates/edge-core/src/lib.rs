//! # edge-core
//!
//! Shared library for Edge Link containing the domain entities and the typed
//! error taxonomy used by the client core.
//!
//! This crate has no dependencies on sockets, files, or an async runtime.
//!
//! # Architecture overview
//!
//! Edge Link mediates secure sessions between a client and IoT edge devices.
//! The client discovers devices on the local network, pairs with them
//! (exchanging long-lived credentials), and later opens shared,
//! reference-counted connections to paired devices.
//!
//! - **`domain`** – `DeviceKey`, `DiscoveredDevice`, `PairedDeviceRecord`,
//!   `BookmarkEntry`, and the pairing route strings.
//! - **`error`** – `PairingError` and `ConnectionError`, the only errors the
//!   core surfaces to its callers.

pub mod domain;
pub mod error;

pub use domain::device::{
    BookmarkEntry, DeviceKey, DeviceKeyError, DiscoveredDevice, PairedDeviceRecord,
};
pub use domain::route::{device_page_route, parse_device_page_route, PairingRoute, RouteError};
pub use error::{ConnectionError, PairingError};
