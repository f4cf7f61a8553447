//! DeviceOverview: one merged view of every device the client knows about.
//!
//! Combines the durable stores with the live state of the discovery snapshot
//! and the session manager so a front end can render a single list:
//!
//! ```text
//! Discovered  ── nearby, not paired yet (pairing candidate)
//! Offline     ── paired, not heard from in the silence window
//! Online      ── paired and currently announcing itself
//! Connected   ── a connection handle is opening or open
//! ```
//!
//! The overview is a snapshot.  Build a new one whenever any input changes.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use edge_core::{DeviceKey, DiscoveredDevice};
use serde::Serialize;

use super::bookmarks::BookmarksStore;
use super::device_registry::DeviceRegistry;
use super::persistence::StorageError;
use super::session_manager::{HandleState, SessionManager};

/// Where a device stands from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Seen on the network; no pairing yet.
    Discovered,
    /// Paired but not currently announcing.
    Offline,
    /// Paired and announcing.
    Online,
    /// Paired with a live connection handle.
    Connected,
}

/// One row of the overview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub key: DeviceKey,
    pub name: String,
    pub presence: Presence,
    pub bookmarked: bool,
    /// Last announced address, if the device is in the discovery snapshot.
    pub address: Option<SocketAddr>,
    pub connection: HandleState,
}

impl DeviceStatus {
    pub fn is_paired(&self) -> bool {
        self.presence != Presence::Discovered
    }
}

/// Snapshot of all known devices, ordered by key.
#[derive(Debug, Default)]
pub struct DeviceOverview {
    rows: BTreeMap<DeviceKey, DeviceStatus>,
}

impl DeviceOverview {
    /// Merges the registry, bookmarks, a discovery snapshot, and session state.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if a released bookmarks view cannot be reloaded.
    pub fn build(
        registry: &DeviceRegistry,
        bookmarks: &BookmarksStore,
        discovered: &[DiscoveredDevice],
        sessions: &SessionManager,
    ) -> Result<Self, StorageError> {
        let mut rows = BTreeMap::new();

        for record in registry.list() {
            let key = record.key();
            let connection = sessions.state_of(&key);
            let presence = if matches!(connection, HandleState::Opening | HandleState::Open) {
                Presence::Connected
            } else {
                Presence::Offline
            };
            rows.insert(
                key.clone(),
                DeviceStatus {
                    key,
                    name: record.display_name,
                    presence,
                    bookmarked: false,
                    address: None,
                    connection,
                },
            );
        }

        for device in discovered {
            match rows.get_mut(&device.key) {
                Some(row) => {
                    row.address = Some(device.address);
                    if row.presence == Presence::Offline {
                        row.presence = Presence::Online;
                    }
                }
                None => {
                    rows.insert(
                        device.key.clone(),
                        DeviceStatus {
                            key: device.key.clone(),
                            name: device.name.clone().unwrap_or_else(|| device.key.to_string()),
                            presence: Presence::Discovered,
                            bookmarked: false,
                            address: Some(device.address),
                            connection: HandleState::Closed,
                        },
                    );
                }
            }
        }

        for entry in bookmarks.list()? {
            if let Some(row) = rows.get_mut(&entry.key()) {
                row.bookmarked = true;
            }
        }

        Ok(Self { rows })
    }

    /// Returns every row, ordered by key.
    pub fn all(&self) -> Vec<DeviceStatus> {
        self.rows.values().cloned().collect()
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&DeviceStatus> {
        self.rows.get(key)
    }

    /// Nearby devices that are not paired yet.
    pub fn pairing_candidates(&self) -> Vec<DeviceStatus> {
        self.rows
            .values()
            .filter(|row| !row.is_paired())
            .cloned()
            .collect()
    }

    pub fn bookmarked(&self) -> Vec<DeviceStatus> {
        self.rows
            .values()
            .filter(|row| row.bookmarked)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
