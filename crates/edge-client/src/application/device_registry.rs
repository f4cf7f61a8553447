//! DeviceRegistry: durable record of every device this client has paired with.
//!
//! Rows are keyed by `(productId, deviceId)` and are unique on that key.  The
//! registry keeps all rows in memory for cheap lookups and writes a complete
//! snapshot through its [`SnapshotStore`] on every change.
//!
//! # Write-or-nothing
//!
//! Each mutation first builds the next snapshot, saves it, and only then
//! updates the in-memory map.  If the save fails the registry is unchanged,
//! so a failed pairing never leaves a half-written row behind.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use edge_core::{DeviceKey, PairedDeviceRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::persistence::{MemoryStore, SnapshotStore, StorageError};

/// Error type for registry mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A row with the same key already exists.
    #[error("device {0} is already paired")]
    Duplicate(DeviceKey),
    /// The snapshot could not be persisted; the registry is unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// On-disk layout of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub devices: Vec<PairedDeviceRecord>,
}

/// Durable key-value store of paired devices.
pub struct DeviceRegistry {
    rows: RwLock<HashMap<DeviceKey, PairedDeviceRecord>>,
    store: Arc<dyn SnapshotStore<RegistryFile>>,
}

impl DeviceRegistry {
    /// Loads the registry from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the stored snapshot cannot be read.
    pub fn open(store: Arc<dyn SnapshotStore<RegistryFile>>) -> Result<Self, StorageError> {
        let file = store.load()?.unwrap_or_default();
        let mut rows = HashMap::with_capacity(file.devices.len());
        for record in file.devices {
            let key = record.key();
            if rows.contains_key(&key) {
                warn!("registry snapshot holds {key} twice; keeping the first row");
                continue;
            }
            rows.insert(key, record);
        }
        debug!("device registry loaded with {} row(s)", rows.len());
        Ok(Self {
            rows: RwLock::new(rows),
            store,
        })
    }

    /// Creates an empty registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Returns `true` if `key` has been paired.  Does not clone the record.
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.rows.read().expect("lock poisoned").contains_key(key)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<PairedDeviceRecord> {
        self.rows.read().expect("lock poisoned").get(key).cloned()
    }

    /// Returns every row, ordered by key.
    pub fn list(&self) -> Vec<PairedDeviceRecord> {
        let rows = self.rows.read().expect("lock poisoned");
        sorted_rows(rows.values())
    }

    pub fn len(&self) -> usize {
        self.rows.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a new row.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] if the key is already present, or
    /// [`RegistryError::Storage`] if the snapshot could not be saved.  In both
    /// cases the registry is unchanged.
    pub fn insert(&self, record: PairedDeviceRecord) -> Result<(), RegistryError> {
        let key = record.key();
        let mut rows = self.rows.write().expect("lock poisoned");
        if rows.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }

        let mut next = sorted_rows(rows.values());
        next.push(record.clone());
        self.store.save(&RegistryFile { devices: next })?;

        rows.insert(key.clone(), record);
        debug!("registry: stored pairing for {key}");
        Ok(())
    }

    /// Deletes the row for `key`, returning it if it existed.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Storage`] if the snapshot could not be saved.
    pub fn remove(&self, key: &DeviceKey) -> Result<Option<PairedDeviceRecord>, RegistryError> {
        let mut rows = self.rows.write().expect("lock poisoned");
        if !rows.contains_key(key) {
            return Ok(None);
        }

        let next = sorted_rows(rows.values().filter(|r| !r.has_key(key)));
        self.store.save(&RegistryFile { devices: next })?;

        let removed = rows.remove(key);
        debug!("registry: removed {key}");
        Ok(removed)
    }

    /// Deletes every row and returns how many were removed.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Storage`] if the empty snapshot could not be saved.
    pub fn clear(&self) -> Result<usize, RegistryError> {
        let mut rows = self.rows.write().expect("lock poisoned");
        self.store.save(&RegistryFile::default())?;
        let removed = rows.len();
        rows.clear();
        Ok(removed)
    }
}

fn sorted_rows<'a>(rows: impl Iterator<Item = &'a PairedDeviceRecord>) -> Vec<PairedDeviceRecord> {
    let mut out: Vec<PairedDeviceRecord> = rows.cloned().collect();
    out.sort_by(|a, b| {
        (a.product_id.as_str(), a.device_id.as_str())
            .cmp(&(b.product_id.as_str(), b.device_id.as_str()))
    });
    out
}
