//! BookmarksStore: user-curated shortcuts to paired devices.
//!
//! Bookmarks reference [`DeviceRegistry`] rows by key but have their own
//! lifecycle.  Adding or removing a bookmark never touches the registry, and
//! [`BookmarksStore::release`] only detaches the in-memory view (for example
//! on log-out); the persisted bookmarks are reloaded on next access.

use std::sync::{Arc, Mutex};

use edge_core::{BookmarkEntry, DeviceKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::device_registry::DeviceRegistry;
use super::persistence::{unix_now, MemoryStore, SnapshotStore, StorageError};

/// Error type for bookmark operations.
#[derive(Debug, Error)]
pub enum BookmarkError {
    /// Only paired devices can be bookmarked.
    #[error("device {0} is not paired")]
    NotPaired(DeviceKey),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// On-disk layout of the bookmarks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarksFile {
    #[serde(default)]
    pub bookmarks: Vec<BookmarkEntry>,
}

/// Ordered set of bookmarked device keys.
pub struct BookmarksStore {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn SnapshotStore<BookmarksFile>>,
    /// `None` while released; loaded lazily.
    view: Mutex<Option<Vec<BookmarkEntry>>>,
}

impl BookmarksStore {
    pub fn new(registry: Arc<DeviceRegistry>, store: Arc<dyn SnapshotStore<BookmarksFile>>) -> Self {
        Self {
            registry,
            store,
            view: Mutex::new(None),
        }
    }

    pub fn in_memory(registry: Arc<DeviceRegistry>) -> Self {
        Self::new(registry, Arc::new(MemoryStore::new()))
    }

    /// Returns bookmarks in insertion order, skipping any whose device is no
    /// longer paired.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if a released view cannot be reloaded.
    pub fn list(&self) -> Result<Vec<BookmarkEntry>, StorageError> {
        self.with_view(|view| {
            view.iter()
                .filter(|entry| self.registry.contains(&entry.key()))
                .cloned()
                .collect()
        })
    }

    pub fn contains(&self, key: &DeviceKey) -> Result<bool, StorageError> {
        self.with_view(|view| position(view, key).is_some())
    }

    /// Bookmarks a paired device.  Returns `false` if it was already bookmarked.
    ///
    /// # Errors
    ///
    /// [`BookmarkError::NotPaired`] if the registry has no row for `key`.
    pub fn add(&self, key: &DeviceKey) -> Result<bool, BookmarkError> {
        if !self.registry.contains(key) {
            return Err(BookmarkError::NotPaired(key.clone()));
        }
        let added = self.mutate(|view| {
            if position(view, key).is_some() {
                return false;
            }
            view.push(BookmarkEntry::new(key, unix_now()));
            true
        })?;
        if added {
            debug!("bookmarked {key}");
        }
        Ok(added)
    }

    /// Removes a bookmark.  Returns `false` if there was none.
    pub fn remove(&self, key: &DeviceKey) -> Result<bool, BookmarkError> {
        let removed = self.mutate(|view| match position(view, key) {
            Some(index) => {
                view.remove(index);
                true
            }
            None => false,
        })?;
        Ok(removed)
    }

    /// Removes every bookmark from the persisted set.  Registry rows stay.
    pub fn clear(&self) -> Result<usize, BookmarkError> {
        let removed = self.mutate(|view| {
            let n = view.len();
            view.clear();
            n
        })?;
        Ok(removed)
    }

    /// Detaches the in-memory view without touching disk or the registry.
    pub fn release(&self) {
        *self.view.lock().expect("lock poisoned") = None;
        debug!("bookmarks view released");
    }

    /// Returns `true` while an in-memory view is attached.
    pub fn is_loaded(&self) -> bool {
        self.view.lock().expect("lock poisoned").is_some()
    }

    fn with_view<R>(&self, f: impl FnOnce(&Vec<BookmarkEntry>) -> R) -> Result<R, StorageError> {
        let mut guard = self.view.lock().expect("lock poisoned");
        let view = self.attach(&mut guard)?;
        Ok(f(view))
    }

    /// Applies `f` to a copy of the view, persists the copy, then commits it.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<BookmarkEntry>) -> R) -> Result<R, StorageError> {
        let mut guard = self.view.lock().expect("lock poisoned");
        let mut next = self.attach(&mut guard)?.clone();
        let result = f(&mut next);
        self.store.save(&BookmarksFile {
            bookmarks: next.clone(),
        })?;
        *guard = Some(next);
        Ok(result)
    }

    fn attach<'a>(
        &self,
        slot: &'a mut Option<Vec<BookmarkEntry>>,
    ) -> Result<&'a mut Vec<BookmarkEntry>, StorageError> {
        if slot.is_none() {
            let file = self.store.load()?.unwrap_or_default();
            *slot = Some(file.bookmarks);
        }
        Ok(slot.get_or_insert_with(Vec::new))
    }
}

fn position(view: &[BookmarkEntry], key: &DeviceKey) -> Option<usize> {
    view.iter()
        .position(|e| e.product_id == key.product_id && e.device_id == key.device_id)
}
