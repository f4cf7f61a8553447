//! Persistence port for the durable stores.
//!
//! The registry, bookmarks, and credential stores keep their state in memory
//! and write a complete snapshot through a [`SnapshotStore`] after every
//! change.  The infrastructure layer provides a TOML file implementation;
//! [`MemoryStore`] backs tests and ephemeral runs.

use std::sync::Mutex;

use thiserror::Error;

/// Error type for snapshot persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing medium could not be read or written.
    #[error("storage I/O error at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    /// The stored content could not be decoded.
    #[error("stored data at {location} is corrupt: {reason}")]
    Corrupt { location: String, reason: String },
    /// The snapshot could not be encoded.
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// Loads and saves one complete snapshot of type `T`.
///
/// `save` must be atomic: after a failed save the previous snapshot is still
/// the one `load` returns.  Both calls may block on file I/O; async callers
/// on a hot path run them through `tokio::task::spawn_blocking`.
pub trait SnapshotStore<T>: Send + Sync {
    /// Returns `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<T>, StorageError>;
    fn save(&self, snapshot: &T) -> Result<(), StorageError>;
}

/// In-memory [`SnapshotStore`].
pub struct MemoryStore<T> {
    slot: Mutex<Option<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> SnapshotStore<T> for MemoryStore<T> {
    fn load(&self) -> Result<Option<T>, StorageError> {
        Ok(self.slot.lock().expect("lock poisoned").clone())
    }

    fn save(&self, snapshot: &T) -> Result<(), StorageError> {
        *self.slot.lock().expect("lock poisoned") = Some(snapshot.clone());
        Ok(())
    }
}

/// Returns the current time as seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A store whose saves can be made to fail on demand.
    pub struct FlakyStore<T> {
        inner: MemoryStore<T>,
        pub fail_saves: AtomicBool,
    }

    impl<T> FlakyStore<T> {
        pub fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_saves: AtomicBool::new(false),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.fail_saves.store(failing, Ordering::SeqCst);
        }
    }

    impl<T: Clone + Send> SnapshotStore<T> for FlakyStore<T> {
        fn load(&self) -> Result<Option<T>, StorageError> {
            self.inner.load()
        }

        fn save(&self, snapshot: &T) -> Result<(), StorageError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StorageError::Io {
                    location: "flaky".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.save(snapshot)
        }
    }
}
