//! TOML file implementation of [`SnapshotStore`].
//!
//! Each durable store (registry, bookmarks, client key) lives in its own
//! file under the data directory.  Saves go to a sibling temporary file that
//! is then renamed over the target, so a crash or a full disk leaves the
//! previous snapshot intact.

use std::marker::PhantomData;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::application::persistence::{SnapshotStore, StorageError};

/// One snapshot of `T` stored as a TOML file.
pub struct TomlFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TomlFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            location: self.location(),
            source,
        }
    }
}

impl<T> SnapshotStore<T> for TomlFileStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Option<T>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                location: self.location(),
                reason: e.to_string(),
            })
    }

    fn save(&self, snapshot: &T) -> Result<(), StorageError> {
        let content =
            toml::to_string_pretty(snapshot).map_err(|e| StorageError::Encode(e.to_string()))?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(self.io_error(e));
        }
        debug!(path = %self.path.display(), "snapshot saved");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
