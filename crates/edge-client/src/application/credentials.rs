//! CredentialStore: the client's long-lived private key.
//!
//! Devices authenticate the client by this key during pairing and on every
//! later connection.  Regenerating it ([`CredentialStore::reset`]) therefore
//! invalidates every live session: the reset releases all handles held by the
//! [`SessionManager`] as part of the same operation.
//!
//! Reset is all-or-nothing.  The new key is generated and persisted first; if
//! either step fails the old key stays in place and no session is touched.

use std::fmt;
use std::sync::{Arc, RwLock};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::persistence::{unix_now, MemoryStore, SnapshotStore, StorageError};
use super::session_manager::SessionManager;
use super::transport::ClientIdentity;

/// Domain-separation context for deriving the public fingerprint.
const FINGERPRINT_CONTEXT: &str = "edge-link 2024 client key fingerprint v1";

const KEY_LEN: usize = 32;

/// Error type for credential operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The OS random source failed.
    #[error("could not generate key material: {0}")]
    KeyGeneration(String),
    /// The stored key is not valid key material.
    #[error("stored client key is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// On-disk layout of the key file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientKeyFile {
    /// Hex-encoded 32-byte secret.
    pub private_key: String,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

impl fmt::Debug for ClientKeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeyFile")
            .field("private_key", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Source of fresh key material.
type KeySource = fn(&mut [u8; KEY_LEN]) -> Result<(), CredentialError>;

struct ClientKey {
    secret: [u8; KEY_LEN],
    fingerprint: String,
}

impl ClientKey {
    fn from_secret(secret: [u8; KEY_LEN]) -> Self {
        let derived = blake3::derive_key(FINGERPRINT_CONTEXT, &secret);
        Self {
            secret,
            fingerprint: hex::encode(&derived[..16]),
        }
    }

    fn from_file(file: &ClientKeyFile) -> Result<Self, CredentialError> {
        let bytes =
            hex::decode(&file.private_key).map_err(|e| CredentialError::Corrupt(e.to_string()))?;
        let secret: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| CredentialError::Corrupt(format!("expected {KEY_LEN} bytes, found {}", b.len())))?;
        Ok(Self::from_secret(secret))
    }

    fn to_file(&self, created_at: u64) -> ClientKeyFile {
        ClientKeyFile {
            private_key: hex::encode(self.secret),
            created_at,
        }
    }
}

/// Owner of the client's private key.
pub struct CredentialStore {
    key: RwLock<ClientKey>,
    display_name: RwLock<String>,
    store: Arc<dyn SnapshotStore<ClientKeyFile>>,
    key_source: KeySource,
}

impl CredentialStore {
    /// Loads the key from `store`, generating and saving one on first run.
    ///
    /// # Errors
    ///
    /// [`CredentialError`] if the stored key is unreadable or a new key cannot
    /// be generated or saved.
    pub fn open(
        store: Arc<dyn SnapshotStore<ClientKeyFile>>,
        display_name: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        Self::open_with_source(store, display_name.into(), os_random)
    }

    /// Creates a store with a fresh key that is never written to disk.
    ///
    /// # Errors
    ///
    /// [`CredentialError::KeyGeneration`] if the OS random source fails.
    pub fn ephemeral(display_name: impl Into<String>) -> Result<Self, CredentialError> {
        Self::open(Arc::new(MemoryStore::new()), display_name)
    }

    fn open_with_source(
        store: Arc<dyn SnapshotStore<ClientKeyFile>>,
        display_name: String,
        key_source: KeySource,
    ) -> Result<Self, CredentialError> {
        let key = match store.load()? {
            Some(file) => ClientKey::from_file(&file)?,
            None => {
                let key = generate(key_source)?;
                store.save(&key.to_file(unix_now()))?;
                info!("generated new client key {}", key.fingerprint);
                key
            }
        };
        Ok(Self {
            key: RwLock::new(key),
            display_name: RwLock::new(display_name),
            store,
            key_source,
        })
    }

    /// The identity presented to devices.
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            fingerprint: self.fingerprint(),
            display_name: self.display_name.read().expect("lock poisoned").clone(),
        }
    }

    /// Hex fingerprint of the current key.
    pub fn fingerprint(&self) -> String {
        self.key.read().expect("lock poisoned").fingerprint.clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        *self.display_name.write().expect("lock poisoned") = name.into();
    }

    /// Diagnostics line: crate version and key fingerprint.
    pub fn version(&self) -> String {
        format!(
            "edge-link {} (client key {})",
            env!("CARGO_PKG_VERSION"),
            self.fingerprint()
        )
    }

    /// Regenerates the private key and force-closes every session that was
    /// authenticated with the old one.
    ///
    /// Registry rows are kept.  A device that no longer accepts its stored
    /// token reports `ConnectionError::Rejected` on the next `acquire`.
    ///
    /// # Errors
    ///
    /// [`CredentialError`] if the new key cannot be generated or saved.  The
    /// old key and all sessions are then left untouched.
    pub async fn reset(&self, sessions: &SessionManager) -> Result<ClientIdentity, CredentialError> {
        let key = generate(self.key_source)?;
        if let Err(e) = self.store.save(&key.to_file(unix_now())) {
            warn!("client key reset aborted, keeping the current key: {e}");
            return Err(e.into());
        }

        let old = std::mem::replace(&mut *self.key.write().expect("lock poisoned"), key);
        let released = sessions.release_all().await;
        info!(
            "client key reset: {} -> {}, released {released} handle(s)",
            old.fingerprint,
            self.fingerprint()
        );
        Ok(self.identity())
    }
}

fn generate(source: KeySource) -> Result<ClientKey, CredentialError> {
    let mut secret = [0u8; KEY_LEN];
    source(&mut secret)?;
    Ok(ClientKey::from_secret(secret))
}

fn os_random(buf: &mut [u8; KEY_LEN]) -> Result<(), CredentialError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CredentialError::KeyGeneration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::persistence::test_support::FlakyStore;

    fn failing_source(_: &mut [u8; KEY_LEN]) -> Result<(), CredentialError> {
        Err(CredentialError::KeyGeneration("entropy unavailable".to_string()))
    }

    #[test]
    fn test_open_generates_and_persists_key_on_first_run() {
        // Arrange
        let store = Arc::new(MemoryStore::<ClientKeyFile>::new());

        // Act
        let creds = CredentialStore::open(store.clone(), "phone").unwrap();

        // Assert
        let file = store.load().unwrap().expect("key must be saved");
        assert_eq!(file.private_key.len(), KEY_LEN * 2);
        assert_eq!(creds.identity().display_name, "phone");
    }

    #[test]
    fn test_reopen_keeps_the_same_fingerprint() {
        let store = Arc::new(MemoryStore::<ClientKeyFile>::new());
        let first = CredentialStore::open(store.clone(), "phone").unwrap();

        let second = CredentialStore::open(store, "phone").unwrap();

        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_open_rejects_truncated_key() {
        let store = Arc::new(MemoryStore::<ClientKeyFile>::new());
        store
            .save(&ClientKeyFile {
                private_key: "abcd".to_string(),
                created_at: 0,
            })
            .unwrap();

        let result = CredentialStore::open(store, "phone");

        assert!(matches!(result, Err(CredentialError::Corrupt(_))));
    }

    #[test]
    fn test_open_fails_when_key_generation_fails() {
        let store = Arc::new(MemoryStore::<ClientKeyFile>::new());
        let result = CredentialStore::open_with_source(store, "phone".to_string(), failing_source);
        assert!(matches!(result, Err(CredentialError::KeyGeneration(_))));
    }

    #[test]
    fn test_fingerprint_is_hex_and_differs_between_keys() {
        let a = CredentialStore::ephemeral("a").unwrap();
        let b = CredentialStore::ephemeral("b").unwrap();
        assert_eq!(a.fingerprint().len(), 32);
        assert!(a.fingerprint().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_version_mentions_crate_version_and_fingerprint() {
        let creds = CredentialStore::ephemeral("phone").unwrap();
        let version = creds.version();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
        assert!(version.contains(&creds.fingerprint()));
    }

    #[test]
    fn test_debug_output_redacts_private_key() {
        let file = ClientKeyFile {
            private_key: "deadbeef".to_string(),
            created_at: 1,
        };
        assert!(!format!("{file:?}").contains("deadbeef"));
    }

    #[test]
    fn test_set_display_name_changes_identity() {
        let creds = CredentialStore::ephemeral("phone").unwrap();
        creds.set_display_name("tablet");
        assert_eq!(creds.identity().display_name, "tablet");
    }

    #[tokio::test]
    async fn test_reset_with_failing_save_keeps_old_key() {
        // Arrange
        let store = Arc::new(FlakyStore::<ClientKeyFile>::new());
        let creds = CredentialStore::open(store.clone(), "phone").unwrap();
        let before = creds.fingerprint();
        let sessions = SessionManager::detached_for_tests();
        store.set_failing(true);

        // Act
        let result = creds.reset(&sessions).await;

        // Assert
        assert!(matches!(result, Err(CredentialError::Storage(_))));
        assert_eq!(creds.fingerprint(), before);
    }

    #[tokio::test]
    async fn test_reset_with_failing_key_source_keeps_old_key() {
        let store = Arc::new(MemoryStore::<ClientKeyFile>::new());
        let mut creds = CredentialStore::open(store, "phone").unwrap();
        let before = creds.fingerprint();
        creds.key_source = failing_source;
        let sessions = SessionManager::detached_for_tests();

        let result = creds.reset(&sessions).await;

        assert!(matches!(result, Err(CredentialError::KeyGeneration(_))));
        assert_eq!(creds.fingerprint(), before);
    }

    #[tokio::test]
    async fn test_reset_replaces_key_and_persists_it() {
        let store = Arc::new(MemoryStore::<ClientKeyFile>::new());
        let creds = CredentialStore::open(store.clone(), "phone").unwrap();
        let before = creds.fingerprint();
        let sessions = SessionManager::detached_for_tests();

        let identity = creds.reset(&sessions).await.unwrap();

        assert_ne!(identity.fingerprint, before);
        let reopened = CredentialStore::open(store, "phone").unwrap();
        assert_eq!(reopened.fingerprint(), identity.fingerprint);
    }
}
