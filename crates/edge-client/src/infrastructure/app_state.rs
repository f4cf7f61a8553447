//! Application wiring: builds every component once and hands out shared
//! references.
//!
//! [`AppState`] is the composition root of the client.  It owns the durable
//! stores, the discovery service, the session manager, and the pairing
//! engine, and exposes the housekeeping operations that touch several of
//! them at once (`forget`, `reset_database`, `reset_client_key`).
//!
//! # Wiring order (for beginners)
//!
//! ```text
//! AppConfig
//!  └─ data dir ─► TomlFileStore × 3
//!       ├─ DeviceRegistry
//!       │    └─ BookmarksStore
//!       └─ CredentialStore
//!  └─ DiscoveryService (UDP scanner)
//!       └─ TcpTransport (resolves addresses from the discovery snapshot)
//!            ├─ SessionManager
//!            └─ PairingEngine
//! ```
//!
//! Each component receives its collaborators through its constructor; there
//! are no globals.  [`AppState::build_with`] accepts any scanner and
//! transport, which is how the integration tests run the whole client
//! against a scripted device fleet.
//!
//! # Data Transfer Objects
//!
//! The binary prints results as JSON.  [`PairedDeviceDto`] is the printable
//! form of a registry row: it carries everything except the session-config
//! token, which is a secret and never leaves the registry file.

use std::path::Path;
use std::sync::Arc;

use edge_core::{DeviceKey, PairedDeviceRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::application::{
    bookmarks::{BookmarkError, BookmarksFile, BookmarksStore},
    credentials::{ClientKeyFile, CredentialError, CredentialStore},
    device_overview::DeviceOverview,
    device_registry::{DeviceRegistry, RegistryError, RegistryFile},
    pair_device::PairingEngine,
    persistence::{MemoryStore, SnapshotStore, StorageError},
    session_manager::SessionManager,
    transport::{ClientIdentity, PairingTransport, SessionTransport},
};
use crate::infrastructure::{
    network::{
        announce::UdpAnnouncementScanner,
        discovery::{DeviceScanner, DiscoveryService},
    },
    storage::{
        config::{data_dir, AppConfig, ConfigError},
        toml_file::TomlFileStore,
    },
    transport::tcp::TcpTransport,
};

const REGISTRY_FILE: &str = "devices.toml";
const BOOKMARKS_FILE: &str = "bookmarks.toml";
const CLIENT_KEY_FILE: &str = "client_key.toml";

/// Error type for building and maintaining the application state.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bookmark(#[from] BookmarkError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// The three snapshot stores behind the durable components.
pub struct Stores {
    pub registry: Arc<dyn SnapshotStore<RegistryFile>>,
    pub bookmarks: Arc<dyn SnapshotStore<BookmarksFile>>,
    pub client_key: Arc<dyn SnapshotStore<ClientKeyFile>>,
}

impl Stores {
    /// One TOML file per store under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            registry: Arc::new(TomlFileStore::new(dir.join(REGISTRY_FILE))),
            bookmarks: Arc::new(TomlFileStore::new(dir.join(BOOKMARKS_FILE))),
            client_key: Arc::new(TomlFileStore::new(dir.join(CLIENT_KEY_FILE))),
        }
    }

    /// Nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            registry: Arc::new(MemoryStore::new()),
            bookmarks: Arc::new(MemoryStore::new()),
            client_key: Arc::new(MemoryStore::new()),
        }
    }
}

/// Every long-lived component of the client.
pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<DeviceRegistry>,
    pub bookmarks: Arc<BookmarksStore>,
    pub credentials: Arc<CredentialStore>,
    pub discovery: Arc<DiscoveryService>,
    pub sessions: SessionManager,
    pub pairing: PairingEngine,
}

impl AppState {
    /// Builds the production client: TOML files in the data directory, the
    /// UDP announcement scanner, and the TCP transport.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`AppError`] if the data directory cannot be resolved or a stored
    /// snapshot cannot be read.
    pub fn build(config: AppConfig) -> Result<Arc<Self>, AppError> {
        let dir = data_dir(&config)?;
        info!("using data directory {}", dir.display());

        let scanner = Arc::new(UdpAnnouncementScanner::new(
            config.discovery.bind_addr(),
            config.discovery.scan_window(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            scanner,
            config.discovery.to_discovery_config(),
        ));
        let transport = Arc::new(TcpTransport::new(discovery.clone()));

        Self::build_with(
            config,
            Stores::in_dir(&dir),
            discovery,
            transport.clone(),
            transport,
        )
    }

    /// Builds the client from explicit parts.
    ///
    /// # Errors
    ///
    /// [`AppError`] if a stored snapshot cannot be read or the client key
    /// cannot be created.
    pub fn build_with(
        config: AppConfig,
        stores: Stores,
        discovery: Arc<DiscoveryService>,
        pairing_transport: Arc<dyn PairingTransport>,
        session_transport: Arc<dyn SessionTransport>,
    ) -> Result<Arc<Self>, AppError> {
        let registry = Arc::new(DeviceRegistry::open(stores.registry)?);
        let bookmarks = Arc::new(BookmarksStore::new(registry.clone(), stores.bookmarks));
        let credentials = Arc::new(CredentialStore::open(
            stores.client_key,
            config.client.display_name.clone(),
        )?);

        let sessions = SessionManager::new(
            session_transport,
            registry.clone(),
            credentials.clone(),
            config.session.to_session_config(),
        );
        let pairing = PairingEngine::new(
            registry.clone(),
            pairing_transport,
            credentials.clone(),
            config.session.pair_timeout(),
        )
        .with_resolver(discovery.clone());

        Ok(Arc::new(Self {
            config,
            registry,
            bookmarks,
            credentials,
            discovery,
            sessions,
            pairing,
        }))
    }

    /// Convenience for tests: in-memory stores and the given scanner.
    ///
    /// # Errors
    ///
    /// [`AppError::Credentials`] if no key can be generated.
    pub fn in_memory<T>(
        config: AppConfig,
        scanner: Arc<dyn DeviceScanner>,
        transport: Arc<T>,
    ) -> Result<Arc<Self>, AppError>
    where
        T: PairingTransport + SessionTransport + 'static,
    {
        let discovery = Arc::new(DiscoveryService::new(
            scanner,
            config.discovery.to_discovery_config(),
        ));
        Self::build_with(
            config,
            Stores::in_memory(),
            discovery,
            transport.clone(),
            transport,
        )
    }

    /// Merged view of registry, bookmarks, discovery snapshot, and sessions.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if released bookmarks cannot be reloaded.
    pub fn overview(&self) -> Result<DeviceOverview, StorageError> {
        DeviceOverview::build(
            &self.registry,
            &self.bookmarks,
            &self.discovery.snapshot(),
            &self.sessions,
        )
    }

    /// Deletes a paired device and its bookmark.  Returns the removed row.
    ///
    /// Open handles to the device are left to their holders; the device can
    /// no longer be acquired once they are released.
    ///
    /// # Errors
    ///
    /// [`AppError`] if either file cannot be written.
    pub fn forget(&self, key: &DeviceKey) -> Result<Option<PairedDeviceRecord>, AppError> {
        self.bookmarks.remove(key)?;
        let removed = self.registry.remove(key)?;
        match &removed {
            Some(_) => {
                let holders = self.sessions.ref_count(key);
                if holders > 0 {
                    warn!("forgot {key} while {holders} handle(s) are still held");
                }
                info!("forgot {key}");
            }
            None => info!("{key} was not paired; nothing to forget"),
        }
        Ok(removed)
    }

    /// Wipes every bookmark and registry row and closes every connection.
    /// Returns the number of registry rows removed.
    ///
    /// # Errors
    ///
    /// [`AppError`] if a file cannot be written.  Sessions are closed only
    /// after both stores were cleared.
    pub async fn reset_database(&self) -> Result<usize, AppError> {
        let bookmarks = self.bookmarks.clear()?;
        let devices = self.registry.clear()?;
        let released = self.sessions.release_all().await;
        info!(
            "database reset: {devices} device(s), {bookmarks} bookmark(s), {released} handle(s) released"
        );
        Ok(devices)
    }

    /// Regenerates the client key and closes every connection.
    ///
    /// # Errors
    ///
    /// [`AppError::Credentials`] if the new key cannot be saved; the old key
    /// stays in use.
    pub async fn reset_client_key(&self) -> Result<ClientIdentity, AppError> {
        Ok(self.credentials.reset(&self.sessions).await?)
    }

    /// Stops discovery and closes every connection.
    pub async fn shutdown(&self) {
        self.discovery.stop_scanning().await;
        let released = self.sessions.release_all().await;
        info!("shutdown complete, released {released} handle(s)");
    }
}

// ── Data Transfer Objects ─────────────────────────────────────────────────────

/// Printable registry row.  The token is never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDeviceDto {
    pub key: String,
    pub display_name: String,
    pub paired_at: u64,
}

impl From<&PairedDeviceRecord> for PairedDeviceDto {
    fn from(record: &PairedDeviceRecord) -> Self {
        Self {
            key: record.key().to_string(),
            display_name: record.display_name.clone(),
            paired_at: record.paired_at,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
