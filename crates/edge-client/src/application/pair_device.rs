//! PairingEngine: turns a discovered or manually entered device into a
//! durable [`PairedDeviceRecord`].
//!
//! # Flow
//!
//! ```text
//! PairingRequest ──► registry hit? ──yes──► AlreadyPaired (no network call)
//!                        │ no
//!                        ▼
//!               resolve address + credential
//!                        │
//!                        ▼
//!          handshake (bounded by pair timeout, cancellable)
//!                        │ ok
//!                        ▼
//!               registry insert (write-or-nothing)
//! ```
//!
//! The bootstrap password is used for exactly one handshake and never stored.
//! Only the token the device issues (`sct`) ends up in the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edge_core::{DeviceKey, DiscoveredDevice, PairedDeviceRecord, PairingError, PairingRoute};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::bookmarks::BookmarksStore;
use super::credentials::CredentialStore;
use super::device_registry::{DeviceRegistry, RegistryError};
use super::persistence::unix_now;
use super::transport::{
    AddressResolver, PairingCredential, PairingTarget, PairingTransport, TransportError,
};

/// Default bound on one pairing handshake.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// Bootstrap parameters for one pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub key: DeviceKey,
    /// `None` for manual entries; resolved against the discovery snapshot.
    pub address: Option<SocketAddr>,
    pub password: Option<String>,
    pub sct: Option<String>,
    pub display_name: Option<String>,
}

impl PairingRequest {
    /// A manual entry with no address or credential yet.
    pub fn manual(key: DeviceKey) -> Self {
        Self {
            key,
            address: None,
            password: None,
            sct: None,
            display_name: None,
        }
    }

    /// Pairs with a device seen by discovery, using its advertised password.
    pub fn from_discovered(device: &DiscoveredDevice) -> Self {
        Self {
            key: device.key.clone(),
            address: Some(device.address),
            password: device.password.clone(),
            sct: None,
            display_name: device.name.clone(),
        }
    }

    /// Pairs with the parameters carried by a `pair_device/...` route.
    pub fn from_route(route: &PairingRoute) -> Self {
        Self {
            password: route.password.clone(),
            sct: route.sct.clone(),
            ..Self::manual(route.key.clone())
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into()).filter(|p| !p.is_empty());
        self
    }

    pub fn with_sct(mut self, sct: impl Into<String>) -> Self {
        self.sct = Some(sct.into()).filter(|s| !s.is_empty());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into()).filter(|n| !n.is_empty());
        self
    }

    /// The password wins when both are present: it is the bootstrap secret the
    /// device advertised for this pairing.
    fn credential(&self) -> Option<PairingCredential> {
        self.password
            .clone()
            .map(PairingCredential::Password)
            .or_else(|| self.sct.clone().map(PairingCredential::Sct))
    }
}

/// Executes pairing handshakes and records their results.
pub struct PairingEngine {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn PairingTransport>,
    credentials: Arc<CredentialStore>,
    resolver: Option<Arc<dyn AddressResolver>>,
    timeout: Duration,
}

impl PairingEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn PairingTransport>,
        credentials: Arc<CredentialStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            credentials,
            resolver: None,
            timeout,
        }
    }

    /// Lets requests without an address be resolved against `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Pairs with the device described by `request`.
    ///
    /// # Errors
    ///
    /// - [`PairingError::AlreadyPaired`] if the registry already holds the key;
    ///   no network call is made.
    /// - [`PairingError::MissingCredential`] if no password or token is known.
    /// - [`PairingError::Unreachable`], [`PairingError::InvalidCredential`],
    ///   [`PairingError::ProtocolError`] or [`PairingError::Timeout`] if the
    ///   handshake fails.
    /// - [`PairingError::Cancelled`] if `cancel` fires first.
    /// - [`PairingError::Storage`] if the record cannot be saved.
    ///
    /// On every error the registry is left as it was.
    pub async fn pair(
        &self,
        request: PairingRequest,
        cancel: &CancellationToken,
    ) -> Result<PairedDeviceRecord, PairingError> {
        let key = request.key.clone();
        if self.registry.contains(&key) {
            info!("{key} is already paired; skipping handshake");
            return Err(PairingError::AlreadyPaired(key));
        }

        let request = self.complete_from_discovery(request);
        let credential = request
            .credential()
            .ok_or_else(|| PairingError::MissingCredential(key.clone()))?;
        let address = request.address.ok_or_else(|| PairingError::Unreachable {
            key: key.clone(),
            reason: "address unknown; the device has not been seen on the local network"
                .to_string(),
        })?;

        let target = PairingTarget {
            key: key.clone(),
            address,
            credential,
        };
        let identity = self.credentials.identity();
        info!("pairing with {key} at {address}");

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("pairing with {key} cancelled");
                return Err(PairingError::Cancelled(key));
            }
            result = tokio::time::timeout(self.timeout, self.transport.pair(&target, &identity)) => result,
        };
        let outcome = match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let error = map_transport_error(&key, e);
                warn!("pairing with {key} failed: {error}");
                return Err(error);
            }
            Err(_elapsed) => {
                warn!("pairing with {key} timed out after {:?}", self.timeout);
                return Err(PairingError::Timeout(key));
            }
        };
        if outcome.sct.is_empty() {
            return Err(PairingError::ProtocolError {
                key,
                reason: "device issued an empty session-config-token".to_string(),
            });
        }

        let display_name = outcome
            .device_name
            .filter(|name| !name.is_empty())
            .or(request.display_name)
            .unwrap_or_else(|| key.to_string());
        let record = PairedDeviceRecord {
            product_id: key.product_id.clone(),
            device_id: key.device_id.clone(),
            display_name,
            sct: outcome.sct,
            paired_at: unix_now(),
        };

        let registry = Arc::clone(&self.registry);
        let row = record.clone();
        let inserted = match tokio::task::spawn_blocking(move || registry.insert(row)).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!("registry write for {key} did not complete: {e}");
                return Err(PairingError::Storage {
                    key,
                    reason: e.to_string(),
                });
            }
        };
        match inserted {
            Ok(()) => {
                info!("paired with {key} ({})", record.display_name);
                Ok(record)
            }
            Err(RegistryError::Duplicate(key)) => {
                info!("{key} was paired concurrently; keeping the existing record");
                Err(PairingError::AlreadyPaired(key))
            }
            Err(RegistryError::Storage(e)) => {
                warn!("could not store pairing for {key}: {e}");
                Err(PairingError::Storage {
                    key,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Pairs, then bookmarks the new device.
    ///
    /// A bookmark failure is logged and does not undo the pairing.
    ///
    /// # Errors
    ///
    /// Same as [`PairingEngine::pair`].
    pub async fn pair_and_bookmark(
        &self,
        request: PairingRequest,
        bookmarks: &BookmarksStore,
        cancel: &CancellationToken,
    ) -> Result<PairedDeviceRecord, PairingError> {
        let record = self.pair(request, cancel).await?;
        if let Err(e) = bookmarks.add(&record.key()) {
            warn!("paired with {} but could not bookmark it: {e}", record.key());
        }
        Ok(record)
    }

    /// Fills in the address, password and name the device last advertised.
    fn complete_from_discovery(&self, mut request: PairingRequest) -> PairingRequest {
        let Some(seen) = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver.resolve(&request.key))
        else {
            return request;
        };
        if request.address.is_none() {
            request.address = Some(seen.address);
            if request.password.is_none() && request.sct.is_none() {
                request.password = seen.password;
            }
        }
        if request.display_name.is_none() {
            request.display_name = seen.name;
        }
        request
    }
}

fn map_transport_error(key: &DeviceKey, error: TransportError) -> PairingError {
    let key = key.clone();
    match error {
        TransportError::Unreachable(reason) => PairingError::Unreachable { key, reason },
        TransportError::Rejected(reason) => PairingError::InvalidCredential { key, reason },
        TransportError::Protocol(reason) => PairingError::ProtocolError { key, reason },
        TransportError::Closed => PairingError::Unreachable {
            key,
            reason: "connection closed during the handshake".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread::ThreadId;

    use crate::application::device_registry::RegistryFile;
    use crate::application::persistence::test_support::FlakyStore;
    use crate::application::persistence::{MemoryStore, SnapshotStore, StorageError};
    use crate::application::transport::{ClientIdentity, MockPairingTransport, PairingOutcome};
    use async_trait::async_trait;

    fn key() -> DeviceKey {
        DeviceKey::new("pr-1", "de-1")
    }

    fn addr() -> SocketAddr {
        "192.168.1.20:4433".parse().unwrap()
    }

    fn discovered(password: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            key: key(),
            password: password.map(str::to_string),
            name: Some("Porch camera".to_string()),
            address: addr(),
        }
    }

    fn engine(registry: Arc<DeviceRegistry>, transport: impl PairingTransport + 'static) -> PairingEngine {
        PairingEngine::new(
            registry,
            Arc::new(transport),
            Arc::new(CredentialStore::ephemeral("phone").unwrap()),
            DEFAULT_PAIR_TIMEOUT,
        )
    }

    fn accepting(sct: &'static str, name: Option<&'static str>) -> MockPairingTransport {
        let mut transport = MockPairingTransport::new();
        transport.expect_pair().times(1).returning(move |_, _| {
            Ok(PairingOutcome {
                sct: sct.to_string(),
                device_name: name.map(str::to_string),
            })
        });
        transport
    }

    struct FixedResolver(DiscoveredDevice);

    impl AddressResolver for FixedResolver {
        fn resolve(&self, key: &DeviceKey) -> Option<DiscoveredDevice> {
            (self.0.key == *key).then(|| self.0.clone())
        }
    }

    /// Handshake that never answers.
    struct SilentTransport;

    #[async_trait]
    impl PairingTransport for SilentTransport {
        async fn pair(
            &self,
            _target: &PairingTarget,
            _identity: &ClientIdentity,
        ) -> Result<PairingOutcome, TransportError> {
            std::future::pending().await
        }
    }

    /// Remembers which thread performed each save.
    #[derive(Default)]
    struct ThreadRecordingStore {
        inner: MemoryStore<RegistryFile>,
        saved_on: Mutex<Vec<ThreadId>>,
    }

    impl SnapshotStore<RegistryFile> for ThreadRecordingStore {
        fn load(&self) -> Result<Option<RegistryFile>, StorageError> {
            self.inner.load()
        }

        fn save(&self, snapshot: &RegistryFile) -> Result<(), StorageError> {
            self.saved_on.lock().unwrap().push(std::thread::current().id());
            self.inner.save(snapshot)
        }
    }

    // ── success ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pair_stores_record_with_token_from_handshake() {
        // Arrange
        let registry = Arc::new(DeviceRegistry::in_memory());
        let mut transport = MockPairingTransport::new();
        transport
            .expect_pair()
            .withf(|target, identity| {
                target.credential == PairingCredential::Password("open-sesame".to_string())
                    && target.address == addr()
                    && identity.display_name == "phone"
            })
            .times(1)
            .returning(|_, _| {
                Ok(PairingOutcome {
                    sct: "issued-sct".to_string(),
                    device_name: None,
                })
            });
        let engine = engine(registry.clone(), transport);

        // Act
        let record = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("open-sesame"))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Assert
        assert_eq!(record.sct, "issued-sct");
        assert_eq!(record.display_name, "Porch camera");
        let stored = registry.get(&key()).expect("row must be persisted");
        assert_eq!(stored, record);
        assert!(!format!("{stored:?}").contains("open-sesame"), "password is never stored");
    }

    #[tokio::test]
    async fn test_registry_write_runs_off_the_async_thread() {
        // Arrange
        let store = Arc::new(ThreadRecordingStore::default());
        let registry = Arc::new(DeviceRegistry::open(store.clone()).unwrap());
        let engine = engine(registry.clone(), accepting("sct", None));

        // Act
        engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Assert
        let saved_on = store.saved_on.lock().unwrap().clone();
        assert_eq!(saved_on.len(), 1);
        assert_ne!(saved_on[0], std::thread::current().id());
        assert!(registry.contains(&key()));
    }

    #[tokio::test]
    async fn test_device_reported_name_wins_over_advertised_name() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let engine = engine(registry, accepting("sct", Some("Kitchen hub")));

        let record = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(record.display_name, "Kitchen hub");
    }

    #[tokio::test]
    async fn test_unnamed_device_is_named_after_its_key() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let engine = engine(registry, accepting("sct", None));
        let request = PairingRequest::manual(key()).with_address(addr()).with_sct("oob-sct");

        let record = engine.pair(request, &CancellationToken::new()).await.unwrap();

        assert_eq!(record.display_name, "pr-1/de-1");
    }

    #[tokio::test]
    async fn test_route_with_sct_pairs_with_sct_credential() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let mut transport = MockPairingTransport::new();
        transport
            .expect_pair()
            .withf(|target, _| target.credential == PairingCredential::Sct("oob".to_string()))
            .times(1)
            .returning(|_, _| {
                Ok(PairingOutcome {
                    sct: "issued".to_string(),
                    device_name: None,
                })
            });
        let engine = engine(registry, transport);
        let route = PairingRoute::parse("pair_device/pr-1/de-1?sct=oob&").unwrap();

        let result = engine
            .pair(
                PairingRequest::from_route(&route).with_address(addr()),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_manual_entry_is_completed_from_discovery() {
        // Arrange
        let registry = Arc::new(DeviceRegistry::in_memory());
        let mut transport = MockPairingTransport::new();
        transport
            .expect_pair()
            .withf(|target, _| {
                target.address == addr()
                    && target.credential == PairingCredential::Password("advertised".to_string())
            })
            .times(1)
            .returning(|_, _| {
                Ok(PairingOutcome {
                    sct: "issued".to_string(),
                    device_name: None,
                })
            });
        let engine = engine(registry, transport)
            .with_resolver(Arc::new(FixedResolver(discovered(Some("advertised")))));

        // Act
        let record = engine
            .pair(PairingRequest::manual(key()), &CancellationToken::new())
            .await
            .unwrap();

        // Assert
        assert_eq!(record.display_name, "Porch camera");
    }

    // ── failures ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_already_paired_device_makes_no_network_call() {
        // Arrange
        let registry = Arc::new(DeviceRegistry::in_memory());
        registry
            .insert(PairedDeviceRecord {
                product_id: "pr-1".to_string(),
                device_id: "de-1".to_string(),
                display_name: "Porch camera".to_string(),
                sct: "old".to_string(),
                paired_at: 1,
            })
            .unwrap();
        let mut transport = MockPairingTransport::new();
        transport.expect_pair().times(0);
        let engine = engine(registry.clone(), transport);

        // Act
        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await;

        // Assert
        assert_eq!(result.unwrap_err(), PairingError::AlreadyPaired(key()));
        assert_eq!(registry.get(&key()).unwrap().sct, "old");
    }

    #[tokio::test]
    async fn test_rejected_password_is_invalid_credential_and_stores_nothing() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let mut transport = MockPairingTransport::new();
        transport
            .expect_pair()
            .times(1)
            .returning(|_, _| Err(TransportError::Rejected("wrong password".to_string())));
        let engine = engine(registry.clone(), transport);

        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("nope"))),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(PairingError::InvalidCredential { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failures_map_to_typed_errors() {
        let cases = [
            (
                TransportError::Unreachable("refused".to_string()),
                PairingError::Unreachable {
                    key: key(),
                    reason: "refused".to_string(),
                },
            ),
            (
                TransportError::Protocol("unexpected frame".to_string()),
                PairingError::ProtocolError {
                    key: key(),
                    reason: "unexpected frame".to_string(),
                },
            ),
        ];
        for (transport_error, expected) in cases {
            let registry = Arc::new(DeviceRegistry::in_memory());
            let mut transport = MockPairingTransport::new();
            transport
                .expect_pair()
                .returning(move |_, _| Err(transport_error.clone()));
            let engine = engine(registry.clone(), transport);

            let result = engine
                .pair(
                    PairingRequest::from_discovered(&discovered(Some("pw"))),
                    &CancellationToken::new(),
                )
                .await;

            assert_eq!(result.unwrap_err(), expected);
            assert!(registry.is_empty());
        }
    }

    #[tokio::test]
    async fn test_request_without_credential_fails_before_network() {
        let mut transport = MockPairingTransport::new();
        transport.expect_pair().times(0);
        let engine = engine(Arc::new(DeviceRegistry::in_memory()), transport);

        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(None)),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap_err(), PairingError::MissingCredential(key()));
    }

    #[tokio::test]
    async fn test_unresolvable_manual_entry_is_unreachable() {
        let mut transport = MockPairingTransport::new();
        transport.expect_pair().times(0);
        let engine = engine(Arc::new(DeviceRegistry::in_memory()), transport);

        let result = engine
            .pair(
                PairingRequest::manual(key()).with_password("pw"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(PairingError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_empty_token_from_device_is_protocol_error() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let engine = engine(registry.clone(), accepting("", None));

        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(PairingError::ProtocolError { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let engine = engine(registry.clone(), SilentTransport);

        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap_err(), PairingError::Timeout(key()));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pairing_leaves_registry_untouched() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let engine = engine(registry.clone(), SilentTransport);
        let cancel = CancellationToken::new();

        let (result, _) = tokio::join!(
            engine.pair(PairingRequest::from_discovered(&discovered(Some("pw"))), &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            }
        );

        assert_eq!(result.unwrap_err(), PairingError::Cancelled(key()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_write_failure_is_storage_error() {
        // Arrange
        let store = Arc::new(FlakyStore::<RegistryFile>::new());
        let registry = Arc::new(DeviceRegistry::open(store.clone()).unwrap());
        store.set_failing(true);
        let engine = engine(registry.clone(), accepting("sct", None));

        // Act
        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await;

        // Assert
        assert!(matches!(result, Err(PairingError::Storage { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pairing_that_loses_a_race_reports_already_paired() {
        // Arrange: another pairing lands while our handshake is in flight
        let registry = Arc::new(DeviceRegistry::in_memory());
        let racing = registry.clone();
        let mut transport = MockPairingTransport::new();
        transport.expect_pair().times(1).returning(move |target, _| {
            racing
                .insert(PairedDeviceRecord {
                    product_id: target.key.product_id.clone(),
                    device_id: target.key.device_id.clone(),
                    display_name: "winner".to_string(),
                    sct: "winner-sct".to_string(),
                    paired_at: 1,
                })
                .unwrap();
            Ok(PairingOutcome {
                sct: "loser-sct".to_string(),
                device_name: None,
            })
        });
        let engine = engine(registry.clone(), transport);

        // Act
        let result = engine
            .pair(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &CancellationToken::new(),
            )
            .await;

        // Assert
        assert!(result.unwrap_err().is_already_paired());
        assert_eq!(registry.get(&key()).unwrap().sct, "winner-sct");
    }

    // ── pair_and_bookmark ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pair_and_bookmark_adds_bookmark_after_pairing() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let bookmarks = BookmarksStore::in_memory(registry.clone());
        let engine = engine(registry, accepting("sct", None));

        engine
            .pair_and_bookmark(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &bookmarks,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(bookmarks.contains(&key()).unwrap());
    }

    #[tokio::test]
    async fn test_failed_pairing_adds_no_bookmark() {
        let registry = Arc::new(DeviceRegistry::in_memory());
        let bookmarks = BookmarksStore::in_memory(registry.clone());
        let mut transport = MockPairingTransport::new();
        transport
            .expect_pair()
            .returning(|_, _| Err(TransportError::Unreachable("down".to_string())));
        let engine = engine(registry, transport);

        let result = engine
            .pair_and_bookmark(
                PairingRequest::from_discovered(&discovered(Some("pw"))),
                &bookmarks,
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(bookmarks.list().unwrap().is_empty());
    }
}
