//! SessionManager: shared, reference-counted secure connections to paired devices.
//!
//! The manager is the only component that opens transport sessions.  It keeps
//! at most one entry per device key and hands out [`ConnectionHandle`]s that
//! share the entry's underlying session.
//!
//! # Handle lifecycle
//!
//! ```text
//!            acquire                 open ok
//! Closed ──────────────► Opening ───────────────► Open
//!   ▲                      │                       │
//!   │        open failed   │                       │ last release / release_all
//!   ├──────────────────────┘                       ▼
//!   │                                           Closing
//!   │             teardown finished                │
//!   └──────────────────────────────────────────────┘
//!
//! Open ──(link dropped)──► Closing ──► Closed   (holders are notified)
//! ```
//!
//! - Concurrent `acquire` calls during `Opening` join the in-flight attempt;
//!   every waiter receives the same handle id or the same error.
//! - An entry stays in the table while `Closing`, and a new `acquire` for that
//!   key waits for the teardown to finish, so two sessions never coexist for
//!   one key.  This holds for a dropped link too.
//! - Teardown is best effort and bounded by [`SessionConfig::close_timeout`];
//!   a device that stalls while closing cannot hold an entry in `Closing`
//!   forever.
//! - The table is guarded by one `std::sync::Mutex` that is never held across
//!   an `.await`.  Every state change is published on a per-entry
//!   `watch` channel that handles and waiters subscribe to.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use edge_core::{ConnectionError, DeviceKey};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::credentials::CredentialStore;
use super::device_registry::DeviceRegistry;
use super::transport::{
    ClientIdentity, SessionTarget, SessionTransport, TransportError, TransportSession,
};

/// Default bound on connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on closing a transport session.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// After this long the session is dropped and the entry retired anyway.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Externally visible state of a device's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Why a handle stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The last holder released it.
    Released,
    /// `release_all` force-closed it (credential reset or shutdown).
    Invalidated,
    /// The underlying link dropped after the handle was open.
    ConnectionLost,
    /// The connection could not be established.
    Failed(ConnectionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Opening,
    Open,
    Closing(CloseReason),
    Closed(CloseReason),
}

impl Phase {
    fn state(&self) -> HandleState {
        match self {
            Phase::Opening => HandleState::Opening,
            Phase::Open => HandleState::Open,
            Phase::Closing(_) => HandleState::Closing,
            Phase::Closed(_) => HandleState::Closed,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, Phase::Opening | Phase::Open)
    }

    fn is_settled(&self) -> bool {
        !matches!(self, Phase::Opening)
    }

    fn is_closed(&self) -> bool {
        matches!(self, Phase::Closed(_))
    }
}

/// One row of the handle table.
struct Entry {
    id: Uuid,
    ref_count: usize,
    phase: watch::Sender<Phase>,
    /// Present only while `Open`; taken by whoever tears the session down.
    session: Option<Arc<dyn TransportSession>>,
    /// Stops the in-flight open and the link monitor.
    cancel: CancellationToken,
}

impl Entry {
    fn phase(&self) -> Phase {
        self.phase.borrow().clone()
    }
}

/// Result of trying to join or create an entry.
enum Admission {
    Joined {
        id: Uuid,
        phase: watch::Receiver<Phase>,
    },
    /// The previous entry for this key is still closing.
    MustWait(watch::Receiver<Phase>),
}

/// What the open task does once the attempt has settled.
enum AfterOpen {
    Done,
    Monitor(Arc<dyn TransportSession>),
    Abandon(Option<Arc<dyn TransportSession>>, CloseReason),
    Orphan(Option<Arc<dyn TransportSession>>),
}

struct Inner {
    transport: Arc<dyn SessionTransport>,
    registry: Arc<DeviceRegistry>,
    credentials: Arc<CredentialStore>,
    config: SessionConfig,
    entries: Mutex<HashMap<DeviceKey, Entry>>,
    runtime: tokio::runtime::Handle,
}

/// Opens, shares, and tears down connections to paired devices.
///
/// Cheap to clone; clones share the same handle table.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates a manager bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        registry: Arc<DeviceRegistry>,
        credentials: Arc<CredentialStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                credentials,
                config,
                entries: Mutex::new(HashMap::new()),
                runtime: tokio::runtime::Handle::current(),
            }),
        }
    }

    /// Returns a handle to the connection for `key`, opening one if needed.
    ///
    /// Waits while the connection is being established.  If `cancel` fires
    /// first, only this caller's reservation is dropped; the attempt continues
    /// for other waiters and is abandoned when none remain.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotPaired`] if the registry has no record for `key`.
    /// - [`ConnectionError::Unreachable`], [`ConnectionError::Rejected`] or
    ///   [`ConnectionError::Timeout`] if the shared attempt fails; every waiter
    ///   receives the same error.
    /// - [`ConnectionError::HandleInvalidated`] if `release_all` ran while
    ///   waiting.
    /// - [`ConnectionError::Cancelled`] if `cancel` fired.
    pub async fn acquire(
        &self,
        key: &DeviceKey,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let record = self
            .inner
            .registry
            .get(key)
            .ok_or_else(|| ConnectionError::NotPaired(key.clone()))?;

        loop {
            match self.inner.admit(key, &record.sct) {
                Admission::MustWait(mut phase) => {
                    debug!("{key}: waiting for the previous connection to close");
                    tokio::select! {
                        biased;
                        _ = wait_until(&mut phase, Phase::is_closed) => continue,
                        _ = cancel.cancelled() => return Err(ConnectionError::Cancelled(key.clone())),
                    }
                }
                Admission::Joined { id, phase } => {
                    return self.await_open(key, id, phase, cancel).await;
                }
            }
        }
    }

    /// Gives a handle back.  Tears the connection down when it was the last one.
    ///
    /// Never blocks: teardown runs on a background task.  Releasing a handle
    /// that was already invalidated is a no-op.
    pub fn release(&self, handle: ConnectionHandle) {
        handle.release();
    }

    /// Force-closes every connection regardless of reference counts.
    ///
    /// Returns once every teardown has finished or hit the close timeout, with
    /// the number of live handles that were closed.  Holders of those handles get
    /// [`ConnectionError::HandleInvalidated`] on their next use.
    pub async fn release_all(&self) -> usize {
        let inner = &self.inner;
        let (forced, teardowns, mut pending) = {
            let mut entries = inner.lock();
            let mut forced = 0;
            let mut teardowns = Vec::new();
            let mut pending = Vec::with_capacity(entries.len());
            for (key, entry) in entries.iter_mut() {
                if entry.phase().is_live() {
                    forced += 1;
                    if let Some(session) = begin_close(entry, CloseReason::Invalidated) {
                        teardowns.push((key.clone(), entry.id, session));
                    }
                }
                pending.push(entry.phase.subscribe());
            }
            (forced, teardowns, pending)
        };

        for (key, id, session) in teardowns {
            inner.runtime.spawn(Arc::clone(inner).teardown(
                key,
                id,
                session,
                CloseReason::Invalidated,
            ));
        }
        for phase in pending.iter_mut() {
            wait_until(phase, Phase::is_closed).await;
        }

        info!("released all connections ({forced} live handle(s) force-closed)");
        forced
    }

    /// Current state of the connection for `key`.
    pub fn state_of(&self, key: &DeviceKey) -> HandleState {
        self.inner
            .lock()
            .get(key)
            .map(|entry| entry.phase().state())
            .unwrap_or(HandleState::Closed)
    }

    /// Number of outstanding references to the live connection for `key`.
    pub fn ref_count(&self, key: &DeviceKey) -> usize {
        self.inner
            .lock()
            .get(key)
            .filter(|entry| entry.phase().is_live())
            .map_or(0, |entry| entry.ref_count)
    }

    /// Number of connections that are opening or open.
    pub fn live_handles(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|entry| entry.phase().is_live())
            .count()
    }

    async fn await_open(
        &self,
        key: &DeviceKey,
        id: Uuid,
        mut phase: watch::Receiver<Phase>,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle, ConnectionError> {
        // Dropping the lease (cancellation, or this future being dropped)
        // gives the reservation back.
        let lease = Lease {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
        };

        let settled = tokio::select! {
            biased;
            settled = wait_until(&mut phase, Phase::is_settled) => settled,
            _ = cancel.cancelled() => {
                debug!("{key}: acquire cancelled while the connection was opening");
                return Err(ConnectionError::Cancelled(key.clone()));
            }
        };

        match settled {
            Phase::Open => match self.inner.session_of(key, id) {
                Some(session) => Ok(ConnectionHandle {
                    lease,
                    session,
                    phase,
                }),
                None => Err(ConnectionError::HandleInvalidated(key.clone())),
            },
            Phase::Closed(CloseReason::Failed(error)) => Err(error),
            _ => Err(ConnectionError::HandleInvalidated(key.clone())),
        }
    }

    /// A manager with an empty registry and a transport that never connects.
    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Self {
        struct Nowhere;

        #[async_trait::async_trait]
        impl SessionTransport for Nowhere {
            async fn open(
                &self,
                _target: &SessionTarget,
                _identity: &ClientIdentity,
            ) -> Result<Arc<dyn TransportSession>, TransportError> {
                Err(TransportError::Unreachable("no transport in this test".to_string()))
            }
        }

        Self::new(
            Arc::new(Nowhere),
            Arc::new(DeviceRegistry::in_memory()),
            Arc::new(CredentialStore::ephemeral("test").expect("ephemeral key")),
            SessionConfig::default(),
        )
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, Entry>> {
        self.entries.lock().expect("lock poisoned")
    }

    /// Joins the live entry for `key`, or creates one and starts opening it.
    fn admit(self: &Arc<Self>, key: &DeviceKey, sct: &str) -> Admission {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            if entry.phase().is_live() {
                entry.ref_count += 1;
                debug!("{key}: joined handle {} (refs={})", entry.id, entry.ref_count);
                return Admission::Joined {
                    id: entry.id,
                    phase: entry.phase.subscribe(),
                };
            }
            return Admission::MustWait(entry.phase.subscribe());
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (phase_tx, phase_rx) = watch::channel(Phase::Opening);
        entries.insert(
            key.clone(),
            Entry {
                id,
                ref_count: 1,
                phase: phase_tx,
                session: None,
                cancel: cancel.clone(),
            },
        );
        drop(entries);

        info!("{key}: opening connection (handle {id})");
        let target = SessionTarget {
            key: key.clone(),
            sct: sct.to_string(),
        };
        let identity = self.credentials.identity();
        self.runtime
            .spawn(Arc::clone(self).run_open(target, identity, id, cancel));

        Admission::Joined {
            id,
            phase: phase_rx,
        }
    }

    /// Establishes the connection for a freshly admitted entry, then watches
    /// the link until the entry is closed.
    async fn run_open(
        self: Arc<Self>,
        target: SessionTarget,
        identity: ClientIdentity,
        id: Uuid,
        cancel: CancellationToken,
    ) {
        let key = target.key.clone();
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.open(&target, &identity),
            ) => Some(result),
        };
        let outcome = match attempt {
            None => Err(None),
            Some(Ok(Ok(session))) => Ok(session),
            Some(Ok(Err(e))) => Err(Some(map_transport_error(&key, e))),
            Some(Err(_elapsed)) => Err(Some(ConnectionError::Timeout(key.clone()))),
        };

        let next = {
            let mut entries = self.lock();
            match entries.get_mut(&key) {
                Some(entry) if entry.id == id => match (entry.phase(), outcome) {
                    (Phase::Opening, Ok(session)) => {
                        entry.session = Some(Arc::clone(&session));
                        entry.phase.send_replace(Phase::Open);
                        info!("{key}: connection open (handle {id}, refs={})", entry.ref_count);
                        AfterOpen::Monitor(session)
                    }
                    (Phase::Opening, Err(error)) => {
                        let error = error.unwrap_or_else(|| ConnectionError::Cancelled(key.clone()));
                        warn!("{key}: connection attempt failed: {error}");
                        if let Some(entry) = entries.remove(&key) {
                            entry
                                .phase
                                .send_replace(Phase::Closed(CloseReason::Failed(error)));
                        }
                        AfterOpen::Done
                    }
                    (Phase::Closing(reason), outcome) => AfterOpen::Abandon(outcome.ok(), reason),
                    (_, outcome) => AfterOpen::Orphan(outcome.ok()),
                },
                _ => AfterOpen::Orphan(outcome.ok()),
            }
        };

        match next {
            AfterOpen::Done => {}
            AfterOpen::Monitor(session) => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = session.closed() => {
                        // A release that raced the drop owns the teardown.
                        if self.connection_lost(&key, id) {
                            self.close_session(&key, id, &session).await;
                            self.finish(&key, id, CloseReason::ConnectionLost);
                        }
                    }
                }
            }
            AfterOpen::Abandon(session, reason) => {
                if let Some(session) = session {
                    self.close_session(&key, id, &session).await;
                }
                debug!("{key}: abandoned connection attempt (handle {id})");
                self.finish(&key, id, reason);
            }
            AfterOpen::Orphan(session) => {
                if let Some(session) = session {
                    warn!("{key}: closing a session that no entry owns (handle {id})");
                    self.close_session(&key, id, &session).await;
                }
            }
        }
    }

    /// Closes `session` and then retires the entry.
    async fn teardown(
        self: Arc<Self>,
        key: DeviceKey,
        id: Uuid,
        session: Arc<dyn TransportSession>,
        reason: CloseReason,
    ) {
        self.close_session(&key, id, &session).await;
        self.finish(&key, id, reason);
    }

    /// Closes `session`, giving up after the configured close timeout.
    async fn close_session(
        &self,
        key: &DeviceKey,
        id: Uuid,
        session: &Arc<dyn TransportSession>,
    ) {
        let limit = self.config.close_timeout;
        if tokio::time::timeout(limit, session.close()).await.is_err() {
            warn!("{key}: handle {id} did not close within {limit:?}; dropping the session");
        }
    }

    /// Removes the entry `id` and publishes `Closed(reason)`.
    fn finish(&self, key: &DeviceKey, id: Uuid, reason: CloseReason) {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            if let Some(entry) = entries.remove(key) {
                debug!("{key}: handle {id} closed ({reason:?})");
                entry.phase.send_replace(Phase::Closed(reason));
            }
        }
    }

    /// Moves the open entry `id` to `Closing(ConnectionLost)`.  Returns
    /// `false` if the entry was already closing for another reason.
    fn connection_lost(&self, key: &DeviceKey, id: Uuid) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.id == id && entry.phase() == Phase::Open => {
                warn!(
                    "{key}: connection lost; notifying {} holder(s)",
                    entry.ref_count
                );
                begin_close(entry, CloseReason::ConnectionLost);
                true
            }
            _ => false,
        }
    }

    fn session_of(&self, key: &DeviceKey, id: Uuid) -> Option<Arc<dyn TransportSession>> {
        self.lock()
            .get(key)
            .filter(|entry| entry.id == id && entry.phase() == Phase::Open)
            .and_then(|entry| entry.session.clone())
    }

    /// Drops one reference; starts the close when it was the last one.
    fn release_ref(self: &Arc<Self>, key: &DeviceKey, id: Uuid) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            debug!("{key}: release of handle {id} after it was closed");
            return;
        };
        if entry.id != id || !entry.phase().is_live() {
            debug!("{key}: release of stale handle {id}");
            return;
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            debug!("{key}: released one reference (refs={})", entry.ref_count);
            return;
        }

        let session = begin_close(entry, CloseReason::Released);
        drop(entries);
        debug!("{key}: last reference released; closing handle {id}");

        // An entry still opening has no session yet; its open task finishes the close.
        if let Some(session) = session {
            self.runtime.spawn(Arc::clone(self).teardown(
                key.clone(),
                id,
                session,
                CloseReason::Released,
            ));
        }
    }
}

/// Moves a live entry to `Closing` and hands back its session, if any.
fn begin_close(entry: &mut Entry, reason: CloseReason) -> Option<Arc<dyn TransportSession>> {
    entry.phase.send_replace(Phase::Closing(reason));
    entry.cancel.cancel();
    entry.session.take()
}

/// Waits until the published phase satisfies `done` and returns it.
async fn wait_until(phase: &mut watch::Receiver<Phase>, done: fn(&Phase) -> bool) -> Phase {
    let settled = phase.wait_for(done).await.map(|p| p.clone()).ok();
    settled.unwrap_or_else(|| phase.borrow().clone())
}

fn map_transport_error(key: &DeviceKey, error: TransportError) -> ConnectionError {
    match error {
        TransportError::Unreachable(reason) => ConnectionError::Unreachable {
            key: key.clone(),
            reason,
        },
        TransportError::Rejected(reason) => ConnectionError::Rejected {
            key: key.clone(),
            reason,
        },
        TransportError::Protocol(reason) => ConnectionError::Unreachable {
            key: key.clone(),
            reason: format!("protocol error: {reason}"),
        },
        TransportError::Closed => ConnectionError::Unreachable {
            key: key.clone(),
            reason: "connection closed by device".to_string(),
        },
    }
}

/// One reference to an entry; dropping it gives the reference back.
struct Lease {
    inner: Arc<Inner>,
    key: DeviceKey,
    id: Uuid,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release_ref(&self.key, self.id);
    }
}

/// A shared reference to one live connection.
///
/// Every holder of the same underlying connection sees the same [`id`].
/// Dropping a handle releases it.
///
/// [`id`]: ConnectionHandle::id
pub struct ConnectionHandle {
    lease: Lease,
    session: Arc<dyn TransportSession>,
    phase: watch::Receiver<Phase>,
}

impl ConnectionHandle {
    pub fn key(&self) -> &DeviceKey {
        &self.lease.key
    }

    /// Identifies the underlying connection.
    pub fn id(&self) -> Uuid {
        self.lease.id
    }

    pub fn state(&self) -> HandleState {
        self.phase.borrow().state()
    }

    /// `false` once the handle has been released, force-closed, or lost.
    pub fn is_valid(&self) -> bool {
        *self.phase.borrow() == Phase::Open
    }

    /// The transport session behind this handle.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::HandleInvalidated`] if the handle is no longer open.
    pub fn session(&self) -> Result<Arc<dyn TransportSession>, ConnectionError> {
        if self.is_valid() {
            Ok(Arc::clone(&self.session))
        } else {
            Err(ConnectionError::HandleInvalidated(self.key().clone()))
        }
    }

    /// Sends one control message over the connection.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::HandleInvalidated`] if the handle is stale or the
    /// link closed underneath it.
    pub async fn send(&self, body: &str) -> Result<(), ConnectionError> {
        let session = self.session()?;
        session.send(body).await.map_err(|e| match e {
            TransportError::Closed => ConnectionError::HandleInvalidated(self.key().clone()),
            other => map_transport_error(self.key(), other),
        })
    }

    /// Resolves once the connection leaves `Open`, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut phase = self.phase.clone();
        match wait_until(&mut phase, |p| !matches!(p, Phase::Opening | Phase::Open)).await {
            Phase::Closing(reason) | Phase::Closed(reason) => reason,
            Phase::Opening | Phase::Open => CloseReason::Invalidated,
        }
    }

    /// Gives the handle back; same as dropping it.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", self.key())
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
