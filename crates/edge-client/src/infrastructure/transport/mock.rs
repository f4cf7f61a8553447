//! Scripted in-memory transport for tests and demos.
//!
//! [`ScriptedTransport`] simulates a set of devices without any sockets.  It
//! behaves like a real device fleet in the ways the core cares about:
//!
//! - pairing succeeds only with the device's password (or its bootstrap
//!   token) and issues a fresh session-config-token;
//! - a session opens only with the token the device issued *and* the client
//!   key that paired, so a credential reset makes old tokens fail with
//!   `Rejected`;
//! - links can be dropped on demand to simulate network loss.
//!
//! It also counts calls and live sessions so tests can assert that the core
//! never opens two sessions to the same device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_core::DeviceKey;
use tokio_util::sync::CancellationToken;

use crate::application::transport::{
    ClientIdentity, PairingCredential, PairingOutcome, PairingTarget, PairingTransport,
    SessionTarget, SessionTransport, TransportError, TransportSession,
};

/// A simulated device.
#[derive(Debug, Clone, Default)]
struct SimulatedDevice {
    password: Option<String>,
    bootstrap_sct: Option<String>,
    name: Option<String>,
    reachable: bool,
    /// Issued token and the fingerprint of the client it was issued to.
    trusted: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct Counters {
    pair_calls: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// In-memory device fleet implementing both transport seams.
#[derive(Default)]
pub struct ScriptedTransport {
    devices: Mutex<HashMap<DeviceKey, SimulatedDevice>>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
    counters: Arc<Counters>,
    open_delay: Duration,
    issued: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` takes `delay` before it answers.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Adds a reachable device that accepts `password` for pairing.
    pub fn add_device(&self, key: DeviceKey, password: &str, name: Option<&str>) {
        self.devices.lock().expect("lock poisoned").insert(
            key,
            SimulatedDevice {
                password: Some(password.to_string()).filter(|p| !p.is_empty()),
                name: name.map(str::to_string),
                reachable: true,
                ..SimulatedDevice::default()
            },
        );
    }

    /// Adds a reachable device that pairs with an out-of-band token.
    pub fn add_device_with_sct(&self, key: DeviceKey, bootstrap_sct: &str) {
        self.devices.lock().expect("lock poisoned").insert(
            key,
            SimulatedDevice {
                bootstrap_sct: Some(bootstrap_sct.to_string()),
                reachable: true,
                ..SimulatedDevice::default()
            },
        );
    }

    /// Makes a device stop answering (or answer again).
    pub fn set_reachable(&self, key: &DeviceKey, reachable: bool) {
        if let Some(device) = self.devices.lock().expect("lock poisoned").get_mut(key) {
            device.reachable = reachable;
        }
    }

    /// Drops every live link to `key`, as if the network went away.
    pub fn drop_link(&self, key: &DeviceKey) {
        for session in self.sessions.lock().expect("lock poisoned").iter() {
            if session.key == *key {
                session.link.cancel();
            }
        }
    }

    pub fn pair_calls(&self) -> usize {
        self.counters.pair_calls.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn live_sessions(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were live at the same time.
    pub fn max_live_sessions(&self) -> usize {
        self.counters.max_live.load(Ordering::SeqCst)
    }

    /// Control messages received for `key`, oldest first.
    pub fn messages_for(&self, key: &DeviceKey) -> Vec<String> {
        self.sessions
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|s| s.key == *key)
            .flat_map(|s| s.received.lock().expect("lock poisoned").clone())
            .collect()
    }

    fn device(&self, key: &DeviceKey) -> Result<SimulatedDevice, TransportError> {
        self.devices
            .lock()
            .expect("lock poisoned")
            .get(key)
            .filter(|d| d.reachable)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("{key} does not answer")))
    }
}

#[async_trait]
impl PairingTransport for ScriptedTransport {
    async fn pair(
        &self,
        target: &PairingTarget,
        identity: &ClientIdentity,
    ) -> Result<PairingOutcome, TransportError> {
        self.counters.pair_calls.fetch_add(1, Ordering::SeqCst);
        let device = self.device(&target.key)?;

        let accepted = match &target.credential {
            PairingCredential::Password(p) => device.password.as_ref() == Some(p),
            PairingCredential::Sct(s) => device.bootstrap_sct.as_ref() == Some(s),
        };
        if !accepted {
            return Err(TransportError::Rejected("credential not accepted".to_string()));
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let sct = format!("sct-{}-{n}", target.key.device_id);
        if let Some(device) = self
            .devices
            .lock()
            .expect("lock poisoned")
            .get_mut(&target.key)
        {
            device.trusted = Some((sct.clone(), identity.fingerprint.clone()));
        }
        Ok(PairingOutcome {
            sct,
            device_name: device.name,
        })
    }
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn open(
        &self,
        target: &SessionTarget,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.open_delay).await;
        let device = self.device(&target.key)?;

        match &device.trusted {
            Some((sct, fingerprint)) if *sct == target.sct && *fingerprint == identity.fingerprint => {}
            _ => return Err(TransportError::Rejected("unknown client".to_string())),
        }

        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);
        let session = Arc::new(ScriptedSession {
            key: target.key.clone(),
            link: CancellationToken::new(),
            closed: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            counters: Arc::clone(&self.counters),
        });
        self.sessions
            .lock()
            .expect("lock poisoned")
            .push(Arc::clone(&session));
        Ok(session)
    }
}

/// One simulated session.
pub struct ScriptedSession {
    key: DeviceKey,
    link: CancellationToken,
    closed: AtomicBool,
    received: Mutex<Vec<String>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn send(&self, body: &str) -> Result<(), TransportError> {
        if self.link.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.received
            .lock()
            .expect("lock poisoned")
            .push(body.to_string());
        Ok(())
    }

    async fn closed(&self) {
        self.link.cancelled().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.link.cancel();
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(fingerprint: &str) -> ClientIdentity {
        ClientIdentity {
            fingerprint: fingerprint.to_string(),
            display_name: "test".to_string(),
        }
    }

    fn pair_target(key: &DeviceKey, credential: PairingCredential) -> PairingTarget {
        PairingTarget {
            key: key.clone(),
            address: "127.0.0.1:1".parse().unwrap(),
            credential,
        }
    }

    #[tokio::test]
    async fn test_pairing_issues_token_that_opens_a_session() {
        // Arrange
        let transport = ScriptedTransport::new();
        let key = DeviceKey::new("p", "d");
        transport.add_device(key.clone(), "pw", Some("Cam"));

        // Act
        let outcome = transport
            .pair(
                &pair_target(&key, PairingCredential::Password("pw".to_string())),
                &identity("aa"),
            )
            .await
            .unwrap();
        let session = transport
            .open(
                &SessionTarget {
                    key: key.clone(),
                    sct: outcome.sct,
                },
                &identity("aa"),
            )
            .await;

        // Assert
        assert!(session.is_ok());
        assert_eq!(transport.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_token_is_bound_to_the_pairing_client_key() {
        let transport = ScriptedTransport::new();
        let key = DeviceKey::new("p", "d");
        transport.add_device_with_sct(key.clone(), "oob");
        let outcome = transport
            .pair(
                &pair_target(&key, PairingCredential::Sct("oob".to_string())),
                &identity("old-key"),
            )
            .await
            .unwrap();

        let result = transport
            .open(
                &SessionTarget {
                    key,
                    sct: outcome.sct,
                },
                &identity("new-key"),
            )
            .await;

        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unreachable_device_fails_pairing() {
        let transport = ScriptedTransport::new();
        let key = DeviceKey::new("p", "d");
        transport.add_device(key.clone(), "pw", None);
        transport.set_reachable(&key, false);

        let result = transport
            .pair(
                &pair_target(&key, PairingCredential::Password("pw".to_string())),
                &identity("aa"),
            )
            .await;

        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
