//! Continuous discovery of devices on the local network.
//!
//! The [`DiscoveryService`] drives a [`DeviceScanner`] in a background task
//! and publishes the set of devices it has heard from recently on a
//! `tokio::sync::watch` channel.  Every subscriber sees a complete snapshot,
//! never a delta.
//!
//! # How the snapshot is maintained (for beginners)
//!
//! 1. The scanner listens for one *cycle* and returns every advertisement it
//!    heard.  The same device may appear several times; the newest wins.
//! 2. Each device is stamped with the time it was last heard.
//! 3. After every cycle, devices silent for longer than the *silence window*
//!    are dropped and the remaining set is published, sorted by key.
//!
//! A set that did not change is not republished, so subscribers wake up only
//! when there is something new to show.
//!
//! # Errors never reach subscribers
//!
//! A failing scan cycle (socket error, interface down) is logged and retried
//! with exponential backoff.  Subscribers only ever observe snapshots; an
//! empty snapshot is a valid state.
//!
//! # Lifetime
//!
//! Scanning is application-lifetime background work.  It keeps running
//! whether or not anyone is subscribed, and stops only on
//! [`DiscoveryService::stop_scanning`].  Both `start_scanning` and
//! `stop_scanning` are idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_core::{DeviceKey, DiscoveredDevice};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::transport::AddressResolver;

/// Default UDP port devices announce themselves on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5592;

/// Error type for a single scan cycle.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The discovery socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// An I/O error occurred while receiving a datagram.
    #[error("recv error: {0}")]
    Recv(std::io::Error),
}

/// One pass over the network.
///
/// Implementations listen (or query) for one cycle and return every
/// advertisement heard.  They must not deduplicate across cycles; the
/// service does that.
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<DiscoveredDevice>, ScanError>;
}

/// Timing knobs for the scan loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Pause between two scan cycles.
    pub scan_interval: Duration,
    /// How long a device may stay silent before it leaves the snapshot.
    pub silence_window: Duration,
    /// First delay after a failed cycle; doubles on each consecutive failure.
    pub retry_backoff: Duration,
    /// Upper bound for the backoff delay.
    pub max_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            silence_window: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Subscription to the discovery snapshot.
pub type DiscoverySubscription = watch::Receiver<Vec<DiscoveredDevice>>;

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Publishes the live set of devices found on the local network.
pub struct DiscoveryService {
    scanner: Arc<dyn DeviceScanner>,
    config: DiscoveryConfig,
    snapshot: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
    worker: Mutex<Option<Worker>>,
}

impl DiscoveryService {
    pub fn new(scanner: Arc<dyn DeviceScanner>, config: DiscoveryConfig) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            scanner,
            config,
            snapshot: Arc::new(snapshot),
            worker: Mutex::new(None),
        }
    }

    /// Starts the background scan loop if it is not running and returns a
    /// subscription to the snapshot.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_scanning(&self) -> DiscoverySubscription {
        let mut worker = self.worker.lock().expect("lock poisoned");
        let running = worker.as_ref().is_some_and(|w| !w.task.is_finished());
        if !running {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(scan_loop(
                Arc::clone(&self.scanner),
                self.config.clone(),
                Arc::clone(&self.snapshot),
                cancel.clone(),
            ));
            *worker = Some(Worker { cancel, task });
            info!("discovery started");
        }
        self.snapshot.subscribe()
    }

    /// Stops the scan loop and waits for it to exit.  The last snapshot stays
    /// readable.
    pub async fn stop_scanning(&self) {
        let worker = self.worker.lock().expect("lock poisoned").take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.task.await {
                warn!("discovery task ended abnormally: {e}");
            }
            info!("discovery stopped");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.worker
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .is_some_and(|w| !w.task.is_finished())
    }

    /// Subscribes without starting the scan loop.
    pub fn subscribe(&self) -> DiscoverySubscription {
        self.snapshot.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.snapshot.borrow().clone()
    }
}

impl AddressResolver for DiscoveryService {
    fn resolve(&self, key: &DeviceKey) -> Option<DiscoveredDevice> {
        self.snapshot
            .borrow()
            .iter()
            .find(|device| device.key == *key)
            .cloned()
    }
}

/// The background loop: scan, merge, prune, publish, wait.
async fn scan_loop(
    scanner: Arc<dyn DeviceScanner>,
    config: DiscoveryConfig,
    snapshot: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
    cancel: CancellationToken,
) {
    // A restart resumes from the last snapshot; those devices age out normally.
    let started = Instant::now();
    let mut seen: HashMap<DeviceKey, (DiscoveredDevice, Instant)> = snapshot
        .borrow()
        .iter()
        .map(|d| (d.key.clone(), (d.clone(), started)))
        .collect();
    let mut backoff = config.retry_backoff;

    loop {
        let cycle = tokio::select! {
            _ = cancel.cancelled() => break,
            result = scanner.scan() => result,
        };
        let now = Instant::now();

        let pause = match cycle {
            Ok(devices) => {
                backoff = config.retry_backoff;
                for device in devices {
                    seen.insert(device.key.clone(), (device, now));
                }
                config.scan_interval
            }
            Err(e) => {
                warn!("discovery scan failed, retrying in {backoff:?}: {e}");
                let pause = backoff;
                backoff = (backoff * 2).min(config.max_backoff);
                pause
            }
        };

        seen.retain(|key, (_, last_heard)| {
            let fresh = now.duration_since(*last_heard) <= config.silence_window;
            if !fresh {
                debug!("{key} went silent; dropping it from the snapshot");
            }
            fresh
        });
        publish(&snapshot, &seen);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

fn publish(
    snapshot: &watch::Sender<Vec<DiscoveredDevice>>,
    seen: &HashMap<DeviceKey, (DiscoveredDevice, Instant)>,
) {
    let mut next: Vec<DiscoveredDevice> = seen.values().map(|(d, _)| d.clone()).collect();
    next.sort_by(|a, b| a.key.cmp(&b.key));
    snapshot.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        debug!("discovery snapshot now holds {} device(s)", next.len());
        *current = next;
        true
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────
