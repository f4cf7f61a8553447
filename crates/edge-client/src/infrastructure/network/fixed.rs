//! A scanner that "hears" a list of devices set by the caller.
//!
//! Used by tests and offline demos where no real network is available.  The
//! list can be changed at any time; devices removed from it age out of the
//! discovery snapshot exactly like devices that stop announcing.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::{DeviceKey, DiscoveredDevice};

use super::discovery::{DeviceScanner, ScanError};

pub struct FixedScanner {
    cycle: Duration,
    devices: Mutex<Vec<DiscoveredDevice>>,
}

impl FixedScanner {
    /// Each scan cycle takes `cycle` and returns the current list.
    pub fn new(cycle: Duration) -> Self {
        Self {
            cycle,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn set_devices(&self, devices: Vec<DiscoveredDevice>) {
        *self.devices.lock().expect("lock poisoned") = devices;
    }

    /// Adds or replaces one device.
    pub fn announce(&self, device: DiscoveredDevice) {
        let mut devices = self.devices.lock().expect("lock poisoned");
        devices.retain(|d| d.key != device.key);
        devices.push(device);
    }

    /// Stops announcing `key`.
    pub fn go_silent(&self, key: &DeviceKey) {
        self.devices
            .lock()
            .expect("lock poisoned")
            .retain(|d| d.key != *key);
    }
}

#[async_trait]
impl DeviceScanner for FixedScanner {
    async fn scan(&self) -> Result<Vec<DiscoveredDevice>, ScanError> {
        tokio::time::sleep(self.cycle).await;
        Ok(self.devices.lock().expect("lock poisoned").clone())
    }
}
