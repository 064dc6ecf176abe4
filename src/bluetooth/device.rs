// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Remote devices and the deduplicated device registry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A remote Bluetooth device.
///
/// Identity is the address: two values with the same address are equal no
/// matter what name or bond flag they carry.
#[derive(Debug, Clone, Eq)]
pub struct Device {
    address: String,
    name: Option<String>,
    bonded: bool,
}

impl Device {
    /// Create an unbonded device. The address is normalised to upper case.
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into().to_uppercase(),
            name,
            bonded: false,
        }
    }

    /// Create a device the OS reports as bonded.
    pub fn bonded(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            bonded: true,
            ..Self::new(address, name)
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_bonded(&self) -> bool {
        self.bonded
    }

    /// Name for logs and status messages.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Immutable snapshot of a device list.
pub type DeviceList = Arc<Vec<Device>>;

/// Discovered and bonded devices, each list free of duplicate addresses.
///
/// Both lists are published through `watch` channels so any number of
/// readers can follow them without blocking writers.
pub struct DeviceRegistry {
    discovered: watch::Sender<DeviceList>,
    bonded: watch::Sender<DeviceList>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (discovered, _) = watch::channel(Arc::new(Vec::new()));
        let (bonded, _) = watch::channel(Arc::new(Vec::new()));
        Self { discovered, bonded }
    }

    /// Append a discovered device unless its address is already present.
    ///
    /// Returns whether the device was inserted.
    pub fn add_discovered(&self, device: Device) -> bool {
        let inserted = self.discovered.send_if_modified(|list| {
            if list.contains(&device) {
                false
            } else {
                Arc::make_mut(list).push(device.clone());
                true
            }
        });
        if inserted {
            debug!("Discovered device: {}", device);
        }
        inserted
    }

    /// Replace the bonded list wholesale. Later duplicates are dropped.
    pub fn set_bonded(&self, devices: Vec<Device>) {
        let mut unique: Vec<Device> = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }
        debug!("Bonded devices updated: {}", unique.len());
        self.bonded.send_replace(Arc::new(unique));
    }

    pub fn discovered(&self) -> DeviceList {
        self.discovered.borrow().clone()
    }

    pub fn bonded(&self) -> DeviceList {
        self.bonded.borrow().clone()
    }

    pub fn is_bonded(&self, address: &str) -> bool {
        let address = address.to_uppercase();
        self.bonded.borrow().iter().any(|d| d.address == address)
    }

    /// Look up a device by address, bonded entries first.
    pub fn find(&self, address: &str) -> Option<Device> {
        let address = address.to_uppercase();
        self.bonded
            .borrow()
            .iter()
            .chain(self.discovered.borrow().iter())
            .find(|d| d.address == address)
            .cloned()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<DeviceList> {
        self.discovered.subscribe()
    }

    pub fn watch_bonded(&self) -> watch::Receiver<DeviceList> {
        self.bonded.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
