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

//! Device discovery: scan control and found-device routing.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::DeviceRegistry;
use super::platform::{
    AdapterPort, EventSource, Permission, PlatformEvent, SubscriptionId, SubscriptionKind,
};
use crate::error::{BluetoothError, Result};
use crate::events::EventSink;

/// Found-device subscription and the task feeding the registry from it.
struct Registration {
    id: SubscriptionId,
    pump: JoinHandle<()>,
}

/// Starts and stops scanning and routes found devices into the registry.
pub struct DiscoverySession {
    adapter: Arc<dyn AdapterPort>,
    events: Arc<dyn EventSource>,
    registry: Arc<DeviceRegistry>,
    sink: EventSink,
    // async lock: start/stop are serialised across their await points
    registration: Mutex<Option<Registration>>,
}

impl DiscoverySession {
    pub fn new(
        adapter: Arc<dyn AdapterPort>,
        events: Arc<dyn EventSource>,
        registry: Arc<DeviceRegistry>,
        sink: EventSink,
    ) -> Self {
        Self {
            adapter,
            events,
            registry,
            sink,
            registration: Mutex::new(None),
        }
    }

    /// Start scanning.
    ///
    /// A scan already in progress is cancelled and a fresh one issued. The
    /// found-device subscription is registered at most once.
    pub async fn start(&self) -> Result<()> {
        if !self.adapter.has_permission(Permission::Scan)
            || !self.adapter.has_permission(Permission::Location)
        {
            let err = BluetoothError::PermissionDenied("Required permissions not granted".to_string());
            self.sink.error(err.clone());
            return Err(err);
        }

        if !self.adapter.is_enabled().await {
            self.sink.error(BluetoothError::AdapterDisabled);
            self.sink.status("Please enable Bluetooth");
            return Err(BluetoothError::AdapterDisabled);
        }

        let mut registration = self.registration.lock().await;

        if self.adapter.is_discovering().await {
            debug!("Scan already running, restarting");
            self.adapter.cancel_scan().await;
        }

        if registration.is_none() {
            *registration = Some(self.register()?);
        }

        let started = match self.adapter.start_scan().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BluetoothError::DiscoveryFailed(
                "Failed to start discovery".to_string(),
            )),
            Err(e) => Err(BluetoothError::DiscoveryFailed(format!(
                "Error during discovery: {}",
                e
            ))),
        };
        drop(registration);

        // bonded list is refreshed even when the scan itself failed
        self.refresh_bonded().await;

        match started {
            Ok(()) => {
                info!("Discovery started");
                Ok(())
            }
            Err(e) => {
                self.sink.error(e.clone());
                Err(e)
            }
        }
    }

    /// Cancel scanning and drop the found-device subscription. Safe to call
    /// when nothing is running.
    pub async fn stop(&self) {
        self.adapter.cancel_scan().await;

        let Some(registration) = self.registration.lock().await.take() else {
            return;
        };
        registration.pump.abort();
        if let Err(e) = self.events.unsubscribe(registration.id) {
            warn!("Unsubscribing found-device events failed: {}", e);
        }
        info!("Discovery stopped");
    }

    /// Whether the found-device subscription is registered.
    pub async fn is_registered(&self) -> bool {
        self.registration.lock().await.is_some()
    }

    /// Re-read the bonded list into the registry.
    pub async fn refresh_bonded(&self) {
        if !self.adapter.has_permission(Permission::Connect) {
            return;
        }
        match self.adapter.bonded_devices().await {
            Ok(devices) => self.registry.set_bonded(devices),
            Err(e) => warn!("Could not read bonded devices: {}", e),
        }
    }

    fn register(&self) -> Result<Registration> {
        let subscription = self.events.subscribe(SubscriptionKind::Discovery)?;
        let registry = self.registry.clone();
        let events = subscription.events;

        let pump = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let PlatformEvent::DeviceFound(device) = event {
                    registry.add_discovered(device);
                }
            }
            debug!("Found-device subscription closed");
        });

        debug!("Found-device subscription {:?} registered", subscription.id);
        Ok(Registration {
            id: subscription.id,
            pump,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::device::Device;
    use crate::bluetooth::stub::StubPlatform;
    use std::time::Duration;

    fn session(platform: &Arc<StubPlatform>) -> (DiscoverySession, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::new());
        let discovery = DiscoverySession::new(
            platform.clone(),
            platform.clone(),
            registry.clone(),
            EventSink::default(),
        );
        (discovery, registry)
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let platform = Arc::new(StubPlatform::new());
        platform.revoke(Permission::Location);
        let (discovery, _) = session(&platform);

        let err = discovery.start().await.unwrap_err();
        assert!(matches!(err, BluetoothError::PermissionDenied(_)));
        assert_eq!(platform.scan_starts(), 0);
        assert_eq!(platform.subscription_count(SubscriptionKind::Discovery), 0);
    }

    #[tokio::test]
    async fn test_adapter_disabled() {
        let platform = Arc::new(StubPlatform::new());
        platform.set_powered(false);
        let (discovery, _) = session(&platform);

        assert_eq!(discovery.start().await, Err(BluetoothError::AdapterDisabled));
        assert_eq!(platform.scan_starts(), 0);
    }

    #[tokio::test]
    async fn test_restart_does_not_leak_subscriptions() {
        let platform = Arc::new(StubPlatform::new());
        let (discovery, _) = session(&platform);

        discovery.start().await.unwrap();
        discovery.start().await.unwrap();

        assert_eq!(platform.scan_starts(), 2);
        assert_eq!(platform.scan_cancels(), 1);
        assert_eq!(platform.subscription_count(SubscriptionKind::Discovery), 1);
        assert!(platform.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let platform = Arc::new(StubPlatform::new());
        let (discovery, _) = session(&platform);

        discovery.stop().await;
        discovery.start().await.unwrap();
        discovery.stop().await;
        discovery.stop().await;

        assert!(!discovery.is_registered().await);
        assert!(!platform.is_scanning());
        assert_eq!(platform.subscription_count(SubscriptionKind::Discovery), 0);
    }

    #[tokio::test]
    async fn test_found_devices_reach_registry() {
        let platform = Arc::new(StubPlatform::new());
        let (discovery, registry) = session(&platform);
        discovery.start().await.unwrap();

        platform.emit(PlatformEvent::DeviceFound(Device::new("00:00:00:00:00:01", None)));
        platform.emit(PlatformEvent::DeviceFound(Device::new("00:00:00:00:00:01", None)));
        platform.emit(PlatformEvent::DeviceFound(Device::new("00:00:00:00:00:02", None)));

        let mut rx = registry.watch_discovered();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|list| list.len() == 2))
            .await
            .expect("devices routed")
            .unwrap();
        assert_eq!(registry.discovered().len(), 2);
    }

    #[tokio::test]
    async fn test_refused_scan_is_discovery_failure() {
        let platform = Arc::new(StubPlatform::new());
        platform.refuse_scans(true);
        platform.set_bonded(vec![Device::bonded("00:00:00:00:00:09", None)]);
        let (discovery, registry) = session(&platform);

        assert!(matches!(
            discovery.start().await,
            Err(BluetoothError::DiscoveryFailed(_))
        ));
        assert_eq!(registry.bonded().len(), 1);
    }
}
