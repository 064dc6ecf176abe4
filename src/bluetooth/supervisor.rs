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

//! Connection supervisor.
//!
//! Owns the single active session, publishes state and results, and runs
//! link-loss recovery with bounded linear backoff.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::{Device, DeviceList, DeviceRegistry};
use super::discovery::DiscoverySession;
use super::platform::{Permission, PlatformEvent, Ports, SubscriptionId, SubscriptionKind};
use super::protocol::Message;
use super::retry::{retry_with_backoff, RetryPolicy};
use super::session::{
    ConnectionResult, ConnectionResults, ServiceOptions, SessionContext, SessionSlot,
    TransportSession,
};
use crate::error::{BluetoothError, Result};
use crate::events::{EventSink, SupervisorEvent};
use crate::state::ConnectionState;

/// Default pause between restarting discovery and reconnecting.
pub const DEFAULT_DISCOVERY_WARMUP: Duration = Duration::from_secs(5);

/// Supervisor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    pub service: ServiceOptions,
    /// Time given to rediscover the device before each recovery connect.
    pub discovery_warmup: Duration,
    pub retry: RetryPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            service: ServiceOptions::default(),
            discovery_warmup: DEFAULT_DISCOVERY_WARMUP,
            retry: RetryPolicy::default(),
        }
    }
}

struct LinkMonitor {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

/// Discovery, connection and recovery for one link.
pub struct ConnectionSupervisor {
    ctx: SessionContext,
    registry: Arc<DeviceRegistry>,
    options: SupervisorOptions,
    monitor: Mutex<Option<LinkMonitor>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    // drains a recovered session's results
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(ports: Ports, options: SupervisorOptions) -> Arc<Self> {
        let sink = EventSink::default();
        let registry = Arc::new(DeviceRegistry::new());
        let discovery = Arc::new(DiscoverySession::new(
            ports.adapter.clone(),
            ports.events.clone(),
            registry.clone(),
            sink.clone(),
        ));
        let ctx = SessionContext {
            ports,
            slot: Arc::new(SessionSlot::new(sink.clone())),
            discovery,
            sink,
            service: options.service.clone(),
        };

        Arc::new(Self {
            ctx,
            registry,
            options,
            monitor: Mutex::new(None),
            recovery: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    /// Read the bonded list and start watching link events.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if !self.ctx.ports.adapter.has_permission(Permission::Connect) {
            let err = BluetoothError::PermissionDenied(
                "Permission to connect to Bluetooth is not granted".to_string(),
            );
            self.ctx.sink.error(err.clone());
            return Err(err);
        }

        self.ctx.discovery.refresh_bonded().await;

        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Ok(());
        }

        let subscription = self.ctx.ports.events.subscribe(SubscriptionKind::LinkState)?;
        let events = subscription.events;
        let supervisor = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(supervisor) = Weak::upgrade(&supervisor) else {
                    break;
                };
                supervisor.on_platform_event(event).await;
            }
            debug!("Link event monitor stopped");
        });

        *monitor = Some(LinkMonitor {
            id: subscription.id,
            task,
        });
        info!("Supervisor initialized");
        Ok(())
    }

    async fn on_platform_event(self: &Arc<Self>, event: PlatformEvent) {
        match event {
            PlatformEvent::LinkChanged {
                address,
                connected: false,
            } => self.on_link_lost(&address),
            PlatformEvent::BondChanged { address, bonded } => {
                if !bonded {
                    self.on_link_lost(&address);
                }
                self.ctx.discovery.refresh_bonded().await;
            }
            PlatformEvent::AdapterPowered(powered) => {
                let status = if powered {
                    "Bluetooth turned on"
                } else {
                    "Bluetooth turned off"
                };
                self.ctx.sink.status(status);
            }
            other => debug!("Ignoring platform event {:?}", other),
        }
    }

    fn on_link_lost(self: &Arc<Self>, address: &str) {
        let Some(device) = self.ctx.slot.take_link_if(address) else {
            return;
        };
        warn!("Link to {} lost", device);
        self.ctx.slot.state().transition(ConnectionState::Disconnected);
        self.ctx
            .sink
            .status("Connection lost, attempting to reconnect...");
        // outcome is published on the sink
        let _ = self.start_recovery(device, self.options.retry);
    }

    /// Spawn the retry cycle as the supervisor's recovery task. The receiver
    /// errors if the task is cancelled before it finishes.
    fn start_recovery(
        self: &Arc<Self>,
        device: Device,
        policy: RetryPolicy,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let supervisor = self.clone();
        let task = tokio::spawn(async move {
            let result = supervisor.recover(device, policy).await;
            let _ = tx.send(result);
        });
        if let Some(previous) = self.recovery.lock().replace(task) {
            previous.abort();
        }
        rx
    }

    /// Run the retry protocol against `device` until it reconnects.
    async fn recover(&self, device: Device, policy: RetryPolicy) -> Result<()> {
        let result = retry_with_backoff(&policy, |attempt| {
            let device = device.clone();
            async move { self.recovery_attempt(device, attempt).await }
        })
        .await;

        match &result {
            Ok(()) => self.ctx.sink.status("Reconnection successful"),
            Err(e) => {
                if matches!(e, BluetoothError::RetryExhausted { .. }) {
                    self.ctx.sink.error(e.clone());
                }
                self.ctx.sink.status("Reconnection failed");
                self.ctx.slot.state().transition(ConnectionState::Disconnected);
            }
        }
        result
    }

    async fn recovery_attempt(&self, device: Device, attempt: u32) -> Result<()> {
        debug!("Recovery attempt {} for {}", attempt, device);
        self.ctx.slot.clear();

        if let Err(e) = self.ctx.discovery.start().await {
            if e.is_fatal() {
                return Err(e);
            }
        }
        tokio::time::sleep(self.options.discovery_warmup).await;

        if !self.ctx.ports.adapter.has_permission(Permission::Connect) {
            return Err(BluetoothError::PermissionDenied(
                "Permission to connect to Bluetooth is not granted".to_string(),
            ));
        }

        let mut results = TransportSession::client(self.ctx.clone(), device).into_results();
        let first = results.next().await;
        match first {
            Some(ConnectionResult::Established) => {
                let pump = tokio::spawn(async move {
                    while let Some(result) = results.next().await {
                        debug!("Recovered session result: {:?}", result);
                    }
                });
                if let Some(previous) = self.pump.lock().replace(pump) {
                    previous.abort();
                }
                Ok(())
            }
            Some(ConnectionResult::Failed(reason)) => Err(BluetoothError::Socket(reason)),
            _ => Err(BluetoothError::Socket(
                "connection ended before it was established".to_string(),
            )),
        }
    }

    /// Explicitly re-run the retry protocol against the last attempted
    /// device. `retries` overrides the configured attempt count.
    ///
    /// Runs as the recovery task, so `close()` or a new connect ends it
    /// with [`BluetoothError::Closed`].
    pub async fn reconnect_last(self: &Arc<Self>, retries: Option<u32>) -> Result<()> {
        let Some(device) = self.ctx.slot.last_device() else {
            let err = BluetoothError::DeviceNotFound("No device to reconnect".to_string());
            self.ctx.sink.error(err.clone());
            return Err(err);
        };

        self.cancel_background();
        let mut policy = self.options.retry;
        if let Some(retries) = retries {
            policy.max_attempts = retries;
        }
        self.start_recovery(device, policy)
            .await
            .unwrap_or(Err(BluetoothError::Closed))
    }

    pub async fn start_discovery(&self) -> Result<()> {
        self.ctx.discovery.start().await
    }

    pub async fn stop_discovery(&self) {
        self.ctx.discovery.stop().await
    }

    pub async fn refresh_bonded(&self) {
        self.ctx.discovery.refresh_bonded().await
    }

    /// Connect to `device` as client. Failures are reported once, never
    /// retried.
    pub fn connect(&self, device: &Device) -> ConnectionResults {
        self.cancel_background();
        TransportSession::client(self.ctx.clone(), device.clone()).into_results()
    }

    /// Accept inbound connections. Replaces any earlier listener and stops
    /// recovery.
    pub fn listen(&self) -> ConnectionResults {
        self.cancel_background();
        TransportSession::server(self.ctx.clone()).into_results()
    }

    /// Send on the active session. `false` when there is none or the write
    /// fails.
    pub async fn send(&self, message: &Message) -> bool {
        let Some(transport) = self.ctx.slot.transport() else {
            warn!("Send failed: {}", BluetoothError::NotConnected);
            return false;
        };
        transport.send(message).await
    }

    /// Close the active session and stop recovery. Safe with nothing open.
    pub fn close(&self) {
        self.cancel_background();
        self.ctx.slot.interrupt_listeners();
        self.ctx.slot.clear();
        self.ctx.slot.state().transition(ConnectionState::Disconnected);
    }

    /// Drop every event subscription, then close. Idempotent.
    pub async fn release(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.task.abort();
            if let Err(e) = self.ctx.ports.events.unsubscribe(monitor.id) {
                debug!("Link events already unsubscribed: {}", e);
            }
        }
        self.ctx.discovery.stop().await;
        self.close();
    }

    fn cancel_background(&self) {
        if let Some(task) = self.recovery.lock().take() {
            task.abort();
        }
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }

    pub async fn request_enable(&self) -> Result<()> {
        self.request_power(true).await
    }

    pub async fn request_disable(&self) -> Result<()> {
        self.request_power(false).await
    }

    async fn request_power(&self, enable: bool) -> Result<()> {
        let adapter = &self.ctx.ports.adapter;
        if !adapter.has_permission(Permission::Connect) {
            let err = BluetoothError::PermissionDenied(
                "Permission to connect to Bluetooth is not granted".to_string(),
            );
            self.ctx.sink.error(err.clone());
            return Err(err);
        }

        if adapter.is_enabled().await == enable {
            let status = if enable {
                "Bluetooth is already enabled"
            } else {
                "Bluetooth is already disabled"
            };
            self.ctx.sink.status(status);
            return Ok(());
        }

        self.ctx.sink.status(if enable {
            "Requesting to enable Bluetooth..."
        } else {
            "Requesting to disable Bluetooth..."
        });
        adapter.set_enabled(enable).await.map_err(|e| {
            self.ctx.sink.error(e.clone());
            e
        })
    }

    pub async fn is_enabled(&self) -> bool {
        self.ctx.ports.adapter.is_enabled().await
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.slot.state().get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.slot.state().watch()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.ctx.slot.state().watch_connected()
    }

    /// Device of the latest connect attempt, successful or not.
    pub fn last_connected_device(&self) -> Option<Device> {
        self.ctx.slot.last_device()
    }

    pub fn discovered_devices(&self) -> DeviceList {
        self.registry.discovered()
    }

    pub fn bonded_devices(&self) -> DeviceList {
        self.registry.bonded()
    }

    pub fn watch_discovered(&self) -> watch::Receiver<DeviceList> {
        self.registry.watch_discovered()
    }

    pub fn watch_bonded(&self) -> watch::Receiver<DeviceList> {
        self.registry.watch_bonded()
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.ctx.sink.subscribe()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.task.abort();
            if let Err(e) = self.ctx.ports.events.unsubscribe(monitor.id) {
                debug!("Link events already unsubscribed: {}", e);
            }
        }
        if let Some(task) = self.pump.get_mut().take() {
            task.abort();
        }
        self.ctx.slot.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::stub::{PeerBehavior, StubPlatform};

    const PEER: &str = "AA:BB:CC:DD:EE:01";

    fn supervisor(platform: &Arc<StubPlatform>) -> Arc<ConnectionSupervisor> {
        ConnectionSupervisor::new(
            Ports::from_platform(platform.clone()),
            SupervisorOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_initialize_requires_connect_permission() {
        let platform = Arc::new(StubPlatform::new());
        platform.revoke(Permission::Connect);
        let sup = supervisor(&platform);
        assert!(matches!(
            sup.initialize().await,
            Err(BluetoothError::PermissionDenied(_))
        ));
        assert_eq!(platform.subscription_count(SubscriptionKind::LinkState), 0);
    }

    #[tokio::test]
    async fn test_initialize_subscribes_once() {
        let platform = Arc::new(StubPlatform::new());
        platform.set_bonded(vec![Device::bonded(PEER, Some("Phone".into()))]);
        let sup = supervisor(&platform);

        sup.initialize().await.unwrap();
        sup.initialize().await.unwrap();
        assert_eq!(platform.subscription_count(SubscriptionKind::LinkState), 1);
        assert_eq!(sup.bonded_devices().len(), 1);

        sup.release().await;
        sup.release().await;
        assert_eq!(platform.subscription_count(SubscriptionKind::LinkState), 0);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_link_events() {
        let platform = Arc::new(StubPlatform::new());
        let sup = supervisor(&platform);
        sup.initialize().await.unwrap();
        assert_eq!(platform.subscription_count(SubscriptionKind::LinkState), 1);

        drop(sup);
        assert_eq!(platform.subscription_count(SubscriptionKind::LinkState), 0);
    }

    #[tokio::test]
    async fn test_request_enable_when_already_on() {
        let platform = Arc::new(StubPlatform::new());
        let sup = supervisor(&platform);
        let mut events = sup.events();

        sup.request_enable().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SupervisorEvent::Status("Bluetooth is already enabled".to_string())
        );

        sup.request_disable().await.unwrap();
        assert!(!sup.is_enabled().await);
    }

    #[tokio::test]
    async fn test_reconnect_without_history() {
        let platform = Arc::new(StubPlatform::new());
        let sup = supervisor(&platform);
        assert!(matches!(
            sup.reconnect_last(None).await,
            Err(BluetoothError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_without_session() {
        let platform = Arc::new(StubPlatform::new());
        let sup = supervisor(&platform);
        sup.close();
        sup.close();
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_event_for_other_device_is_ignored() {
        let platform = Arc::new(StubPlatform::new());
        platform.set_peer(PEER, PeerBehavior::Accept);
        let sup = supervisor(&platform);
        sup.initialize().await.unwrap();

        let mut results = sup.connect(&Device::new(PEER, None));
        assert_eq!(results.next().await, Some(ConnectionResult::Established));

        sup.on_platform_event(PlatformEvent::LinkChanged {
            address: "AA:BB:CC:DD:EE:99".to_string(),
            connected: false,
        })
        .await;
        assert!(!sup.is_recovering());
        assert_eq!(sup.state(), ConnectionState::Connected);
    }
}
