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

//! BlueZ platform backed by bluer.

use anyhow::Result as AnyResult;
use bluer::rfcomm::{ConnectRequest, Profile, ProfileHandle};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session};
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::Device;
use super::platform::{
    AdapterPort, BoxedStream, EventSource, Permission, PlatformEvent, RfcommListener, SocketPort,
    Subscription, SubscriptionId, SubscriptionKind,
};
use super::protocol::SERVICE_NAME;
use crate::error::{BluetoothError, Result};

type Subscribers =
    Arc<Mutex<HashMap<SubscriptionId, (SubscriptionKind, async_channel::Sender<PlatformEvent>)>>>;

fn emit(subscribers: &Subscribers, event: PlatformEvent) {
    let kind = event.kind();
    for (sub_kind, tx) in subscribers.lock().values() {
        if *sub_kind == kind {
            let _ = tx.try_send(event.clone());
        }
    }
}

fn bluer_err(e: bluer::Error) -> BluetoothError {
    BluetoothError::Socket(e.to_string())
}

fn io_err(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

async fn to_device(adapter: &Adapter, addr: Address) -> bluer::Result<Device> {
    let remote = adapter.device(addr)?;
    let name = remote.name().await.unwrap_or(None);
    let paired = remote.is_paired().await.unwrap_or(false);
    Ok(if paired {
        Device::bonded(addr.to_string(), name)
    } else {
        Device::new(addr.to_string(), name)
    })
}

/// Turns connection and pairing changes of remote devices into link events.
#[derive(Clone)]
struct DeviceWatcher {
    adapter: Adapter,
    subscribers: Subscribers,
    watches: Arc<Mutex<HashMap<Address, JoinHandle<()>>>>,
}

impl DeviceWatcher {
    fn watch(&self, addr: Address) {
        let mut watches = self.watches.lock();
        if watches.get(&addr).map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let adapter = self.adapter.clone();
        let subscribers = self.subscribers.clone();
        let task = tokio::spawn(async move {
            let remote = match adapter.device(addr) {
                Ok(remote) => remote,
                Err(e) => {
                    warn!("Cannot watch {}: {}", addr, e);
                    return;
                }
            };
            let mut events = match remote.events().await {
                Ok(events) => Box::pin(events),
                Err(e) => {
                    warn!("Cannot watch {}: {}", addr, e);
                    return;
                }
            };
            while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
                let event = match property {
                    DeviceProperty::Connected(connected) => PlatformEvent::LinkChanged {
                        address: addr.to_string(),
                        connected,
                    },
                    DeviceProperty::Paired(bonded) => PlatformEvent::BondChanged {
                        address: addr.to_string(),
                        bonded,
                    },
                    _ => continue,
                };
                debug!("{:?}", event);
                emit(&subscribers, event);
            }
        });
        watches.insert(addr, task);
    }

    fn stop_all(&self) {
        for (_, task) in self.watches.lock().drain() {
            task.abort();
        }
    }
}

/// Destinations for connect requests arriving on a profile.
struct Routes<R> {
    pending: Mutex<HashMap<Address, oneshot::Sender<R>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<R>>>,
}

impl<R> Routes<R> {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(None),
        }
    }

    /// Claim the next request from `addr` for an outbound connect.
    fn expect(&self, addr: Address) -> oneshot::Receiver<R> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(addr, tx);
        rx
    }

    fn forget(&self, addr: Address) {
        self.pending.lock().remove(&addr);
    }

    /// Route unclaimed requests to a new listener, replacing the old one.
    fn listen(&self) -> mpsc::UnboundedReceiver<R> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        rx
    }

    /// Deliver `request` from `addr`. Hands it back when nobody takes it.
    fn dispatch(&self, addr: Address, request: R) -> Option<R> {
        // an outbound connect waiting on this device gets it first
        let claimed = self.pending.lock().remove(&addr);
        let request = match claimed {
            Some(tx) => match tx.send(request) {
                Ok(()) => return None,
                Err(request) => request,
            },
            None => request,
        };
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.send(request).err().map(|e| e.0),
            None => Some(request),
        }
    }
}

/// One registered profile per service UUID, shared by both directions.
///
/// BlueZ refuses a second registration of the same UUID, and unregistering
/// a profile tears down its connections, so the handle lives here for as
/// long as the platform does.
struct ProfileRouter {
    task: JoinHandle<()>,
    routes: Arc<Routes<ConnectRequest>>,
}

impl ProfileRouter {
    fn spawn(mut handle: ProfileHandle, service: Uuid) -> Self {
        let routes = Arc::new(Routes::new());
        let task = {
            let routes = routes.clone();
            tokio::spawn(async move {
                while let Some(request) = handle.next().await {
                    let addr = request.device();
                    if routes.dispatch(addr, request).is_some() {
                        debug!("No taker on {}; dropping request from {}", service, addr);
                    }
                }
                debug!("Profile {} unregistered", service);
            })
        };
        Self { task, routes }
    }
}

/// The default BlueZ adapter as a platform.
pub struct BluezPlatform {
    session: Session,
    adapter: Adapter,
    subscribers: Subscribers,
    next_id: AtomicU64,
    scan: Mutex<Option<JoinHandle<()>>>,
    adapter_watch: Mutex<Option<JoinHandle<()>>>,
    devices: DeviceWatcher,
    profiles: AsyncMutex<HashMap<Uuid, ProfileRouter>>,
}

impl BluezPlatform {
    pub async fn new() -> AnyResult<Self> {
        info!("Initializing BlueZ platform...");

        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let devices = DeviceWatcher {
            adapter: adapter.clone(),
            subscribers: subscribers.clone(),
            watches: Arc::new(Mutex::new(HashMap::new())),
        };

        Ok(Self {
            session,
            adapter,
            subscribers,
            next_id: AtomicU64::new(1),
            scan: Mutex::new(None),
            adapter_watch: Mutex::new(None),
            devices,
            profiles: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    fn watch_adapter(&self) {
        let mut watch = self.adapter_watch.lock();
        if watch.is_some() {
            return;
        }
        let adapter = self.adapter.clone();
        let subscribers = self.subscribers.clone();
        *watch = Some(tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => Box::pin(events),
                Err(e) => {
                    warn!("Cannot watch adapter: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    emit(&subscribers, PlatformEvent::AdapterPowered(powered));
                }
            }
        }));
    }

    /// Register the profile for `service` on first use and run `f` on its
    /// router.
    async fn with_profile<T>(
        &self,
        service: Uuid,
        name: &str,
        f: impl FnOnce(&ProfileRouter) -> T,
    ) -> io::Result<T> {
        let mut profiles = self.profiles.lock().await;
        if profiles.get(&service).map(|r| r.task.is_finished()).unwrap_or(true) {
            // no role: the profile both accepts and initiates
            let profile = Profile {
                uuid: service,
                name: Some(name.to_string()),
                require_authentication: Some(false),
                require_authorization: Some(false),
                auto_connect: Some(false),
                ..Default::default()
            };
            let handle = self.session.register_profile(profile).await.map_err(io_err)?;
            info!("RFCOMM profile {} registered", service);
            profiles.insert(service, ProfileRouter::spawn(handle, service));
        }
        match profiles.get(&service) {
            Some(router) => Ok(f(router)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "profile not registered")),
        }
    }
}

impl AdapterPort for BluezPlatform {
    // BlueZ has no runtime grants; D-Bus policy is enforced per call
    fn has_permission(&self, _permission: Permission) -> bool {
        true
    }

    fn is_enabled(&self) -> BoxFuture<'_, bool> {
        async move { self.adapter.is_powered().await.unwrap_or(false) }.boxed()
    }

    fn set_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<()>> {
        async move {
            info!("Setting adapter power: {}", enabled);
            self.adapter.set_powered(enabled).await.map_err(bluer_err)
        }
        .boxed()
    }

    fn is_discovering(&self) -> BoxFuture<'_, bool> {
        async move {
            let scanning = self
                .scan
                .lock()
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false);
            scanning || self.adapter.is_discovering().await.unwrap_or(false)
        }
        .boxed()
    }

    fn start_scan(&self) -> BoxFuture<'_, Result<bool>> {
        async move {
            if !self.adapter.is_powered().await.map_err(bluer_err)? {
                return Err(BluetoothError::AdapterDisabled);
            }
            let mut found = match self.adapter.discover_devices().await {
                Ok(found) => Box::pin(found),
                Err(e) => {
                    warn!("Discovery refused: {}", e);
                    return Ok(false);
                }
            };

            let adapter = self.adapter.clone();
            let subscribers = self.subscribers.clone();
            let task = tokio::spawn(async move {
                // discovery runs for as long as `found` is alive
                while let Some(event) = found.next().await {
                    if let AdapterEvent::DeviceAdded(addr) = event {
                        match to_device(&adapter, addr).await {
                            Ok(device) => emit(&subscribers, PlatformEvent::DeviceFound(device)),
                            Err(e) => debug!("Skipping {}: {}", addr, e),
                        }
                    }
                }
            });
            if let Some(previous) = self.scan.lock().replace(task) {
                previous.abort();
            }
            Ok(true)
        }
        .boxed()
    }

    fn cancel_scan(&self) -> BoxFuture<'_, ()> {
        if let Some(task) = self.scan.lock().take() {
            task.abort();
            debug!("Discovery cancelled");
        }
        futures::future::ready(()).boxed()
    }

    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>> {
        async move {
            let mut devices = Vec::new();
            for addr in self.adapter.device_addresses().await.map_err(bluer_err)? {
                let device = to_device(&self.adapter, addr).await.map_err(bluer_err)?;
                if device.is_bonded() {
                    devices.push(device);
                }
            }
            Ok(devices)
        }
        .boxed()
    }

    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Device>> {
        async move {
            let addr: Address = address
                .parse()
                .map_err(|_| BluetoothError::DeviceNotFound(address.to_string()))?;
            to_device(&self.adapter, addr)
                .await
                .map_err(|_| BluetoothError::DeviceNotFound(address.to_string()))
        }
        .boxed()
    }
}

struct ProfileListener {
    requests: mpsc::UnboundedReceiver<ConnectRequest>,
    devices: DeviceWatcher,
}

impl RfcommListener for ProfileListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxedStream, String)>> {
        async move {
            let request = self.requests.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "profile unregistered")
            })?;
            let addr = request.device();
            let stream = request.accept().map_err(io_err)?;
            self.devices.watch(addr);
            let stream: BoxedStream = Box::new(stream);
            Ok((stream, addr.to_string()))
        }
        .boxed()
    }
}

impl SocketPort for BluezPlatform {
    fn listen<'a>(
        &'a self,
        service: Uuid,
        name: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn RfcommListener>>> {
        async move {
            let requests = self
                .with_profile(service, name, |router| router.routes.listen())
                .await?;
            info!("Listening on RFCOMM profile {}", service);
            let listener: Box<dyn RfcommListener> = Box::new(ProfileListener {
                requests,
                devices: self.devices.clone(),
            });
            Ok(listener)
        }
        .boxed()
    }

    fn connect<'a>(&'a self, device: &'a Device, service: Uuid) -> BoxFuture<'a, io::Result<BoxedStream>> {
        async move {
            let addr: Address = device
                .address()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad address"))?;
            let remote = self.adapter.device(addr).map_err(io_err)?;

            let (routes, rx) = self
                .with_profile(service, SERVICE_NAME, |router| {
                    (router.routes.clone(), router.routes.expect(addr))
                })
                .await?;

            if let Err(e) = remote.connect_profile(&service).await {
                routes.forget(addr);
                return Err(io_err(e));
            }

            // BlueZ hands the new socket back through the profile
            let request = rx.await.map_err(|_| {
                io::Error::new(io::ErrorKind::ConnectionAborted, "profile closed before connecting")
            })?;
            let stream = request.accept().map_err(io_err)?;
            self.devices.watch(addr);
            let stream: BoxedStream = Box::new(stream);
            Ok(stream)
        }
        .boxed()
    }
}

impl EventSource for BluezPlatform {
    fn subscribe(&self, kind: SubscriptionKind) -> Result<Subscription> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().insert(id, (kind, tx));
        if kind == SubscriptionKind::LinkState {
            self.watch_adapter();
        }
        Ok(Subscription { id, events: rx })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subscribers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BluetoothError::Socket(format!("subscription {:?} is not registered", id)))
    }
}

impl Drop for BluezPlatform {
    fn drop(&mut self) {
        if let Some(task) = self.scan.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.adapter_watch.get_mut().take() {
            task.abort();
        }
        self.devices.stop_all();
        for (_, router) in self.profiles.get_mut().drain() {
            router.task.abort();
        }
    }
}
