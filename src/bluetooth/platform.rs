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

//! Capability ports consumed from the operating system.
//!
//! The supervisor never talks to the Bluetooth stack directly. It is handed
//! a [`Ports`] bundle at construction and goes through these traits for
//! adapter queries, raw sockets and event delivery.

use futures::future::BoxFuture;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::device::Device;
use crate::error::Result;

/// Capability grants checked before touching the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Scan,
    Connect,
    Location,
}

/// Reliable, ordered byte stream to a peer.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased raw stream.
pub type BoxedStream = Box<dyn RawStream>;

/// Adapter queries and control.
pub trait AdapterPort: Send + Sync {
    fn has_permission(&self, permission: Permission) -> bool;

    fn is_enabled(&self) -> BoxFuture<'_, bool>;

    /// Ask the OS to switch the radio on or off.
    fn set_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<()>>;

    fn is_discovering(&self) -> BoxFuture<'_, bool>;

    /// Issue a scan request. `Ok(false)` means the OS refused to start it.
    fn start_scan(&self) -> BoxFuture<'_, Result<bool>>;

    fn cancel_scan(&self) -> BoxFuture<'_, ()>;

    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>>;

    /// Resolve an address to a remote device handle.
    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Device>>;
}

/// Accepts inbound connections for one service record.
pub trait RfcommListener: Send {
    /// Wait for the next inbound connection. Returns the stream and the
    /// remote address.
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxedStream, String)>>;
}

/// Raw stream establishment.
pub trait SocketPort: Send + Sync {
    fn listen<'a>(
        &'a self,
        service: Uuid,
        name: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn RfcommListener>>>;

    fn connect<'a>(&'a self, device: &'a Device, service: Uuid) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Which event family a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Found-device events while scanning.
    Discovery,
    /// Adapter power, link and bond changes.
    LinkState,
}

/// Events delivered by the OS layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    DeviceFound(Device),
    LinkChanged { address: String, connected: bool },
    BondChanged { address: String, bonded: bool },
    AdapterPowered(bool),
}

impl PlatformEvent {
    pub fn kind(&self) -> SubscriptionKind {
        match self {
            PlatformEvent::DeviceFound(_) => SubscriptionKind::Discovery,
            _ => SubscriptionKind::LinkState,
        }
    }
}

/// Handle identifying a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live event subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: async_channel::Receiver<PlatformEvent>,
}

/// Explicit subscribe/unsubscribe event delivery.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, kind: SubscriptionKind) -> Result<Subscription>;

    /// Fails if the id is not registered.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// The capability bundle a supervisor is built from.
#[derive(Clone)]
pub struct Ports {
    pub adapter: Arc<dyn AdapterPort>,
    pub sockets: Arc<dyn SocketPort>,
    pub events: Arc<dyn EventSource>,
}

impl Ports {
    /// Use one platform object for every port.
    pub fn from_platform<P>(platform: Arc<P>) -> Self
    where
        P: AdapterPort + SocketPort + EventSource + 'static,
    {
        Self {
            adapter: platform.clone(),
            sockets: platform.clone(),
            events: platform,
        }
    }
}
