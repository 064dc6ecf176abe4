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

//! In-memory platform for running the supervisor without a radio.

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use super::device::Device;
use super::platform::{
    AdapterPort, BoxedStream, EventSource, Permission, PlatformEvent, RfcommListener, SocketPort,
    Subscription, SubscriptionId, SubscriptionKind,
};
use crate::error::{BluetoothError, Result};

const STREAM_BUFFER: usize = 64 * 1024;

/// How a remote device answers an outbound connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Connection succeeds; the remote end is kept for [`StubPlatform::take_peer`].
    Accept,
    /// Connection is refused immediately.
    Refuse,
    /// Connect never completes.
    Hang,
}

type Inbound = (BoxedStream, String);

/// Scriptable stand-in for the OS Bluetooth stack.
///
/// Every device is refused unless told otherwise with
/// [`set_peer`](Self::set_peer).
pub struct StubPlatform {
    powered: AtomicBool,
    scanning: AtomicBool,
    refuse_scans: AtomicBool,
    revoked: Mutex<HashSet<Permission>>,
    bonded: Mutex<Vec<Device>>,
    peers: Mutex<HashMap<String, PeerBehavior>>,
    remote_ends: Mutex<HashMap<String, VecDeque<DuplexStream>>>,
    connect_log: Mutex<Vec<(String, Instant)>>,
    subscriptions: Mutex<HashMap<SubscriptionId, (SubscriptionKind, async_channel::Sender<PlatformEvent>)>>,
    next_subscription: AtomicU64,
    inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    scan_starts: AtomicUsize,
    scan_cancels: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
    live_listeners: Arc<AtomicUsize>,
}

impl StubPlatform {
    /// Powered adapter with every permission granted.
    pub fn new() -> Self {
        Self {
            powered: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
            refuse_scans: AtomicBool::new(false),
            revoked: Mutex::new(HashSet::new()),
            bonded: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            remote_ends: Mutex::new(HashMap::new()),
            connect_log: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            inbound: Mutex::new(None),
            scan_starts: AtomicUsize::new(0),
            scan_cancels: AtomicUsize::new(0),
            live_streams: Arc::new(AtomicUsize::new(0)),
            live_listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    // --- scripting ---

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn revoke(&self, permission: Permission) {
        self.revoked.lock().insert(permission);
    }

    pub fn grant(&self, permission: Permission) {
        self.revoked.lock().remove(&permission);
    }

    pub fn refuse_scans(&self, refuse: bool) {
        self.refuse_scans.store(refuse, Ordering::SeqCst);
    }

    pub fn set_bonded(&self, devices: Vec<Device>) {
        *self.bonded.lock() = devices;
    }

    pub fn set_peer(&self, address: &str, behavior: PeerBehavior) {
        self.peers.lock().insert(address.to_uppercase(), behavior);
    }

    /// Deliver an event to every subscription of its kind.
    pub fn emit(&self, event: PlatformEvent) {
        let kind = event.kind();
        for (sub_kind, tx) in self.subscriptions.lock().values() {
            if *sub_kind == kind {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    /// Remote end of the oldest accepted outbound connection to `address`.
    pub fn take_peer(&self, address: &str) -> Option<DuplexStream> {
        self.remote_ends
            .lock()
            .get_mut(&address.to_uppercase())
            .and_then(|queue| queue.pop_front())
    }

    /// Simulate a remote client connecting to the bound listener.
    ///
    /// Returns the client's end, or `None` when nothing is listening.
    pub fn dial_in(&self, address: &str) -> Option<DuplexStream> {
        let (local, remote) = duplex(STREAM_BUFFER);
        let tx = self.inbound.lock().clone()?;
        let stream = self.track(local);
        tx.send((stream, address.to_uppercase())).ok()?;
        Some(remote)
    }

    /// Make the next (and every later) accept call fail.
    pub fn fail_accept(&self) {
        self.inbound.lock().take();
    }

    // --- inspection ---

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.inbound
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scan_cancels(&self) -> usize {
        self.scan_cancels.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self, kind: SubscriptionKind) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Outbound connect calls, with the time each was made.
    pub fn connect_attempts(&self) -> Vec<(String, Instant)> {
        self.connect_log.lock().clone()
    }

    /// Local stream ends handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    pub fn live_listeners(&self) -> usize {
        self.live_listeners.load(Ordering::SeqCst)
    }

    fn track(&self, stream: DuplexStream) -> BoxedStream {
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        Box::new(TrackedStream {
            inner: stream,
            live: self.live_streams.clone(),
        })
    }
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterPort for StubPlatform {
    fn has_permission(&self, permission: Permission) -> bool {
        !self.revoked.lock().contains(&permission)
    }

    fn is_enabled(&self) -> BoxFuture<'_, bool> {
        future::ready(self.powered.load(Ordering::SeqCst)).boxed()
    }

    fn set_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<()>> {
        self.powered.store(enabled, Ordering::SeqCst);
        self.emit(PlatformEvent::AdapterPowered(enabled));
        future::ready(Ok(())).boxed()
    }

    fn is_discovering(&self) -> BoxFuture<'_, bool> {
        future::ready(self.is_scanning()).boxed()
    }

    fn start_scan(&self) -> BoxFuture<'_, Result<bool>> {
        if !self.powered.load(Ordering::SeqCst) {
            return future::ready(Err(BluetoothError::AdapterDisabled)).boxed();
        }
        if self.refuse_scans.load(Ordering::SeqCst) {
            return future::ready(Ok(false)).boxed();
        }
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        self.scanning.store(true, Ordering::SeqCst);
        future::ready(Ok(true)).boxed()
    }

    fn cancel_scan(&self) -> BoxFuture<'_, ()> {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.scan_cancels.fetch_add(1, Ordering::SeqCst);
        }
        future::ready(()).boxed()
    }

    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>> {
        future::ready(Ok(self.bonded.lock().clone())).boxed()
    }

    fn resolve<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Device>> {
        let valid = address.split(':').count() == 6
            && address
                .split(':')
                .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return future::ready(Err(BluetoothError::DeviceNotFound(address.to_string()))).boxed();
        }
        let known = self
            .bonded
            .lock()
            .iter()
            .find(|d| d.address() == address.to_uppercase())
            .cloned();
        future::ready(Ok(known.unwrap_or_else(|| Device::new(address, None)))).boxed()
    }
}

impl SocketPort for StubPlatform {
    fn listen<'a>(
        &'a self,
        service: Uuid,
        name: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn RfcommListener>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        self.live_listeners.fetch_add(1, Ordering::SeqCst);
        info!("[STUB] Listening as {} ({})", name, service);
        let listener: Box<dyn RfcommListener> = Box::new(StubListener {
            rx,
            live: self.live_listeners.clone(),
        });
        future::ready(Ok(listener)).boxed()
    }

    fn connect<'a>(&'a self, device: &'a Device, _service: Uuid) -> BoxFuture<'a, io::Result<BoxedStream>> {
        let address = device.address().to_string();
        self.connect_log.lock().push((address.clone(), Instant::now()));

        let behavior = self
            .peers
            .lock()
            .get(&address)
            .copied()
            .unwrap_or(PeerBehavior::Refuse);

        match behavior {
            PeerBehavior::Accept => {
                let (local, remote) = duplex(STREAM_BUFFER);
                self.remote_ends
                    .lock()
                    .entry(address)
                    .or_default()
                    .push_back(remote);
                future::ready(Ok(self.track(local))).boxed()
            }
            PeerBehavior::Refuse => future::ready(Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", address),
            )))
            .boxed(),
            PeerBehavior::Hang => future::pending::<io::Result<BoxedStream>>().boxed(),
        }
    }
}

impl EventSource for StubPlatform {
    fn subscribe(&self, kind: SubscriptionKind) -> Result<Subscription> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = async_channel::unbounded();
        self.subscriptions.lock().insert(id, (kind, tx));
        Ok(Subscription { id, events: rx })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        match self.subscriptions.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(BluetoothError::Socket(format!(
                "subscription {:?} is not registered",
                id
            ))),
        }
    }
}

struct StubListener {
    rx: mpsc::UnboundedReceiver<Inbound>,
    live: Arc<AtomicUsize>,
}

impl RfcommListener for StubListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(BoxedStream, String)>> {
        async move {
            self.rx
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "listener shut down"))
        }
        .boxed()
    }
}

impl Drop for StubListener {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Duplex stream that reports its own drop.
struct TrackedStream {
    inner: DuplexStream,
    live: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
