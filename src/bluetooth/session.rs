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

//! Client and server connection flows and the single active-session slot.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::device::Device;
use super::discovery::DiscoverySession;
use super::platform::{BoxedStream, Permission, Ports, RfcommListener};
use super::protocol::{Message, SERVICE_NAME, SERVICE_UUID};
use super::transport::{FrameTransport, IncomingMessages};
use crate::error::{BluetoothError, Result};
use crate::events::EventSink;
use crate::state::{ConnectionState, StateCell};

/// Default bound on an outbound connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome reported by a connect or listen sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    Established,
    MessageReceived(Message),
    Failed(String),
}

/// Result sequence of one connect or listen call.
///
/// Dropping it closes the session it opened.
pub type ConnectionResults = BoxStream<'static, ConnectionResult>;

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle of one connection attempt. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Service the two sides rendezvous on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub uuid: Uuid,
    pub name: String,
    pub connect_timeout: Duration,
    /// Return to accepting after a server-side connection ends.
    pub keep_listening: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            uuid: SERVICE_UUID,
            name: SERVICE_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_listening: false,
        }
    }
}

struct ActiveSession {
    id: u64,
    role: Role,
    transport: Arc<FrameTransport>,
}

/// Holder of the one active session.
///
/// Also owns the published connection state, the device last attempted and
/// the device of the last established link that was not closed locally.
pub struct SessionSlot {
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
    state: StateCell,
    last_device: RwLock<Option<Device>>,
    link: Mutex<Option<Device>>,
    // bumped whenever pending accepts must give up
    listeners: watch::Sender<u64>,
}

impl SessionSlot {
    pub fn new(sink: EventSink) -> Self {
        let (listeners, _) = watch::channel(0);
        Self {
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            state: StateCell::new(sink),
            last_device: RwLock::new(None),
            link: Mutex::new(None),
            listeners,
        }
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    /// Make `transport` the active session, closing the previous one first.
    pub fn install(&self, role: Role, transport: Arc<FrameTransport>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            info!("Replacing {:?} session with {}", previous.role, previous.transport.peer());
            previous.transport.close();
        }
        *active = Some(ActiveSession { id, role, transport });
        id
    }

    /// End session `id` if it is still the active one.
    ///
    /// A session ended by its peer keeps the link record so a following
    /// link-loss event can still be matched.
    pub fn end_session(&self, id: u64, peer_ended: bool) -> bool {
        let ended = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(session) if session.id == id => active.take(),
                _ => None,
            }
        };
        let Some(session) = ended else {
            return false;
        };

        session.transport.close();
        if !peer_ended {
            self.link.lock().take();
        }
        self.state.transition(ConnectionState::Disconnected);
        true
    }

    /// Close whatever session is active and forget the link.
    pub fn clear(&self) {
        if let Some(session) = self.active.lock().take() {
            debug!("Clearing {:?} session with {}", session.role, session.transport.peer());
            session.transport.close();
        }
        self.link.lock().take();
    }

    pub fn transport(&self) -> Option<Arc<FrameTransport>> {
        self.active.lock().as_ref().map(|s| s.transport.clone())
    }

    pub fn has_active(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn active_role(&self) -> Option<Role> {
        self.active.lock().as_ref().map(|s| s.role)
    }

    fn record_attempt(&self, device: Device) {
        *self.last_device.write() = Some(device);
    }

    pub fn last_device(&self) -> Option<Device> {
        self.last_device.read().clone()
    }

    fn set_link(&self, device: Device) {
        *self.link.lock() = Some(device);
    }

    pub fn link(&self) -> Option<Device> {
        self.link.lock().clone()
    }

    /// Take the link record if it names `address`.
    pub fn take_link_if(&self, address: &str) -> Option<Device> {
        let mut link = self.link.lock();
        match link.as_ref() {
            Some(device) if device.address().eq_ignore_ascii_case(address) => link.take(),
            _ => None,
        }
    }

    /// Make every pending accept give up. Returns the new generation.
    pub fn interrupt_listeners(&self) -> u64 {
        let mut generation = 0;
        self.listeners.send_modify(|g| {
            *g += 1;
            generation = *g;
        });
        generation
    }
}

/// Ends its session when dropped.
struct SessionGuard {
    slot: Weak<SessionSlot>,
    id: u64,
    peer_ended: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            if slot.end_session(self.id, self.peer_ended) {
                debug!("Session {} released", self.id);
            }
        }
    }
}

/// Everything a connection flow needs from its supervisor.
#[derive(Clone)]
pub struct SessionContext {
    pub ports: Ports,
    pub slot: Arc<SessionSlot>,
    pub discovery: Arc<DiscoverySession>,
    pub sink: EventSink,
    pub service: ServiceOptions,
}

enum Phase {
    Start,
    Accepting,
    Streaming {
        incoming: IncomingMessages,
        guard: SessionGuard,
    },
    Done,
}

/// One connect (client) or listen (server) sequence.
pub struct TransportSession {
    ctx: SessionContext,
    role: Role,
    target: Option<Device>,
    state: SessionState,
    phase: Phase,
    listener: Option<Box<dyn RfcommListener>>,
    generation: u64,
    interrupts: watch::Receiver<u64>,
}

impl TransportSession {
    /// Outbound connection to `target`.
    pub fn client(ctx: SessionContext, target: Device) -> Self {
        Self::new(ctx, Role::Client, Some(target))
    }

    /// Listener for inbound connections. Supersedes any older listener.
    pub fn server(ctx: SessionContext) -> Self {
        ctx.slot.interrupt_listeners();
        Self::new(ctx, Role::Server, None)
    }

    fn new(ctx: SessionContext, role: Role, target: Option<Device>) -> Self {
        let interrupts = ctx.slot.listeners.subscribe();
        let generation = *interrupts.borrow();
        Self {
            ctx,
            role,
            target,
            state: SessionState::Idle,
            phase: Phase::Start,
            listener: None,
            generation,
            interrupts,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the sequence. Every result is also published on the sink.
    pub fn into_results(self) -> ConnectionResults {
        let sink = self.ctx.sink.clone();
        stream::unfold(self, |session| session.step())
            .inspect(move |result| sink.result(result.clone()))
            .boxed()
    }

    async fn step(mut self) -> Option<(ConnectionResult, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Start => {
                    let opened = match self.role {
                        Role::Client => self.open_client().await.map(Some),
                        Role::Server => self.bind().await.map(|()| None),
                    };
                    match opened {
                        Ok(Some(phase)) => {
                            self.phase = phase;
                            return Some((ConnectionResult::Established, self));
                        }
                        Ok(None) => self.phase = Phase::Accepting,
                        Err(BluetoothError::Closed) => {
                            self.state = SessionState::Closed;
                            return None;
                        }
                        Err(e) => return Some(self.fail(e)),
                    }
                }
                Phase::Accepting => match self.accept().await {
                    Ok(Some(phase)) => {
                        self.phase = phase;
                        return Some((ConnectionResult::Established, self));
                    }
                    Ok(None) => {
                        self.state = SessionState::Closed;
                        return None;
                    }
                    Err(e) => return Some(self.fail(e)),
                },
                Phase::Streaming {
                    mut incoming,
                    mut guard,
                } => match incoming.next().await {
                    Some(Ok(message)) => {
                        debug!(
                            "Message from {} ({} bytes)",
                            message.sender_id,
                            message.payload.len()
                        );
                        self.phase = Phase::Streaming { incoming, guard };
                        return Some((ConnectionResult::MessageReceived(message), self));
                    }
                    Some(Err(BluetoothError::Closed)) => {
                        debug!("Session closed locally");
                        self.state = SessionState::Closed;
                        return None;
                    }
                    None => {
                        guard.peer_ended = true;
                        drop(incoming);
                        drop(guard);
                        self.state = SessionState::Closed;
                        if self.listen_again() {
                            self.phase = Phase::Accepting;
                            continue;
                        }
                        return None;
                    }
                    Some(Err(e)) => {
                        guard.peer_ended = true;
                        drop(incoming);
                        drop(guard);
                        return Some(self.fail(e));
                    }
                },
                Phase::Done => return None,
            }
        }
    }

    fn fail(mut self, err: BluetoothError) -> (ConnectionResult, Self) {
        self.state = SessionState::Failed;
        self.phase = Phase::Done;
        self.listener = None;
        self.ctx.sink.error(err.clone());
        (ConnectionResult::Failed(err.to_string()), self)
    }

    fn require_connect_permission(&self) -> Result<()> {
        if self.ctx.ports.adapter.has_permission(Permission::Connect) {
            Ok(())
        } else {
            Err(BluetoothError::PermissionDenied(
                "Permission to connect to Bluetooth is not granted".to_string(),
            ))
        }
    }

    async fn open_client(&mut self) -> Result<Phase> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| BluetoothError::DeviceNotFound("no target".to_string()))?;

        // every attempt starts from an empty slot, even one that fails early
        let slot = self.ctx.slot.clone();
        slot.record_attempt(target.clone());
        self.ctx.discovery.stop().await;
        slot.clear();
        slot.state().transition(ConnectionState::Disconnected);

        self.require_connect_permission()?;
        let device = self.ctx.ports.adapter.resolve(target.address()).await?;

        self.state = SessionState::Connecting;
        slot.state().transition(ConnectionState::Connecting);
        info!("Connecting to {}", device);

        let timeout = self.ctx.service.connect_timeout;
        let connect = self.ctx.ports.sockets.connect(&device, self.ctx.service.uuid);
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                slot.state().transition(ConnectionState::Disconnected);
                return Err(e.into());
            }
            Err(_) => {
                slot.state().transition(ConnectionState::Disconnected);
                return Err(BluetoothError::Timeout(timeout));
            }
        };

        Ok(self.establish(stream, device))
    }

    async fn bind(&mut self) -> Result<()> {
        self.require_connect_permission()?;
        if self.superseded() {
            return Err(BluetoothError::Closed);
        }
        let listener = self
            .ctx
            .ports
            .sockets
            .listen(self.ctx.service.uuid, &self.ctx.service.name)
            .await?;
        info!(
            "Listening for {} ({})",
            self.ctx.service.name, self.ctx.service.uuid
        );
        self.listener = Some(listener);
        Ok(())
    }

    /// Wait for the next inbound connection. `Ok(None)` when superseded.
    async fn accept(&mut self) -> Result<Option<Phase>> {
        let generation = self.generation;
        let Some(listener) = self.listener.as_mut() else {
            return Ok(None);
        };

        let accepted = tokio::select! {
            biased;
            _ = superseded(&mut self.interrupts, generation) => {
                info!("Listener interrupted");
                return Ok(None);
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, address)) => {
                info!("Connection from {}", address);
                self.state = SessionState::Connecting;
                Ok(Some(self.establish(stream, Device::new(address, None))))
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                self.listener = None;
                Err(e.into())
            }
        }
    }

    fn establish(&mut self, stream: BoxedStream, device: Device) -> Phase {
        let slot = &self.ctx.slot;
        let transport = Arc::new(FrameTransport::new(stream, device.address()));
        let incoming = transport.incoming();
        let id = slot.install(self.role, transport);
        slot.set_link(device.clone());
        slot.state().transition(ConnectionState::Connected);
        self.state = SessionState::Connected;
        info!("Connected to {} as {:?}", device, self.role);

        Phase::Streaming {
            incoming,
            guard: SessionGuard {
                slot: Arc::downgrade(slot),
                id,
                peer_ended: false,
            },
        }
    }

    fn superseded(&self) -> bool {
        *self.interrupts.borrow() != self.generation
    }

    fn listen_again(&self) -> bool {
        if self.role != Role::Server || !self.ctx.service.keep_listening {
            return false;
        }
        if self.superseded() || self.listener.is_none() {
            warn!("Not resuming listener");
            return false;
        }
        info!("Waiting for the next connection");
        true
    }
}

/// Resolves once the generation moves past `mine`.
async fn superseded(interrupts: &mut watch::Receiver<u64>, mine: u64) {
    loop {
        if *interrupts.borrow_and_update() != mine {
            return;
        }
        if interrupts.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
