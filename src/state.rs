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

//! Connection state tracking.

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::events::EventSink;

/// Supervisor-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Published connection state.
///
/// `Disconnected -> Connected` is never taken directly: such a request is
/// routed through `Connecting` so observers always see the intermediate
/// state.
pub struct StateCell {
    // serialises check-and-publish so two writers cannot interleave steps
    write: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    sink: EventSink,
}

impl StateCell {
    pub fn new(sink: EventSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (connected, _) = watch::channel(false);
        Self {
            write: Mutex::new(()),
            state,
            connected,
            sink,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next`, publishing every step taken. No-op if already there.
    pub fn transition(&self, next: ConnectionState) {
        let _guard = self.write.lock();
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        if current == ConnectionState::Disconnected && next == ConnectionState::Connected {
            self.publish(ConnectionState::Connecting);
        }
        self.publish(next);
    }

    fn publish(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.connected.send_replace(state.is_connected());
        self.sink.state(state);
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
