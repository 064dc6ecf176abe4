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

//! Broadcast of state and error notifications to observers.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bluetooth::ConnectionResult;
use crate::error::BluetoothError;
use crate::state::ConnectionState;

/// Default channel capacity. Slow observers lag instead of blocking.
pub const DEFAULT_CAPACITY: usize = 64;

/// Notifications published by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// A connect or listen sequence produced a result.
    Result(ConnectionResult),
    /// Human-readable status line.
    Status(String),
    /// An operation failed.
    Error(BluetoothError),
}

impl SupervisorEvent {
    /// Text for the error/status stream, if this event carries any.
    pub fn message(&self) -> Option<String> {
        match self {
            SupervisorEvent::Status(msg) => Some(msg.clone()),
            SupervisorEvent::Error(err) => Some(err.to_string()),
            _ => None,
        }
    }
}

/// Fan-out channel for [`SupervisorEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is simply dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn state(&self, state: ConnectionState) {
        debug!("Connection state: {}", state.as_str());
        self.publish(SupervisorEvent::StateChanged(state));
    }

    pub fn result(&self, result: ConnectionResult) {
        self.publish(SupervisorEvent::Result(result));
    }

    pub fn status(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{}", msg);
        self.publish(SupervisorEvent::Status(msg));
    }

    pub fn error(&self, err: BluetoothError) {
        warn!("{}", err);
        self.publish(SupervisorEvent::Error(err));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let sink = EventSink::default();
        sink.status("nobody listening");
        sink.error(BluetoothError::AdapterDisabled);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();

        sink.state(ConnectionState::Connecting);
        sink.status("hello");
        sink.error(BluetoothError::NotConnected);

        assert_eq!(
            rx.recv().await.unwrap(),
            SupervisorEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(rx.recv().await.unwrap().message().as_deref(), Some("hello"));
        assert_eq!(
            rx.recv().await.unwrap().message().as_deref(),
            Some("No active connection")
        );
    }
}
