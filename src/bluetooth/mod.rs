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

//! Bluetooth communication module.
//!
//! Discovery, RFCOMM sessions in either role, framed messaging and
//! link-loss recovery on top of injectable platform ports.

mod device;
mod discovery;
mod platform;
mod protocol;
mod retry;
mod session;
mod supervisor;
mod transport;

pub mod stub;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use device::{Device, DeviceList, DeviceRegistry};
pub use discovery::DiscoverySession;
pub use platform::{
    AdapterPort, BoxedStream, EventSource, Permission, PlatformEvent, Ports, RawStream,
    RfcommListener, SocketPort, Subscription, SubscriptionId, SubscriptionKind,
};
pub use protocol::{
    FrameReader, Message, LENGTH_PREFIX_LEN, MAX_FRAME_LEN, MIN_FRAME_LEN, SERVICE_NAME,
    SERVICE_UUID,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use session::{
    ConnectionResult, ConnectionResults, Role, ServiceOptions, SessionContext, SessionSlot,
    SessionState, TransportSession, DEFAULT_CONNECT_TIMEOUT,
};
pub use supervisor::{ConnectionSupervisor, SupervisorOptions, DEFAULT_DISCOVERY_WARMUP};
pub use transport::{FrameTransport, IncomingMessages};
