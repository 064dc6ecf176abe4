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

//! Framed message transport over an open raw stream.

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::platform::BoxedStream;
use super::protocol::{FrameReader, Message};
use crate::error::{BluetoothError, Result};

/// Decoded messages from the peer.
///
/// Ends without an error when the peer closes cleanly, ends with
/// [`BluetoothError::Closed`] when the transport is closed locally and with
/// another error when reading fails.
pub type IncomingMessages = BoxStream<'static, Result<Message>>;

/// Frames outgoing messages and decodes incoming ones.
pub struct FrameTransport {
    peer: String,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    closed: watch::Sender<bool>,
}

impl FrameTransport {
    /// Wrap an open stream to `peer`.
    pub fn new(stream: BoxedStream, peer: impl Into<String>) -> Self {
        let (reader, writer) = split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            closed,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one framed message.
    ///
    /// Returns `false` on any failure; the caller decides whether to tear
    /// the link down.
    pub async fn send(&self, message: &Message) -> bool {
        if self.is_closed() {
            warn!("Send to {} after close", self.peer);
            return false;
        }

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot frame message: {}", e);
                return false;
            }
        };

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        // single buffer so concurrent senders never interleave frames
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                debug!("Sent {} bytes to {}", frame.len(), self.peer);
                true
            }
            Err(e) => {
                error!("Write to {} failed: {}", self.peer, e);
                false
            }
        }
    }

    /// Take the incoming message sequence.
    ///
    /// The sequence can be taken once; later calls get a sequence that
    /// fails immediately.
    pub fn incoming(&self) -> IncomingMessages {
        let Some(reader) = self.reader.lock().take() else {
            return stream::once(async {
                Err(BluetoothError::Socket(
                    "incoming messages already taken".to_string(),
                ))
            })
            .boxed();
        };

        let state = IncomingState {
            reader: Some(FrameReader::new(reader)),
            closed: self.closed.subscribe(),
            peer: self.peer.clone(),
        };

        stream::unfold(state, |mut state| async move {
            let mut reader = state.reader.take()?;
            let next = tokio::select! {
                biased;
                _ = wait_closed(&mut state.closed) => Err(BluetoothError::Closed),
                frame = reader.read_frame() => frame.map_err(BluetoothError::from),
            };

            match next {
                Ok(Some(message)) => {
                    state.reader = Some(reader);
                    Some((Ok(message), state))
                }
                Ok(None) => {
                    info!("Connection closed by {}", state.peer);
                    None
                }
                Err(BluetoothError::Closed) => {
                    debug!("Reader for {} stopped by local close", state.peer);
                    Some((Err(BluetoothError::Closed), state))
                }
                Err(e) => {
                    error!("Read from {} failed: {}", state.peer, e);
                    Some((Err(e), state))
                }
            }
        })
        .boxed()
    }

    /// Close the stream.
    ///
    /// Wakes any in-flight read so the incoming sequence terminates, and
    /// drops the halves still owned here. The socket itself is released
    /// once the incoming sequence has also been dropped.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        info!("Closing connection to {}", self.peer);
        self.reader.lock().take();
        match self.writer.try_lock() {
            Ok(mut writer) => {
                writer.take();
            }
            // a send is in flight; the half goes when the transport drops
            Err(_) => debug!("Writer to {} busy during close", self.peer),
        }
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

struct IncomingState {
    reader: Option<FrameReader<ReadHalf<BoxedStream>>>,
    closed: watch::Receiver<bool>,
    peer: String,
}

/// Resolves once the transport is closed or dropped.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}
