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

//! Message envelope and length-prefixed wire framing.
//!
//! Frame layout:
//!
//! ```text
//! +----------------+---------------------+-----------+---------+
//! | body len (u32) | sender len (u16)    | sender id | payload |
//! +----------------+---------------------+-----------+---------+
//! ```
//!
//! All integers are big-endian. Only the prefix decides whether a frame is
//! accepted; the payload is carried as opaque bytes.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;
use uuid::Uuid;

/// Service both peers rendezvous on.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0b6a013a_01b8_4b6a_9a1c_1bea99419b71);

/// Service record name advertised by the listener.
pub const SERVICE_NAME: &str = "rfcomm-link";

/// Size of the body length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest valid body: an empty sender id and no payload.
pub const MIN_FRAME_LEN: usize = 2;

/// Largest body accepted from the wire.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One discrete message exchanged over the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender_id: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(sender_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload: payload.into(),
        }
    }

    /// Serialize to a complete frame, prefix included.
    pub fn to_frame(&self) -> io::Result<Vec<u8>> {
        let sender = self.sender_id.as_bytes();
        if sender.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sender id too long: {} bytes", sender.len()),
            ));
        }

        let body_len = 2 + sender.len() + self.payload.len();
        if body_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message too large: {} bytes", body_len),
            ));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.extend_from_slice(&(sender.len() as u16).to_be_bytes());
        frame.extend_from_slice(sender);
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }

    /// Parse a frame body (prefix already stripped).
    pub fn from_body(body: &[u8]) -> io::Result<Self> {
        if body.len() < MIN_FRAME_LEN {
            return Err(invalid_data(format!("body too short: {} bytes", body.len())));
        }
        let sender_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let rest = &body[2..];
        if sender_len > rest.len() {
            return Err(invalid_data(format!(
                "sender id length {} exceeds body of {} bytes",
                sender_len,
                body.len()
            )));
        }
        let sender_id = String::from_utf8_lossy(&rest[..sender_len]).into_owned();
        Ok(Self {
            sender_id,
            payload: rest[sender_len..].to_vec(),
        })
    }

    /// Payload as text, for logging.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Check a length prefix before reading the body.
pub fn check_frame_len(len: usize) -> io::Result<()> {
    if len < MIN_FRAME_LEN {
        return Err(invalid_data(format!("frame length {} below minimum", len)));
    }
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!(
            "frame length {} exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(())
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads frames from a byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means the peer closed the stream on a frame boundary. A
    /// close in the middle of a frame is an `UnexpectedEof` error.
    pub async fn read_frame(&mut self) -> io::Result<Option<Message>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_LEN {
            let n = self.reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside length prefix",
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        check_frame_len(len)?;

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        debug!("Frame received: {} bytes", len);

        Message::from_body(&body).map(Some)
    }
}
