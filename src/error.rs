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

//! Error taxonomy for discovery, connection and recovery.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the Bluetooth layer.
///
/// Kept `Clone` so the same error can be published to observers and
/// returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BluetoothError {
    /// A required capability grant is missing.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The radio is switched off.
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    /// The scan could not be started.
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Connecting took longer than the configured bound.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Socket level failure (open, read, write).
    #[error("Socket error: {0}")]
    Socket(String),

    /// Link-loss recovery gave up.
    #[error("Reconnection failed after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// Frame rejected on its length prefix.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// No transport is active.
    #[error("No active connection")]
    NotConnected,

    /// Address could not be resolved to a remote device.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The stream was closed locally.
    #[error("Connection closed")]
    Closed,
}

impl BluetoothError {
    /// Errors that abort an operation immediately instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::AdapterDisabled)
    }
}

impl From<io::Error> for BluetoothError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            io::ErrorKind::InvalidData => Self::InvalidFrame(err.to_string()),
            _ => Self::Socket(err.to_string()),
        }
    }
}

/// Result alias for the Bluetooth layer.
pub type Result<T> = std::result::Result<T, BluetoothError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BluetoothError::AdapterDisabled.is_fatal());
        assert!(BluetoothError::PermissionDenied("scan".into()).is_fatal());
        assert!(!BluetoothError::Timeout(Duration::from_secs(10)).is_fatal());
        assert!(!BluetoothError::Socket("reset".into()).is_fatal());
        assert!(!BluetoothError::RetryExhausted { attempts: 3 }.is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(BluetoothError::from(refused), BluetoothError::Socket(_)));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no access");
        assert!(matches!(
            BluetoothError::from(denied),
            BluetoothError::PermissionDenied(_)
        ));

        let oversized = io::Error::new(io::ErrorKind::InvalidData, "frame length 9 exceeds limit");
        assert_eq!(
            BluetoothError::from(oversized),
            BluetoothError::InvalidFrame("frame length 9 exceeds limit".to_string())
        );
    }

    #[test]
    fn test_display() {
        let err = BluetoothError::RetryExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "Reconnection failed after 3 attempts");
    }
}
