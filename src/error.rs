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

//! Errors surfaced to callers of the serial manager.
//!
//! Every error carries a numeric code so the command bridge can report it as
//! `{message, code}`.

use thiserror::Error;

/// Precondition conflicts, invalid input and generic platform faults.
pub const CODE_UNKNOWN: i32 = 404;
/// Cancelled discovery, transport and pairing failures.
pub const CODE_FAILED: i32 = 500;
/// Discovery replaced by a newer discovery.
pub const CODE_SUPERSEDED: i32 = 505;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    #[error("A Connection attempt is in progress.")]
    ConnectionInProgress,

    #[error("Already connected to a device.")]
    AlreadyConnected,

    #[error("Pairing process is already in progress.")]
    PairingInProgress,

    #[error("There is no discovery to cancel.")]
    NoDiscovery,

    #[error("Not connected.")]
    NotConnected,

    #[error("Bluetooth is disabled.")]
    Disabled,

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to device")]
    ConnectFailed,

    #[error("Device connection was lost")]
    ConnectionLost,

    #[error("Connection attempt was cancelled.")]
    ConnectCancelled,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Discovery was cancelled.")]
    DiscoveryCancelled,

    #[error("Discovery was stopped because a new discovery was started.")]
    DiscoverySuperseded,

    #[error("{0}")]
    PairingFailed(String),

    #[error("{0}")]
    Platform(String),

    #[error("Serial manager has shut down")]
    ManagerShutdown,
}

impl SerialError {
    /// Numeric code reported alongside the message.
    pub fn code(&self) -> i32 {
        match self {
            Self::DiscoverySuperseded => CODE_SUPERSEDED,
            Self::DiscoveryCancelled
            | Self::PairingFailed(_)
            | Self::ConnectFailed
            | Self::ConnectionLost
            | Self::ConnectCancelled
            | Self::WriteFailed(_)
            | Self::ManagerShutdown => CODE_FAILED,
            Self::ConnectionInProgress
            | Self::AlreadyConnected
            | Self::PairingInProgress
            | Self::NoDiscovery
            | Self::NotConnected
            | Self::Disabled
            | Self::InvalidAddress(_)
            | Self::UnknownAction(_)
            | Self::InvalidArgument(_)
            | Self::Platform(_) => CODE_UNKNOWN,
        }
    }

    /// Whether this is a deliberate stop rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::ConnectCancelled | Self::DiscoveryCancelled | Self::DiscoverySuperseded
        )
    }

    pub(crate) fn platform(err: anyhow::Error) -> Self {
        Self::Platform(err.to_string())
    }
}
