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

//! Events exchanged between workers, the manager and observers.

use bluer::Address;
use std::io;

use crate::bluetooth::{Device, PlatformEvent, SerialStream};
use crate::state::ConnectionState;

/// Identifies one spawned worker so stale reports can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events published to observers of the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// A remote device is connected.
    Connected { address: Address },
    /// Connecting failed or an established connection dropped.
    ConnectionLost { message: String },
}

/// Reports queued to the manager by workers and the platform.
///
/// All of these are processed one at a time on the manager task.
pub(crate) enum WorkerEvent {
    /// Outgoing connection established.
    Connected {
        worker: WorkerId,
        stream: SerialStream,
        address: Address,
    },
    /// Outgoing connection failed.
    ConnectFailed { worker: WorkerId, error: io::Error },
    /// Incoming connection accepted.
    Accepted {
        worker: WorkerId,
        stream: SerialStream,
        address: Address,
    },
    /// Listening socket failed.
    AcceptFailed { worker: WorkerId, error: io::Error },
    /// Bytes read from the connected socket.
    Data { worker: WorkerId, bytes: Vec<u8> },
    /// Connected socket closed or failed.
    ConnectionLost { worker: WorkerId, error: io::Error },
    /// Scan found a device.
    DeviceFound { cycle: u64, device: Device },
    /// Scan stream ended.
    DiscoveryFinished { cycle: u64 },
    Platform(PlatformEvent),
}

impl WorkerEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Connected { .. } => "connected",
            WorkerEvent::ConnectFailed { .. } => "connect-failed",
            WorkerEvent::Accepted { .. } => "accepted",
            WorkerEvent::AcceptFailed { .. } => "accept-failed",
            WorkerEvent::Data { .. } => "data",
            WorkerEvent::ConnectionLost { .. } => "connection-lost",
            WorkerEvent::DeviceFound { .. } => "device-found",
            WorkerEvent::DiscoveryFinished { .. } => "discovery-finished",
            WorkerEvent::Platform(_) => "platform",
        }
    }
}
