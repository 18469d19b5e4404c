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

//! Pairing management for bonding requests.

use bluer::Address;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::bluetooth::{Device, PlatformEvent};
use crate::error::SerialError;
use crate::pending::PendingRequest;

pub type PairingReply = oneshot::Sender<Result<Device, SerialError>>;

struct PendingPairing {
    address: Address,
    request: PendingRequest<Result<Device, SerialError>>,
}

/// Holds at most one outstanding bonding request.
#[derive(Default)]
pub struct PairingCoordinator {
    pending: Option<PendingPairing>,
}

impl PairingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Hold `reply` until the bond state of `address` changes.
    pub fn begin(&mut self, address: Address, reply: PairingReply) {
        info!("Waiting for bond with {}", address);
        self.pending = Some(PendingPairing {
            address,
            request: PendingRequest::new("pairing", reply),
        });
    }

    /// Resolve the outstanding request from a platform notification.
    pub fn handle(&mut self, event: PlatformEvent) {
        let target = match &event {
            PlatformEvent::BondStateChanged { device, .. } => device.address,
            PlatformEvent::BondFailed { address, .. } => *address,
        };

        if !matches!(&self.pending, Some(pending) if pending.address == target) {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        let outcome = match event {
            PlatformEvent::BondStateChanged { device, bonded: true } => {
                info!("Bonded with {} ({})", device.name, device.address);
                Ok(device)
            }
            PlatformEvent::BondStateChanged { device, bonded: false } => {
                warn!("Bonding with {} was rejected", device.address);
                Err(SerialError::PairingFailed(format!(
                    "Bonding with {} was rejected.",
                    device.address
                )))
            }
            PlatformEvent::BondFailed { address, reason } => {
                warn!("Bonding with {} failed: {}", address, reason);
                Err(SerialError::PairingFailed(reason))
            }
        };
        pending.request.resolve(outcome);
    }
}
