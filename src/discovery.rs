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

//! Device discovery tracking.
//!
//! A discovery cycle owns a pump task that forwards the platform scan into
//! the manager queue, tagged with the cycle number. Reports from an older
//! cycle are ignored.

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bluetooth::Device;
use crate::error::SerialError;
use crate::events::WorkerEvent;

/// Deliveries on a discovery stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A device was found. More may follow.
    DeviceFound(Device),
    /// The scan ended on its own. Terminal.
    Finished,
    /// The scan was cancelled or replaced. Terminal.
    Stopped(SerialError),
}

impl DiscoveryEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DiscoveryEvent::DeviceFound(_))
    }
}

struct ActiveDiscovery {
    cycle: u64,
    sink: mpsc::UnboundedSender<DiscoveryEvent>,
    pump: JoinHandle<()>,
}

/// Tracks the single in-flight discovery and its subscriber.
pub struct DiscoveryCoordinator {
    name_filter: Option<String>,
    cycle: u64,
    active: Option<ActiveDiscovery>,
    canceled: bool,
}

impl DiscoveryCoordinator {
    pub fn new(name_filter: Option<String>) -> Self {
        Self {
            name_filter,
            cycle: 0,
            active: None,
            canceled: false,
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the last cycle was stopped by a caller.
    pub fn was_canceled(&self) -> bool {
        self.canceled
    }

    /// Reserve the number for the next cycle.
    pub fn next_cycle(&mut self) -> u64 {
        self.cycle = self.cycle.wrapping_add(1);
        self.cycle
    }

    /// Record that cycle `cycle` has started.
    pub fn started(
        &mut self,
        cycle: u64,
        sink: mpsc::UnboundedSender<DiscoveryEvent>,
        pump: JoinHandle<()>,
    ) {
        debug!("Discovery cycle {} started", cycle);
        self.canceled = false;
        self.active = Some(ActiveDiscovery { cycle, sink, pump });
    }

    /// Replace the running discovery with a new one.
    ///
    /// Returns whether a discovery was running.
    pub fn supersede(&mut self) -> bool {
        self.stop_with(DiscoveryEvent::Stopped(SerialError::DiscoverySuperseded), true)
    }

    /// Cancel on behalf of a caller.
    pub fn cancel(&mut self) -> Result<(), SerialError> {
        if self.stop_with(DiscoveryEvent::Stopped(SerialError::DiscoveryCancelled), true) {
            Ok(())
        } else {
            Err(SerialError::NoDiscovery)
        }
    }

    /// End the scan without a caller asking for it.
    ///
    /// The subscriber sees a clean finish.
    pub fn interrupt(&mut self) -> bool {
        self.stop_with(DiscoveryEvent::Finished, false)
    }

    /// A device was found in cycle `cycle`.
    pub fn device_found(&mut self, cycle: u64, device: Device) {
        let Some(active) = self.current(cycle) else {
            debug!("Ignoring device from stale discovery cycle {}", cycle);
            return;
        };

        if let Some(filter) = &self.name_filter {
            if !device.name.eq_ignore_ascii_case(filter) {
                debug!("Skipping {} ({}): name filter", device.name, device.address);
                return;
            }
        }

        info!("Discovered {} ({})", device.name, device.address);
        if active.sink.send(DiscoveryEvent::DeviceFound(device)).is_err() {
            debug!("Discovery subscriber went away");
        }
    }

    /// The scan stream of cycle `cycle` ended.
    pub fn finished(&mut self, cycle: u64) {
        if self.current(cycle).is_none() {
            debug!("Ignoring finish of stale discovery cycle {}", cycle);
            return;
        }
        if let Some(active) = self.active.take() {
            if !self.canceled {
                info!("Discovery finished");
                let _ = active.sink.send(DiscoveryEvent::Finished);
            }
        }
    }

    fn current(&self, cycle: u64) -> Option<&ActiveDiscovery> {
        self.active.as_ref().filter(|active| active.cycle == cycle)
    }

    fn stop_with(&mut self, signal: DiscoveryEvent, canceled: bool) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        self.canceled = canceled;
        active.pump.abort();
        debug!("Discovery cycle {} stopped: {:?}", active.cycle, signal);
        let _ = active.sink.send(signal);
        true
    }
}

/// Forward one platform scan into the manager queue.
pub(crate) fn spawn_scan_pump(
    cycle: u64,
    mut scan: BoxStream<'static, anyhow::Result<Device>>,
    event_tx: mpsc::Sender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(found) = scan.next().await {
            match found {
                Ok(device) => {
                    if event_tx
                        .send(WorkerEvent::DeviceFound { cycle, device })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!("Ignoring malformed device-found event: {}", e),
            }
        }
        let _ = event_tx.send(WorkerEvent::DiscoveryFinished { cycle }).await;
    })
}
