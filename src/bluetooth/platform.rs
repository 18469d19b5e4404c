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

//! Platform abstraction for adapter control and RFCOMM sockets.

use anyhow::Result;
use bluer::Address;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Well-known Serial Port Profile UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// A byte stream to a remote device.
pub trait SerialSocket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialSocket for T {}

/// Owned connected socket.
pub type SerialStream = Box<dyn SerialSocket>;

/// Snapshot of a remote device from the platform registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub address: Address,
    pub device_class: Option<u32>,
}

/// Notifications the platform pushes outside of any request.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    /// Bond state of a device changed.
    BondStateChanged { device: Device, bonded: bool },
    /// The bonding process failed.
    BondFailed { address: Address, reason: String },
}

/// Listening RFCOMM socket.
pub trait SerialListener: Send {
    /// Wait for the next inbound connection.
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(SerialStream, Address)>>;
}

/// Everything the connection manager needs from the Bluetooth stack.
pub trait Platform: Send + Sync + 'static {
    /// Whether the adapter is powered.
    fn is_enabled(&self) -> BoxFuture<'_, Result<bool>>;

    /// Devices bonded with this adapter.
    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>>;

    fn is_bonded(&self, address: Address) -> BoxFuture<'_, Result<bool>>;

    /// Start bonding. The outcome arrives as a [`PlatformEvent`].
    fn create_bond(&self, address: Address) -> BoxFuture<'_, Result<()>>;

    /// Start a scan. The stream yields found devices and ends when the scan
    /// finishes on its own or is stopped.
    fn start_discovery(&self) -> BoxFuture<'_, Result<BoxStream<'static, Result<Device>>>>;

    fn stop_discovery(&self) -> BoxFuture<'_, Result<()>>;

    /// Open an RFCOMM channel to the SPP service of `address`.
    fn connect(&self, address: Address, secure: bool) -> BoxFuture<'_, io::Result<SerialStream>>;

    /// Open a listening RFCOMM socket.
    fn listen(&self, secure: bool) -> BoxFuture<'_, io::Result<Box<dyn SerialListener>>>;

    /// Platform notifications. Called once by the manager.
    fn events(&self) -> BoxStream<'static, PlatformEvent>;
}

/// Parse a `XX:XX:XX:XX:XX:XX` hardware address.
pub fn parse_address(address: &str) -> Option<Address> {
    address.trim().parse().ok()
}
