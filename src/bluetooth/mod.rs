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
//! RFCOMM sockets, the workers that drive them and the platform seam.

mod bluez;
mod connection;
mod frame_buffer;
mod platform;
mod server;

pub use bluez::BluezPlatform;
pub use frame_buffer::FrameBuffer;
pub use platform::{
    parse_address, Device, Platform, PlatformEvent, SerialListener, SerialSocket, SerialStream,
    SPP_UUID,
};

pub(crate) use connection::IoWorker;
pub(crate) use server::{AcceptWorker, ConnectWorker, WorkerHandle};
