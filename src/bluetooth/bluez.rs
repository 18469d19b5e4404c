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

//! BlueZ platform backed by `bluer`.

use anyhow::{bail, Result};
use bluer::rfcomm::{
    Listener, Profile, ProfileHandle, ReqError, Security, SecurityLevel, Socket, SocketAddr,
    Stream,
};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::platform::{
    Device, Platform, PlatformEvent, SerialListener, SerialStream, SPP_UUID,
};
use crate::config::Config;

/// Linux Bluetooth stack accessed over D-Bus.
pub struct BluezPlatform {
    _session: Session,
    adapter: Adapter,
    /// Present when the SPP profile is registered with BlueZ.
    spp: Option<Arc<Mutex<SppRoutes<Stream>>>>,
    connect_channel: u8,
    secure_channel: u8,
    insecure_channel: u8,
    discovery_duration: Duration,
    discovery_stop: Mutex<Option<oneshot::Sender<()>>>,
    bond_tx: mpsc::UnboundedSender<PlatformEvent>,
    bond_rx: Mutex<Option<mpsc::UnboundedReceiver<PlatformEvent>>>,
}

impl BluezPlatform {
    /// Open a BlueZ session and power on the configured adapter.
    pub async fn new(config: &Config) -> Result<Self> {
        info!("Initializing Bluetooth platform...");

        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = match &config.bluetooth.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let spp = match session
            .register_profile(spp_profile(config.bluetooth.secure_channel))
            .await
        {
            Ok(profile) => {
                info!("SPP profile {} registered", SPP_UUID);
                let routes = Arc::new(Mutex::new(SppRoutes::new()));
                tokio::spawn(route_spp(profile, routes.clone()));
                Some(routes)
            }
            Err(e) => {
                warn!("Could not register SPP profile, using fixed channels: {}", e);
                None
            }
        };

        let (bond_tx, bond_rx) = mpsc::unbounded_channel();

        Ok(Self {
            _session: session,
            adapter,
            spp,
            connect_channel: config.bluetooth.connect_channel,
            secure_channel: config.bluetooth.secure_channel,
            insecure_channel: config.bluetooth.insecure_channel,
            discovery_duration: Duration::from_secs(config.discovery.duration_secs),
            discovery_stop: Mutex::new(None),
            bond_tx,
            bond_rx: Mutex::new(Some(bond_rx)),
        })
    }

    fn socket(secure: bool) -> io::Result<Socket> {
        let socket = Socket::new()?;
        let level = if secure {
            SecurityLevel::Medium
        } else {
            SecurityLevel::Low
        };
        socket.set_security(Security { level, key_size: 0 })?;
        Ok(socket)
    }

    /// Connect through the SPP profile, letting BlueZ resolve the remote
    /// channel from its service record.
    async fn connect_spp(&self, address: Address) -> io::Result<Stream> {
        let Some(routes) = &self.spp else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "SPP profile not registered",
            ));
        };

        let delivered = routes.lock().expect_outgoing(address);
        let device = self.adapter.device(address).map_err(io::Error::other)?;
        if let Err(e) = device.connect_profile(&SPP_UUID).await {
            routes.lock().forget_outgoing(address);
            return Err(io::Error::other(e));
        }

        delivered.await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "SPP connection was not delivered",
            )
        })?
    }

    fn listen_socket(&self, secure: bool) -> io::Result<Box<dyn SerialListener>> {
        let channel = if secure {
            self.secure_channel
        } else {
            self.insecure_channel
        };
        let socket = Self::socket(secure)?;
        socket.bind(SocketAddr::new(Address::any(), channel))?;
        let listener = socket.listen(1)?;
        info!("RFCOMM server listening on channel {}", channel);
        Ok(Box::new(BluezListener { listener }))
    }
}

/// The SPP record BlueZ advertises for the authenticated listener.
fn spp_profile(channel: u8) -> Profile {
    Profile {
        uuid: SPP_UUID,
        name: Some("Serial Port".to_string()),
        channel: Some(channel.into()),
        require_authentication: Some(true),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    }
}

/// Destination of a profile connection.
enum SppRoute<S> {
    Outgoing(oneshot::Sender<io::Result<S>>),
    Incoming(mpsc::UnboundedSender<(S, Address)>),
    Reject,
}

/// Hands profile connections to the connect waiting on that device, else to
/// the open listener.
struct SppRoutes<S> {
    outgoing: HashMap<Address, oneshot::Sender<io::Result<S>>>,
    incoming: Option<mpsc::UnboundedSender<(S, Address)>>,
}

impl<S> SppRoutes<S> {
    fn new() -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: None,
        }
    }

    fn expect_outgoing(&mut self, address: Address) -> oneshot::Receiver<io::Result<S>> {
        let (tx, rx) = oneshot::channel();
        self.outgoing.insert(address, tx);
        rx
    }

    fn forget_outgoing(&mut self, address: Address) {
        self.outgoing.remove(&address);
    }

    /// Replaces any previous listener.
    fn open_listener(&mut self) -> mpsc::UnboundedReceiver<(S, Address)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.incoming = Some(tx);
        rx
    }

    fn route(&mut self, address: Address) -> SppRoute<S> {
        if let Some(reply) = self.outgoing.remove(&address) {
            if !reply.is_closed() {
                return SppRoute::Outgoing(reply);
            }
        }
        match &self.incoming {
            Some(tx) if !tx.is_closed() => SppRoute::Incoming(tx.clone()),
            _ => SppRoute::Reject,
        }
    }
}

async fn route_spp(mut profile: ProfileHandle, routes: Arc<Mutex<SppRoutes<Stream>>>) {
    while let Some(request) = profile.next().await {
        let address = request.device();
        let route = routes.lock().route(address);
        match route {
            SppRoute::Outgoing(reply) => {
                let _ = reply.send(request.accept().map_err(io::Error::other));
            }
            SppRoute::Incoming(tx) => match request.accept() {
                Ok(stream) => {
                    let _ = tx.send((stream, address));
                }
                Err(e) => warn!("Failed to accept SPP connection from {}: {}", address, e),
            },
            SppRoute::Reject => {
                debug!("Rejecting SPP connection from {}", address);
                request.reject(ReqError::Rejected);
            }
        }
    }
    warn!("SPP profile closed");
}

async fn describe(device: &bluer::Device) -> Result<Device> {
    let address = device.address();
    let name = device
        .alias()
        .await
        .unwrap_or_else(|_| address.to_string());
    let device_class = device.class().await.unwrap_or(None);
    Ok(Device {
        name,
        address,
        device_class,
    })
}

struct BluezListener {
    listener: Listener,
}

struct SppListener {
    incoming: mpsc::UnboundedReceiver<(Stream, Address)>,
}

impl SerialListener for SppListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(SerialStream, Address)>> {
        Box::pin(async move {
            match self.incoming.recv().await {
                Some((stream, address)) => Ok((Box::new(stream) as SerialStream, address)),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "SPP listener replaced",
                )),
            }
        })
    }
}

impl SerialListener for BluezListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(SerialStream, Address)>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            Ok((Box::new(stream) as SerialStream, peer.addr))
        })
    }
}

impl Platform for BluezPlatform {
    fn is_enabled(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.adapter.is_powered().await?) })
    }

    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>> {
        Box::pin(async move {
            let mut devices = Vec::new();
            for address in self.adapter.device_addresses().await? {
                let device = self.adapter.device(address)?;
                if device.is_paired().await? {
                    devices.push(describe(&device).await?);
                }
            }
            Ok(devices)
        })
    }

    fn is_bonded(&self, address: Address) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            if !self.adapter.device_addresses().await?.contains(&address) {
                return Ok(false);
            }
            Ok(self.adapter.device(address)?.is_paired().await?)
        })
    }

    fn create_bond(&self, address: Address) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let device = self.adapter.device(address)?;
            if device.is_paired().await? {
                bail!("The device is already paired.");
            }

            let bond_tx = self.bond_tx.clone();
            tokio::spawn(async move {
                let event = match device.pair().await {
                    Ok(()) => match describe(&device).await {
                        Ok(device) => PlatformEvent::BondStateChanged {
                            device,
                            bonded: true,
                        },
                        Err(e) => PlatformEvent::BondFailed {
                            address,
                            reason: e.to_string(),
                        },
                    },
                    Err(e) => PlatformEvent::BondFailed {
                        address,
                        reason: e.to_string(),
                    },
                };
                let _ = bond_tx.send(event);
            });
            Ok(())
        })
    }

    fn start_discovery(&self) -> BoxFuture<'_, Result<BoxStream<'static, Result<Device>>>> {
        Box::pin(async move {
            let events = self.adapter.discover_devices().await?;
            info!("Discovery started");

            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            *self.discovery_stop.lock() = Some(stop_tx);
            let deadline = tokio::time::sleep(self.discovery_duration);
            let until = async move {
                tokio::select! {
                    _ = deadline => debug!("Discovery timed out"),
                    _ = stop_rx => debug!("Discovery stop requested"),
                }
            };

            let adapter = self.adapter.clone();
            let devices = events
                .take_until(until)
                .filter_map(|event| async move {
                    match event {
                        AdapterEvent::DeviceAdded(address) => Some(address),
                        _ => None,
                    }
                })
                .then(move |address| {
                    let adapter = adapter.clone();
                    async move { describe(&adapter.device(address)?).await }
                })
                .boxed();
            Ok(devices)
        })
    }

    fn stop_discovery(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let stop = self.discovery_stop.lock().take();
            match stop {
                Some(stop) => {
                    let _ = stop.send(());
                }
                None => debug!("No platform scan to stop"),
            }
            Ok(())
        })
    }

    fn connect(&self, address: Address, secure: bool) -> BoxFuture<'_, io::Result<SerialStream>> {
        Box::pin(async move {
            // The profile requires authentication, so only secure connects use it.
            if secure {
                info!("Connecting to {} via SPP {}", address, SPP_UUID);
                match self.connect_spp(address).await {
                    Ok(stream) => return Ok(Box::new(stream) as SerialStream),
                    Err(e) => warn!(
                        "SPP connect to {} failed, dialling channel {}: {}",
                        address, self.connect_channel, e
                    ),
                }
            }

            let socket = Self::socket(secure)?;
            let target = SocketAddr::new(address, self.connect_channel);
            info!("Connecting to {} channel {}", address, self.connect_channel);
            let stream = socket.connect(target).await?;
            Ok(Box::new(stream) as SerialStream)
        })
    }

    fn listen(&self, secure: bool) -> BoxFuture<'_, io::Result<Box<dyn SerialListener>>> {
        Box::pin(async move {
            match (&self.spp, secure) {
                // BlueZ owns the secure channel and its service record.
                (Some(routes), true) => {
                    let incoming = routes.lock().open_listener();
                    info!("SPP server listening on channel {}", self.secure_channel);
                    Ok(Box::new(SppListener { incoming }) as Box<dyn SerialListener>)
                }
                _ => self.listen_socket(secure),
            }
        })
    }

    fn events(&self) -> BoxStream<'static, PlatformEvent> {
        match self.bond_rx.lock().take() {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => {
                warn!("Platform events already taken");
                futures::stream::empty().boxed()
            }
        }
    }
}
