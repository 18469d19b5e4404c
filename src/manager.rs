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

//! Serial connection manager.
//!
//! A single actor task owns the connection state, the receive buffer, the
//! subscription and every worker. Callers talk to it through the cloneable
//! [`SerialManager`] handle; workers report back on an ordered event queue.
//! Both queues are drained one message at a time, so no two operations ever
//! observe the state concurrently.

use bluer::Address;
use futures::stream::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{
    parse_address, AcceptWorker, ConnectWorker, Device, FrameBuffer, IoWorker, Platform,
    SerialStream, WorkerHandle,
};
use crate::config::{BluetoothConfig, Config};
use crate::discovery::{spawn_scan_pump, DiscoveryCoordinator, DiscoveryEvent};
use crate::error::SerialError;
use crate::events::{SerialEvent, WorkerEvent, WorkerId};
use crate::pairing::{PairingCoordinator, PairingReply};
use crate::pending::PendingRequest;
use crate::state::{ConnectionState, StateMachine};

type Reply<T> = oneshot::Sender<Result<T, SerialError>>;
type FrameSink = mpsc::UnboundedSender<Result<Vec<u8>, SerialError>>;

const OBSERVER_CAPACITY: usize = 64;

/// Requests sent from handles to the manager actor.
enum Command {
    Connect {
        address: Address,
        secure: bool,
        reply: Reply<()>,
    },
    Listen {
        reply: Reply<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Write {
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Available {
        reply: oneshot::Sender<usize>,
    },
    Read {
        reply: oneshot::Sender<Vec<u8>>,
    },
    ReadUntil {
        delimiter: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        delimiter: Vec<u8>,
        sink: FrameSink,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    StartDiscovery {
        sink: mpsc::UnboundedSender<DiscoveryEvent>,
        reply: Reply<()>,
    },
    StopDiscovery {
        reply: Reply<()>,
    },
    IsDiscovering {
        reply: oneshot::Sender<bool>,
    },
    Pair {
        address: Address,
        reply: PairingReply,
    },
}

/// Frames delivered to a subscriber.
///
/// Yields one item per delimiter-terminated frame. A connection failure is
/// delivered as a final `Err`, after which the subscription is closed.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, SerialError>>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, SerialError>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, SerialError>> {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

/// Devices found by one discovery cycle, ending with a terminal event.
pub struct DiscoveryStream {
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoveryStream {
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = DiscoveryEvent> {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

/// Handle to the manager actor.
#[derive(Clone)]
pub struct SerialManager {
    inbox: mpsc::Sender<Command>,
    platform: Arc<dyn Platform>,
    observers: broadcast::Sender<SerialEvent>,
}

impl SerialManager {
    /// Start the manager actor on the current runtime.
    pub fn spawn(platform: Arc<dyn Platform>, config: &Config) -> Self {
        let depth = config.bluetooth.event_queue_depth.max(1);
        let (inbox, command_rx) = mpsc::channel(depth);
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);

        let actor = ManagerActor::new(
            platform.clone(),
            config,
            command_rx,
            observers.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            inbox,
            platform,
            observers,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SerialError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(make(reply))
            .await
            .map_err(|_| SerialError::ManagerShutdown)?;
        rx.await.map_err(|_| SerialError::ManagerShutdown)
    }

    /// Connect to `address`, resolving once the link is up.
    ///
    /// A later `connect` or `stop` resolves this one with
    /// [`SerialError::ConnectCancelled`].
    pub async fn connect(&self, address: &str, secure: bool) -> Result<(), SerialError> {
        let address = parse_address(address)
            .ok_or_else(|| SerialError::InvalidAddress(address.to_string()))?;
        self.request(|reply| Command::Connect {
            address,
            secure,
            reply,
        })
        .await?
    }

    /// Start accepting incoming connections.
    pub async fn listen(&self) -> Result<(), SerialError> {
        self.request(|reply| Command::Listen { reply }).await?
    }

    /// Close every socket and return to NONE.
    pub async fn stop(&self) -> Result<(), SerialError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), SerialError> {
        let data = data.into();
        self.request(|reply| Command::Write { data, reply }).await?
    }

    pub async fn available(&self) -> Result<usize, SerialError> {
        self.request(|reply| Command::Available { reply }).await
    }

    pub async fn read(&self) -> Result<Vec<u8>, SerialError> {
        self.request(|reply| Command::Read { reply }).await
    }

    pub async fn read_until(&self, delimiter: impl Into<Vec<u8>>) -> Result<Vec<u8>, SerialError> {
        let delimiter = delimiter.into();
        self.request(|reply| Command::ReadUntil { delimiter, reply })
            .await
    }

    pub async fn clear(&self) -> Result<(), SerialError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Deliver each `delimiter`-terminated frame as it arrives.
    ///
    /// Replaces any previous subscription.
    pub async fn subscribe(
        &self,
        delimiter: impl Into<Vec<u8>>,
    ) -> Result<Subscription, SerialError> {
        let delimiter = delimiter.into();
        let (sink, rx) = mpsc::unbounded_channel();
        self.request(|reply| Command::Subscribe {
            delimiter,
            sink,
            reply,
        })
        .await?;
        Ok(Subscription { rx })
    }

    pub async fn unsubscribe(&self) -> Result<(), SerialError> {
        self.request(|reply| Command::Unsubscribe { reply }).await
    }

    pub async fn state(&self) -> Result<ConnectionState, SerialError> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn is_connected(&self) -> Result<bool, SerialError> {
        Ok(self.state().await? == ConnectionState::Connected)
    }

    pub async fn is_connecting(&self) -> Result<bool, SerialError> {
        Ok(self.state().await? == ConnectionState::Connecting)
    }

    pub async fn is_enabled(&self) -> Result<bool, SerialError> {
        self.platform
            .is_enabled()
            .await
            .map_err(SerialError::platform)
    }

    /// Bonded devices known to the adapter.
    pub async fn list(&self) -> Result<Vec<Device>, SerialError> {
        self.platform
            .bonded_devices()
            .await
            .map_err(SerialError::platform)
    }

    pub async fn is_paired(&self, address: &str) -> Result<bool, SerialError> {
        let address = parse_address(address)
            .ok_or_else(|| SerialError::InvalidAddress(address.to_string()))?;
        self.platform
            .is_bonded(address)
            .await
            .map_err(SerialError::platform)
    }

    /// Start a discovery, replacing any running one.
    pub async fn start_discovery(&self) -> Result<DiscoveryStream, SerialError> {
        let (sink, rx) = mpsc::unbounded_channel();
        self.request(|reply| Command::StartDiscovery { sink, reply })
            .await??;
        Ok(DiscoveryStream { rx })
    }

    pub async fn stop_discovery(&self) -> Result<(), SerialError> {
        self.request(|reply| Command::StopDiscovery { reply }).await?
    }

    pub async fn is_discovering(&self) -> Result<bool, SerialError> {
        self.request(|reply| Command::IsDiscovering { reply }).await
    }

    /// Bond with `address`, resolving once the platform reports the outcome.
    pub async fn pair(&self, address: &str) -> Result<Device, SerialError> {
        let address = parse_address(address)
            .ok_or_else(|| SerialError::InvalidAddress(address.to_string()))?;
        self.request(|reply| Command::Pair { address, reply })
            .await?
    }

    /// Subscribe to state and connection notifications.
    pub fn events(&self) -> broadcast::Receiver<SerialEvent> {
        self.observers.subscribe()
    }
}

struct ActiveSubscription {
    delimiter: Vec<u8>,
    sink: FrameSink,
}

struct ManagerActor {
    platform: Arc<dyn Platform>,
    config: BluetoothConfig,
    command_rx: mpsc::Receiver<Command>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    event_tx: mpsc::Sender<WorkerEvent>,
    observers: broadcast::Sender<SerialEvent>,
    state: StateMachine,
    buffer: FrameBuffer,
    subscription: Option<ActiveSubscription>,
    pending_connect: Option<PendingRequest<Result<(), SerialError>>>,
    connect_worker: Option<WorkerHandle>,
    accept_workers: Vec<WorkerHandle>,
    io: Option<IoWorker>,
    discovery: DiscoveryCoordinator,
    pairing: PairingCoordinator,
    next_worker: u64,
    platform_pump: Option<JoinHandle<()>>,
}

impl ManagerActor {
    fn new(
        platform: Arc<dyn Platform>,
        config: &Config,
        command_rx: mpsc::Receiver<Command>,
        observers: broadcast::Sender<SerialEvent>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.bluetooth.event_queue_depth.max(1));
        Self {
            platform,
            config: config.bluetooth.clone(),
            command_rx,
            event_rx,
            event_tx,
            observers,
            state: StateMachine::new(),
            buffer: FrameBuffer::new(),
            subscription: None,
            pending_connect: None,
            connect_worker: None,
            accept_workers: Vec::new(),
            io: None,
            discovery: DiscoveryCoordinator::new(config.discovery.name_filter.clone()),
            pairing: PairingCoordinator::new(),
            next_worker: 0,
            platform_pump: None,
        }
    }

    async fn run(mut self) {
        info!("Serial manager started");
        self.platform_pump = Some(self.spawn_platform_pump());

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
            }
        }

        self.shutdown().await;
        info!("Serial manager stopped");
    }

    fn spawn_platform_pump(&self) -> JoinHandle<()> {
        let mut events = self.platform.events();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event_tx.send(WorkerEvent::Platform(event)).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                address,
                secure,
                reply,
            } => self.connect(address, secure, reply).await,
            Command::Listen { reply } => {
                let _ = reply.send(self.listen());
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Write { data, reply } => match &self.io {
                Some(io) if self.state.is_connected() => io.write(data, reply),
                _ => {
                    let _ = reply.send(Err(SerialError::NotConnected));
                }
            },
            Command::Available { reply } => {
                let _ = reply.send(self.buffer.available());
            }
            Command::Read { reply } => {
                let _ = reply.send(self.buffer.read_all());
            }
            Command::ReadUntil { delimiter, reply } => {
                let _ = reply.send(self.buffer.read_until(&delimiter));
            }
            Command::Clear { reply } => {
                self.buffer.clear();
                let _ = reply.send(());
            }
            Command::Subscribe {
                delimiter,
                sink,
                reply,
            } => {
                debug!("Subscribed with {} byte delimiter", delimiter.len());
                self.subscription = Some(ActiveSubscription { delimiter, sink });
                let _ = reply.send(());
            }
            Command::Unsubscribe { reply } => {
                if self.subscription.take().is_some() {
                    debug!("Unsubscribed");
                }
                let _ = reply.send(());
            }
            Command::State { reply } => {
                let _ = reply.send(self.state.state());
            }
            Command::StartDiscovery { sink, reply } => {
                let _ = reply.send(self.start_discovery(sink).await);
            }
            Command::StopDiscovery { reply } => {
                let _ = reply.send(self.stop_discovery().await);
            }
            Command::IsDiscovering { reply } => {
                let _ = reply.send(self.discovery.is_discovering());
            }
            Command::Pair { address, reply } => self.pair(address, reply).await,
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        debug!("Handling {} event", event.kind());
        match event {
            WorkerEvent::Connected {
                worker,
                stream,
                address,
            } => {
                if !self.is_connect_worker(worker) {
                    debug!("Dropping socket from stale connect {}", worker);
                    return;
                }
                self.connect_worker = None;
                self.connected(stream, address).await;
            }
            WorkerEvent::ConnectFailed { worker, error } => {
                if !self.is_connect_worker(worker) {
                    debug!("Ignoring failure of stale connect {}: {}", worker, error);
                    return;
                }
                self.connect_worker = None;
                self.connection_failed(SerialError::ConnectFailed).await;
            }
            WorkerEvent::Accepted {
                worker,
                stream,
                address,
            } => {
                let eligible = matches!(
                    self.state.state(),
                    ConnectionState::Listening | ConnectionState::Connecting
                );
                if !eligible || !self.accept_workers.iter().any(|w| w.id() == worker) {
                    info!(
                        "Closing connection from {}: not accepting in {}",
                        address,
                        self.state.state()
                    );
                    return;
                }
                self.connected(stream, address).await;
            }
            WorkerEvent::AcceptFailed { worker, error } => {
                let before = self.accept_workers.len();
                self.accept_workers.retain(|w| w.id() != worker);
                if self.accept_workers.len() == before {
                    return;
                }
                warn!("Accept worker {} stopped: {}", worker, error);
                if self.accept_workers.is_empty()
                    && self.state.state() == ConnectionState::Listening
                {
                    self.set_state(ConnectionState::None);
                }
            }
            WorkerEvent::Data { worker, bytes } => {
                if !self.is_io_worker(worker) {
                    debug!("Dropping {} bytes from stale io {}", bytes.len(), worker);
                    return;
                }
                self.buffer.append(&bytes);
                self.deliver_frames();
            }
            WorkerEvent::ConnectionLost { worker, error } => {
                if !self.is_io_worker(worker) {
                    return;
                }
                error!("Connection lost: {}", error);
                if let Some(io) = self.io.take() {
                    io.shutdown().await;
                }
                self.connection_failed(SerialError::ConnectionLost).await;
            }
            WorkerEvent::DeviceFound { cycle, device } => {
                self.discovery.device_found(cycle, device);
            }
            WorkerEvent::DiscoveryFinished { cycle } => self.discovery.finished(cycle),
            WorkerEvent::Platform(event) => self.pairing.handle(event),
        }
    }

    fn next_id(&mut self) -> WorkerId {
        self.next_worker += 1;
        WorkerId(self.next_worker)
    }

    fn is_connect_worker(&self, id: WorkerId) -> bool {
        self.connect_worker.as_ref().map(WorkerHandle::id) == Some(id)
    }

    fn is_io_worker(&self, id: WorkerId) -> bool {
        self.io.as_ref().map(IoWorker::id) == Some(id)
    }

    fn set_state(&mut self, next: ConnectionState) {
        match self.state.transition(next) {
            Ok(previous) if previous != next => {
                let _ = self.observers.send(SerialEvent::StateChanged(next));
            }
            Ok(_) => {}
            Err(e) => warn!("Refusing state change: {}", e),
        }
    }

    async fn connect(&mut self, address: Address, secure: bool, reply: Reply<()>) {
        info!("connect to: {}", address);

        if let Some(previous) = self.pending_connect.take() {
            if !previous.is_abandoned() {
                info!("Superseding pending connect");
            }
            previous.resolve(Err(SerialError::ConnectCancelled));
        }
        self.cancel_connect_worker();
        self.stop_io().await;

        // An active scan slows the RFCOMM connect down.
        if self.discovery.is_discovering() {
            self.halt_scan().await;
            self.discovery.interrupt();
        }

        let id = self.next_id();
        self.connect_worker = Some(ConnectWorker::spawn(
            id,
            self.platform.clone(),
            address,
            secure,
            self.event_tx.clone(),
        ));
        self.set_state(ConnectionState::Connecting);
        self.pending_connect = Some(PendingRequest::new("connect", reply));
    }

    async fn connected(&mut self, stream: SerialStream, address: Address) {
        info!("connected to {}", address);

        self.cancel_connect_worker();
        self.stop_io().await;
        for worker in self.accept_workers.drain(..) {
            worker.cancel();
        }

        let id = self.next_id();
        self.io = Some(IoWorker::spawn(
            id,
            stream,
            self.config.read_chunk_size,
            self.event_tx.clone(),
        ));
        self.set_state(ConnectionState::Connected);
        let _ = self.observers.send(SerialEvent::Connected { address });

        if let Some(pending) = self.pending_connect.take() {
            pending.resolve(Ok(()));
        }
    }

    async fn connection_failed(&mut self, reason: SerialError) {
        warn!("{}", reason);
        self.set_state(ConnectionState::None);
        let _ = self.observers.send(SerialEvent::ConnectionLost {
            message: reason.to_string(),
        });

        if let Some(pending) = self.pending_connect.take() {
            pending.resolve(Err(reason.clone()));
        }
        if let Some(subscription) = self.subscription.take() {
            let _ = subscription.sink.send(Err(reason));
        }

        self.restart().await;
    }

    async fn restart(&mut self) {
        self.cancel_connect_worker();
        self.stop_io().await;
        if self.config.accept_incoming {
            self.start_listening();
        }
    }

    fn listen(&mut self) -> Result<(), SerialError> {
        match self.state.state() {
            ConnectionState::Connected => Err(SerialError::AlreadyConnected),
            ConnectionState::Connecting => Err(SerialError::ConnectionInProgress),
            ConnectionState::None | ConnectionState::Listening => {
                self.start_listening();
                Ok(())
            }
        }
    }

    fn start_listening(&mut self) {
        self.accept_workers.retain(|worker| !worker.is_finished());
        if self.accept_workers.is_empty() {
            for secure in [true, false] {
                let id = self.next_id();
                self.accept_workers.push(AcceptWorker::spawn(
                    id,
                    self.platform.clone(),
                    secure,
                    self.event_tx.clone(),
                ));
            }
        }
        self.set_state(ConnectionState::Listening);
    }

    async fn stop(&mut self) {
        info!("stop");
        if let Some(pending) = self.pending_connect.take() {
            pending.resolve(Err(SerialError::ConnectCancelled));
        }
        self.cancel_connect_worker();
        self.stop_io().await;
        for worker in self.accept_workers.drain(..) {
            worker.cancel();
        }
        self.set_state(ConnectionState::None);
    }

    fn cancel_connect_worker(&mut self) {
        if let Some(worker) = self.connect_worker.take() {
            worker.cancel();
        }
    }

    async fn stop_io(&mut self) {
        if let Some(io) = self.io.take() {
            io.shutdown().await;
        }
    }

    fn deliver_frames(&mut self) {
        let Some(subscription) = &self.subscription else {
            return;
        };
        if subscription.sink.is_closed() {
            debug!("Subscriber went away");
            self.subscription = None;
            return;
        }
        for frame in self.buffer.drain_frames(&subscription.delimiter) {
            if subscription.sink.send(Ok(frame)).is_err() {
                break;
            }
        }
    }

    async fn start_discovery(
        &mut self,
        sink: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), SerialError> {
        if self.state.is_connecting() {
            return Err(SerialError::ConnectionInProgress);
        }
        if self.discovery.is_discovering() {
            self.halt_scan().await;
            self.discovery.supersede();
        }

        let scan = self
            .platform
            .start_discovery()
            .await
            .map_err(SerialError::platform)?;
        let cycle = self.discovery.next_cycle();
        let pump = spawn_scan_pump(cycle, scan, self.event_tx.clone());
        self.discovery.started(cycle, sink, pump);
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<(), SerialError> {
        if !self.discovery.is_discovering() {
            return Err(SerialError::NoDiscovery);
        }
        self.halt_scan().await;
        self.discovery.cancel()
    }

    async fn halt_scan(&self) {
        if let Err(e) = self.platform.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
    }

    async fn pair(&mut self, address: Address, reply: PairingReply) {
        if self.pairing.is_pending() {
            let _ = reply.send(Err(SerialError::PairingInProgress));
            return;
        }
        info!("Pairing with {}", address);
        match self.platform.create_bond(address).await {
            Ok(()) => self.pairing.begin(address, reply),
            Err(e) => {
                warn!("Bonding with {} failed: {}", address, e);
                let _ = reply.send(Err(SerialError::PairingFailed(e.to_string())));
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stop().await;
        if self.discovery.is_discovering() {
            self.halt_scan().await;
            self.discovery.interrupt();
        }
        if let Some(pump) = self.platform_pump.take() {
            pump.abort();
        }
    }
}
