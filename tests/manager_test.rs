//! Integration tests for the serial manager against an in-memory platform.

use anyhow::{bail, Result};
use bluer::Address;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use bluetooth_serial::bluetooth::{Device, Platform, PlatformEvent, SerialListener, SerialStream};
use bluetooth_serial::discovery::DiscoveryEvent;
use bluetooth_serial::{Config, ConnectionState, SerialError, SerialEvent, SerialManager};

const PEER: &str = "00:11:22:33:44:55";
/// Connects to this address never complete.
const SLOW_PEER: &str = "00:11:22:33:44:EE";
const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
enum ConnectScript {
    Succeed,
    /// Connects, but every write fails while reads keep working.
    RefuseWrites,
    Fail,
}

/// Socket whose transmit side is broken.
struct RefusingWrites(DuplexStream);

impl AsyncRead for RefusingWrites {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for RefusingWrites {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "transmit failed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

type ScanSender = mpsc::UnboundedSender<Result<Device>>;
type Inbound = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(SerialStream, Address)>>>;

struct MockPlatform {
    scripts: Mutex<VecDeque<ConnectScript>>,
    remotes: mpsc::UnboundedSender<DuplexStream>,
    inbound: Inbound,
    scans: mpsc::UnboundedSender<ScanSender>,
    bond_rx: Mutex<Option<mpsc::UnboundedReceiver<PlatformEvent>>>,
    bonded: Vec<Device>,
    bond_requests: AtomicUsize,
    scan_stops: AtomicUsize,
}

struct MockListener {
    inbound: Option<Inbound>,
}

impl SerialListener for MockListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<(SerialStream, Address)>> {
        Box::pin(async move {
            let Some(inbound) = &self.inbound else {
                return futures::future::pending().await;
            };
            match inbound.lock().await.recv().await {
                Some(accepted) => Ok(accepted),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "listener closed")),
            }
        })
    }
}

fn unfold_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

impl Platform for MockPlatform {
    fn is_enabled(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn bonded_devices(&self) -> BoxFuture<'_, Result<Vec<Device>>> {
        Box::pin(async move { Ok(self.bonded.clone()) })
    }

    fn is_bonded(&self, address: Address) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.bonded.iter().any(|d| d.address == address)) })
    }

    fn create_bond(&self, address: Address) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.bonded.iter().any(|d| d.address == address) {
                bail!("The device is already paired.");
            }
            self.bond_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn start_discovery(&self) -> BoxFuture<'_, Result<BoxStream<'static, Result<Device>>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scans
                .send(tx)
                .map_err(|_| anyhow::anyhow!("scan receiver dropped"))?;
            Ok(unfold_stream(rx))
        })
    }

    fn stop_discovery(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.scan_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn connect(&self, address: Address, _secure: bool) -> BoxFuture<'_, io::Result<SerialStream>> {
        Box::pin(async move {
            if SLOW_PEER.parse::<Address>().ok() == Some(address) {
                return futures::future::pending().await;
            }
            let script = self.scripts.lock().pop_front().unwrap_or(ConnectScript::Fail);
            match script {
                ConnectScript::Succeed => {
                    let (local, remote) = tokio::io::duplex(1024);
                    let _ = self.remotes.send(remote);
                    Ok(Box::new(local) as SerialStream)
                }
                ConnectScript::RefuseWrites => {
                    let (local, remote) = tokio::io::duplex(1024);
                    let _ = self.remotes.send(remote);
                    Ok(Box::new(RefusingWrites(local)) as SerialStream)
                }
                ConnectScript::Fail => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
            }
        })
    }

    fn listen(&self, secure: bool) -> BoxFuture<'_, io::Result<Box<dyn SerialListener>>> {
        let inbound = secure.then(|| self.inbound.clone());
        Box::pin(async move { Ok(Box::new(MockListener { inbound }) as Box<dyn SerialListener>) })
    }

    fn events(&self) -> BoxStream<'static, PlatformEvent> {
        match self.bond_rx.lock().take() {
            Some(rx) => unfold_stream(rx),
            None => futures::stream::empty().boxed(),
        }
    }
}

struct Harness {
    manager: SerialManager,
    platform: Arc<MockPlatform>,
    remotes: mpsc::UnboundedReceiver<DuplexStream>,
    inbound: mpsc::UnboundedSender<(SerialStream, Address)>,
    bonds: mpsc::UnboundedSender<PlatformEvent>,
    scans: mpsc::UnboundedReceiver<ScanSender>,
}

impl Harness {
    fn new(scripts: &[ConnectScript], accept_incoming: bool) -> Self {
        Self::with_bonded(scripts, accept_incoming, Vec::new())
    }

    fn with_bonded(scripts: &[ConnectScript], accept_incoming: bool, bonded: Vec<Device>) -> Self {
        let mut config = Config::default();
        config.bluetooth.accept_incoming = accept_incoming;
        Self::with_config(scripts, &config, bonded)
    }

    fn with_config(scripts: &[ConnectScript], config: &Config, bonded: Vec<Device>) -> Self {
        let (remotes_tx, remotes) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (bonds, bond_rx) = mpsc::unbounded_channel();
        let (scans_tx, scans) = mpsc::unbounded_channel();

        let platform = Arc::new(MockPlatform {
            scripts: Mutex::new(scripts.iter().copied().collect()),
            remotes: remotes_tx,
            inbound: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            scans: scans_tx,
            bond_rx: Mutex::new(Some(bond_rx)),
            bonded,
            bond_requests: AtomicUsize::new(0),
            scan_stops: AtomicUsize::new(0),
        });

        let manager = SerialManager::spawn(platform.clone(), config);

        Self {
            manager,
            platform,
            remotes,
            inbound,
            bonds,
            scans,
        }
    }

    async fn wait_for_state(&self, expected: ConnectionState) {
        timeout(WAIT, async {
            while self.manager.state().await.unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state {} not reached", expected));
    }

    async fn remote(&mut self) -> DuplexStream {
        timeout(WAIT, self.remotes.recv()).await.unwrap().unwrap()
    }

    async fn scan(&mut self) -> ScanSender {
        timeout(WAIT, self.scans.recv()).await.unwrap().unwrap()
    }
}

fn device(name: &str, last: u8) -> Device {
    Device {
        name: name.to_string(),
        address: Address::new([0, 0x11, 0x22, 0x33, 0x44, last]),
        device_class: None,
    }
}

#[tokio::test]
async fn test_connect_failure_returns_to_none_and_allows_retry() {
    let h = Harness::new(&[ConnectScript::Fail, ConnectScript::Succeed], false);

    let err = h.manager.connect(PEER, true).await.unwrap_err();
    assert_eq!(err, SerialError::ConnectFailed);
    assert_eq!(err.to_string(), "Unable to connect to device");
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);

    h.manager.connect(PEER, true).await.unwrap();
    assert!(h.manager.is_connected().await.unwrap());
}

#[tokio::test]
async fn test_default_config_failure_ends_in_none() {
    let h = Harness::with_config(&[ConnectScript::Fail], &Config::default(), Vec::new());
    let mut events = h.manager.events();

    let err = h.manager.connect(PEER, true).await.unwrap_err();
    assert_eq!(err, SerialError::ConnectFailed);
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SerialEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::None]);
}

#[tokio::test]
async fn test_failure_restarts_listening_when_accepting() {
    let h = Harness::new(&[ConnectScript::Fail], true);

    assert!(h.manager.connect(PEER, false).await.is_err());
    h.wait_for_state(ConnectionState::Listening).await;
}

#[tokio::test]
async fn test_superseded_connect_is_cancelled() {
    let h = Harness::new(&[ConnectScript::Succeed], false);

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.connect(SLOW_PEER, true).await })
    };
    h.wait_for_state(ConnectionState::Connecting).await;
    assert!(h.manager.is_connecting().await.unwrap());

    h.manager.connect(PEER, true).await.unwrap();

    let superseded = first.await.unwrap().unwrap_err();
    assert_eq!(superseded, SerialError::ConnectCancelled);
    assert!(superseded.is_cancellation());
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_stop_twice_is_idempotent() {
    let h = Harness::new(&[ConnectScript::Succeed], false);
    h.manager.connect(PEER, true).await.unwrap();

    h.manager.stop().await.unwrap();
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);
    h.manager.stop().await.unwrap();
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);
}

#[tokio::test]
async fn test_invalid_address_is_rejected() {
    let h = Harness::new(&[], false);

    let err = h.manager.connect("not-an-address", true).await.unwrap_err();
    assert!(matches!(err, SerialError::InvalidAddress(_)));
    assert_eq!(err.code(), 404);
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);
}

#[tokio::test]
async fn test_subscriber_receives_whole_frames() {
    let mut h = Harness::new(&[ConnectScript::Succeed], false);
    h.manager.connect(PEER, true).await.unwrap();
    let mut remote = h.remote().await;

    let mut subscription = h.manager.subscribe("\n").await.unwrap();
    remote.write_all(b"ab").await.unwrap();
    remote.write_all(b"cd\n").await.unwrap();

    let frame = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
    assert_eq!(frame, Ok(b"abcd\n".to_vec()));
    assert!(timeout(Duration::from_millis(50), subscription.next()).await.is_err());
    assert_eq!(h.manager.available().await.unwrap(), 0);
}

#[tokio::test]
async fn test_buffer_reads() {
    let mut h = Harness::new(&[ConnectScript::Succeed], false);
    h.manager.connect(PEER, true).await.unwrap();
    let mut remote = h.remote().await;

    remote.write_all(b"AT\r\nOK\r").await.unwrap();
    timeout(WAIT, async {
        while h.manager.available().await.unwrap() < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.manager.read_until("\r\n").await.unwrap(), b"AT\r\n".to_vec());
    assert!(h.manager.read_until("\r\n").await.unwrap().is_empty());
    assert_eq!(h.manager.available().await.unwrap(), 3);
    assert_eq!(h.manager.read().await.unwrap(), b"OK\r".to_vec());

    remote.write_all(b"junk").await.unwrap();
    timeout(WAIT, async {
        while h.manager.available().await.unwrap() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.manager.clear().await.unwrap();
    assert_eq!(h.manager.available().await.unwrap(), 0);
}

#[tokio::test]
async fn test_write_requires_connection() {
    let mut h = Harness::new(&[ConnectScript::Succeed], false);

    let err = h.manager.write("hello").await.unwrap_err();
    assert_eq!(err, SerialError::NotConnected);

    h.manager.connect(PEER, true).await.unwrap();
    let mut remote = h.remote().await;
    h.manager.write("hello").await.unwrap();

    let mut buf = [0u8; 5];
    timeout(WAIT, remote.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_stop_fails_write_in_progress() {
    let mut h = Harness::new(&[ConnectScript::Succeed], false);
    h.manager.connect(PEER, true).await.unwrap();
    // Held open but never read, so a large write stalls.
    let _remote = h.remote().await;

    let write = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.write(vec![0u8; 64 * 1024]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.manager.stop().await.unwrap();

    let err = timeout(WAIT, write).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, SerialError::WriteFailed(_)), "got {:?}", err);
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);
}

#[tokio::test]
async fn test_failed_write_keeps_connection() {
    let mut h = Harness::new(&[ConnectScript::RefuseWrites], false);
    h.manager.connect(PEER, true).await.unwrap();
    let mut remote = h.remote().await;
    let mut events = h.manager.events();

    let err = h.manager.write("hello").await.unwrap_err();
    assert!(matches!(err, SerialError::WriteFailed(_)));
    assert_eq!(err.code(), 500);
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::Connected);

    // Reading still works after the failed write.
    remote.write_all(b"OK").await.unwrap();
    timeout(WAIT, async {
        while h.manager.available().await.unwrap() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SerialEvent::ConnectionLost { .. } | SerialEvent::StateChanged(_)),
            "unexpected {:?}",
            event
        );
    }
}

#[tokio::test]
async fn test_connection_loss_notifies_subscriber_and_observers() {
    let mut h = Harness::new(&[ConnectScript::Succeed], false);
    let mut events = h.manager.events();
    h.manager.connect(PEER, true).await.unwrap();
    let remote = h.remote().await;
    let mut subscription = h.manager.subscribe("\n").await.unwrap();

    drop(remote);

    let delivery = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
    assert_eq!(delivery, Err(SerialError::ConnectionLost));
    assert!(subscription.next().await.is_none());
    assert_eq!(h.manager.state().await.unwrap(), ConnectionState::None);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SerialEvent::StateChanged(ConnectionState::Connecting)));
    assert!(seen.contains(&SerialEvent::StateChanged(ConnectionState::Connected)));
    assert!(seen.contains(&SerialEvent::ConnectionLost {
        message: "Device connection was lost".to_string(),
    }));
}

#[tokio::test]
async fn test_incoming_connection_completes_listen() {
    let h = Harness::new(&[], true);
    let mut events = h.manager.events();

    h.manager.listen().await.unwrap();
    h.wait_for_state(ConnectionState::Listening).await;

    let (local, _remote) = tokio::io::duplex(64);
    let peer = Address::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
    h.inbound.send((Box::new(local), peer)).unwrap();

    h.wait_for_state(ConnectionState::Connected).await;
    let mut connected = false;
    while let Ok(event) = events.try_recv() {
        connected |= event == SerialEvent::Connected { address: peer };
    }
    assert!(connected);

    let err = h.manager.listen().await.unwrap_err();
    assert_eq!(err, SerialError::AlreadyConnected);
}

#[tokio::test]
async fn test_pair_while_pending_is_rejected() {
    let h = Harness::new(&[], false);
    let target = device("callbell", 0x55);

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move { manager.pair(PEER).await })
    };
    timeout(WAIT, async {
        while h.platform.bond_requests.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = h.manager.pair("00:11:22:33:44:66").await.unwrap_err();
    assert_eq!(err, SerialError::PairingInProgress);
    assert_eq!(err.code(), 404);
    assert_eq!(h.platform.bond_requests.load(Ordering::SeqCst), 1);

    h.bonds
        .send(PlatformEvent::BondStateChanged {
            device: target.clone(),
            bonded: true,
        })
        .unwrap();
    assert_eq!(first.await.unwrap(), Ok(target));
}

#[tokio::test]
async fn test_pair_already_bonded_fails() {
    let h = Harness::with_bonded(&[], false, vec![device("callbell", 0x55)]);

    assert!(h.manager.is_paired(PEER).await.unwrap());
    assert_eq!(h.manager.list().await.unwrap().len(), 1);

    let err = h.manager.pair(PEER).await.unwrap_err();
    assert_eq!(
        err,
        SerialError::PairingFailed("The device is already paired.".into())
    );
    assert_eq!(err.code(), 500);
}

#[tokio::test]
async fn test_new_discovery_supersedes_old() {
    let mut h = Harness::new(&[], false);

    let mut old = h.manager.start_discovery().await.unwrap();
    let _old_scan = h.scan().await;
    let mut fresh = h.manager.start_discovery().await.unwrap();
    let scan = h.scan().await;

    let stopped = timeout(WAIT, old.next()).await.unwrap().unwrap();
    assert_eq!(stopped, DiscoveryEvent::Stopped(SerialError::DiscoverySuperseded));
    if let DiscoveryEvent::Stopped(err) = stopped {
        assert_eq!(err.code(), 505);
    }

    scan.send(Ok(device("callbell", 1))).unwrap();
    drop(scan);
    assert_eq!(
        timeout(WAIT, fresh.next()).await.unwrap(),
        Some(DiscoveryEvent::DeviceFound(device("callbell", 1)))
    );
    assert_eq!(
        timeout(WAIT, fresh.next()).await.unwrap(),
        Some(DiscoveryEvent::Finished)
    );
    assert!(!h.manager.is_discovering().await.unwrap());
}

#[tokio::test]
async fn test_stop_discovery() {
    let mut h = Harness::new(&[], false);

    assert_eq!(
        h.manager.stop_discovery().await.unwrap_err(),
        SerialError::NoDiscovery
    );

    let mut discovery = h.manager.start_discovery().await.unwrap();
    let _scan = h.scan().await;
    assert!(h.manager.is_discovering().await.unwrap());

    h.manager.stop_discovery().await.unwrap();
    let stopped = timeout(WAIT, discovery.next()).await.unwrap().unwrap();
    assert_eq!(stopped, DiscoveryEvent::Stopped(SerialError::DiscoveryCancelled));
    assert_eq!(h.platform.scan_stops.load(Ordering::SeqCst), 1);
    assert!(!h.manager.is_discovering().await.unwrap());
}

#[tokio::test]
async fn test_discovery_rejected_while_connecting() {
    let h = Harness::new(&[], false);

    let manager = h.manager.clone();
    let _pending = tokio::spawn(async move { manager.connect(SLOW_PEER, true).await });
    h.wait_for_state(ConnectionState::Connecting).await;

    let err = h.manager.start_discovery().await.err().unwrap();
    assert_eq!(err, SerialError::ConnectionInProgress);
    assert_eq!(err.code(), 404);
}

#[tokio::test]
async fn test_connect_finishes_running_discovery() {
    let mut h = Harness::new(&[ConnectScript::Succeed], false);

    let mut discovery = h.manager.start_discovery().await.unwrap();
    let _scan = h.scan().await;

    h.manager.connect(PEER, true).await.unwrap();

    assert_eq!(
        timeout(WAIT, discovery.next()).await.unwrap(),
        Some(DiscoveryEvent::Finished)
    );
    assert_eq!(h.platform.scan_stops.load(Ordering::SeqCst), 1);
    assert!(!h.manager.is_discovering().await.unwrap());
}
