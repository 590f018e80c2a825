//! Trove integration test harness.
//!
//! Several peers run in one process. The three multicast groups are stood in
//! for by tokio broadcast channels, so every datagram reaches every peer on
//! that channel, the sender included, exactly like multicast with loopback.
//! Protocol timing is shortened so each test finishes in a few seconds.
//!
//!   cargo test --test integration

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use trove_core::config::ProtocolConfig;
use trove_core::wire::Message;
use trove_core::{Dialect, PeerId};
use trove_services::{ChunkStore, FsStore, PeerState};
use troved::{Channel, ChannelKind, Channels, DatagramSink, Peer, PeerOptions};

mod backup;
mod delete;
mod lifecycle;
mod reclaim;

// ── Loopback bus ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Datagram {
    pub source: SocketAddr,
    pub bytes: Vec<u8>,
}

/// One broadcast channel per multicast group.
pub struct Bus {
    control: broadcast::Sender<Datagram>,
    backup: broadcast::Sender<Datagram>,
    restore: broadcast::Sender<Datagram>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            control: broadcast::channel(4096).0,
            backup: broadcast::channel(4096).0,
            restore: broadcast::channel(4096).0,
        })
    }

    fn sender(&self, kind: ChannelKind) -> &broadcast::Sender<Datagram> {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::BackupData => &self.backup,
            ChannelKind::RestoreData => &self.restore,
        }
    }

    /// Receive everything sent on a channel from now on.
    pub fn tap(&self, kind: ChannelKind) -> broadcast::Receiver<Datagram> {
        self.sender(kind).subscribe()
    }

    /// Broadcast a message as if some (possibly absent) peer sent it.
    pub fn inject(&self, kind: ChannelKind, message: &Message) {
        let _ = self.sender(kind).send(Datagram {
            source: loopback(),
            bytes: message.encode(),
        });
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

struct BusSink {
    tx: broadcast::Sender<Datagram>,
    online: Arc<AtomicBool>,
}

impl DatagramSink for BusSink {
    fn send_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        if self.online.load(Ordering::Acquire) {
            // No receivers is not an error on a multicast group either.
            let _ = self.tx.send(Datagram {
                source: loopback(),
                bytes: datagram.to_vec(),
            });
        }
        Ok(())
    }
}

/// Decode every datagram received so far on a tap.
pub fn drain(rx: &mut broadcast::Receiver<Datagram>) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(d) => {
                if let Ok(m) = Message::decode(&d.bytes) {
                    messages.push(m);
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return messages,
        }
    }
}

// ── Test peers ────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(label: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "trove-it-{label}-{}-{}",
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        backup_tries: 5,
        backup_initial_delay_ms: 150,
        delete_tries: 3,
        delete_interval_ms: 100,
        response_jitter_ms: 20,
        transfer_timeout_ms: 1000,
        persist_interval_ms: 100,
    }
}

pub struct TestPeer {
    pub peer: Peer,
    pub root: PathBuf,
    online: Arc<AtomicBool>,
}

impl TestPeer {
    pub fn state(&self) -> &PeerState {
        self.peer.state_store()
    }

    /// Offline peers neither hear nor send anything.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn recovered(&self, name: &str) -> PathBuf {
        self.root.join("recovered").join(name)
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub struct PeerBuilder {
    id: PeerId,
    dialect: Dialect,
    max_storage: u64,
    protocol: ProtocolConfig,
}

impl PeerBuilder {
    pub fn new(id: PeerId, dialect: Dialect) -> Self {
        Self {
            id,
            dialect,
            max_storage: u64::from(u32::MAX),
            protocol: fast_protocol(),
        }
    }

    pub fn max_storage(mut self, bytes: u64) -> Self {
        self.max_storage = bytes;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Wire a peer to the bus. Must run inside a tokio runtime.
    pub fn spawn(self, bus: &Arc<Bus>) -> TestPeer {
        let root = temp_dir(&format!("peer{}", self.id));
        let online = Arc::new(AtomicBool::new(true));

        let channel = |kind: ChannelKind| {
            let sink = BusSink {
                tx: bus.sender(kind).clone(),
                online: online.clone(),
            };
            Channel::new(kind, Arc::new(sink))
        };
        let channels = Channels {
            control: channel(ChannelKind::Control),
            backup: channel(ChannelKind::BackupData),
            restore: channel(ChannelKind::RestoreData),
        };

        let store: Arc<dyn ChunkStore> = Arc::new(FsStore::new(root.clone()).unwrap());
        let peer = Peer::new(
            PeerOptions {
                id: self.id,
                dialect: self.dialect,
                protocol: self.protocol,
            },
            channels,
            PeerState::new(self.max_storage),
            store,
        );

        for kind in ChannelKind::ALL {
            let mut rx = bus.tap(kind);
            let peer = peer.clone();
            let online = online.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(d) if online.load(Ordering::Acquire) => peer.deliver(kind, &d.bytes, d.source),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }

        TestPeer { peer, root, online }
    }
}

/// Peers `1..=n`, all speaking `dialect`.
pub fn cluster(bus: &Arc<Bus>, n: u32, dialect: Dialect) -> Vec<TestPeer> {
    (1..=n).map(|id| PeerBuilder::new(id, dialect).spawn(bus)).collect()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Deterministic file content of `len` bytes.
pub fn write_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &content).unwrap();
    (path, content)
}
