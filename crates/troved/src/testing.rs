//! A peer whose channels record what it sends instead of sending it.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use trove_core::config::ProtocolConfig;
use trove_core::wire::Message;
use trove_core::{Dialect, PeerId};
use trove_services::{FsStore, PeerState};

use crate::channel::{Channel, ChannelKind, Channels, DatagramSink};
use crate::peer::{Peer, PeerOptions};

#[derive(Default)]
pub(crate) struct Recorder(Mutex<Vec<Vec<u8>>>);

impl DatagramSink for Recorder {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().push(datagram.to_vec());
        Ok(())
    }
}

impl Recorder {
    pub(crate) fn messages(&self) -> Vec<Message> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|d| Message::decode(d).unwrap())
            .collect()
    }
}

pub(crate) struct Harness {
    pub peer: Peer,
    pub control: Arc<Recorder>,
    pub backup: Arc<Recorder>,
    pub root: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Must be called inside a tokio runtime.
pub(crate) fn harness(id: PeerId, dialect: Dialect, max_storage: u64) -> Harness {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!("troved-test-{}-{}", std::process::id(), n));
    let _ = std::fs::remove_dir_all(&root);

    let control = Arc::new(Recorder::default());
    let backup = Arc::new(Recorder::default());
    let channels = Channels {
        control: Channel::new(ChannelKind::Control, control.clone()),
        backup: Channel::new(ChannelKind::BackupData, backup.clone()),
        restore: Channel::new(ChannelKind::RestoreData, Arc::new(Recorder::default())),
    };
    let protocol = ProtocolConfig {
        response_jitter_ms: 0,
        ..ProtocolConfig::default()
    };
    let peer = Peer::new(
        PeerOptions {
            id,
            dialect,
            protocol,
        },
        channels,
        PeerState::new(max_storage),
        Arc::new(FsStore::new(root.clone()).unwrap()),
    );
    Harness {
        peer,
        control,
        backup,
        root,
    }
}
