use crate::*;

use bytes::Bytes;
use trove_core::wire::MessageType;
use trove_core::{Chunk, ChunkKey, FileId};
use trove_services::Control;

fn chunk(c: char) -> Chunk {
    let file_id: FileId = c.to_string().repeat(64).parse().unwrap();
    Chunk::new(ChunkKey::new(file_id, 0), Bytes::from_static(b"lifecycle"))
}

#[tokio::test]
async fn persisted_state_survives_restart() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Enhanced).spawn(&bus);
    let stored = chunk('a');
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Enhanced, 1, &stored, 1));
    assert!(wait_until(Duration::from_secs(1), || holder.state().is_stored_chunk(&stored.key)).await);

    holder.peer.persist_if_dirty();
    assert!(holder.root.join("state.json").exists());

    let reopened = FsStore::new(holder.root.clone()).unwrap();
    let saved = reopened.load_state().unwrap().expect("state.json written");
    assert_eq!(saved, holder.state().snapshot());

    let restored = PeerState::from_persisted(saved);
    assert!(restored.is_stored_chunk(&stored.key));
    assert_eq!(restored.usage(), holder.state().usage());
    assert!(!restored.take_dirty());
}

#[tokio::test]
async fn clean_state_is_not_rewritten() {
    let bus = Bus::new();
    let peer = PeerBuilder::new(1, Dialect::Baseline).spawn(&bus);
    let state_file = peer.root.join("state.json");

    peer.peer.persist_if_dirty();
    assert!(state_file.exists());
    std::fs::remove_file(&state_file).unwrap();

    peer.peer.persist_if_dirty();
    assert!(!state_file.exists());
}

#[tokio::test]
async fn state_dump_lists_every_section() {
    let bus = Bus::new();
    let peer = PeerBuilder::new(4, Dialect::Enhanced).max_storage(1_000).spawn(&bus);
    let dump = peer.peer.state();

    assert!(dump.starts_with("Peer 4 (dialect 2.0)"));
    assert!(dump.contains("Storage: 0 / 1000 bytes"));
    assert!(dump.contains("Backed up files:"));
    assert!(dump.contains("Stored chunks:"));
}

#[tokio::test]
async fn malformed_and_misrouted_datagrams_are_dropped() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).spawn(&bus);
    let mut control = bus.tap(ChannelKind::Control);

    let _ = bus.sender(ChannelKind::BackupData).send(Datagram {
        source: loopback(),
        bytes: b"1.0 PUTCHUNK garbage".to_vec(),
    });
    // Valid PUTCHUNK on the wrong channel.
    let misrouted = chunk('b');
    bus.inject(ChannelKind::Control, &Message::put_chunk(Dialect::Baseline, 1, &misrouted, 1));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!holder.state().is_stored_chunk(&misrouted.key));
    assert_eq!(holder.state().usage().used, 0);
    assert!(drain(&mut control)
        .iter()
        .all(|m| m.message_type() != MessageType::Stored));

    // Still serving afterwards.
    let good = chunk('c');
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 1, &good, 1));
    assert!(wait_until(Duration::from_secs(1), || holder.state().is_stored_chunk(&good.key)).await);
}

#[tokio::test]
async fn baseline_restart_is_silent() {
    let bus = Bus::new();
    let peer = PeerBuilder::new(1, Dialect::Baseline).spawn(&bus);
    let mut control = bus.tap(ChannelKind::Control);

    peer.peer.announce_startup();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut control).is_empty());
}

#[tokio::test]
async fn enhanced_restart_announces_itself() {
    let bus = Bus::new();
    let peer = PeerBuilder::new(6, Dialect::Enhanced).spawn(&bus);
    let mut control = bus.tap(ChannelKind::Control);

    peer.peer.announce_startup();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = drain(&mut control);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type(), MessageType::Startup);
    assert_eq!(messages[0].sender, 6);
    assert_eq!(messages[0].version, "2.0");
}
