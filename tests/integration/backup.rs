use crate::*;

use bytes::Bytes;
use trove_core::wire::MessageType;
use trove_core::{Chunk, ChunkKey, FileId};
use trove_services::{Control, ControlError};

fn foreign_chunk(n: u32) -> Chunk {
    let file_id: FileId = "9".repeat(64).parse().unwrap();
    Chunk::new(ChunkKey::new(file_id, n), Bytes::from_static(b"someone else's data"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_reaches_desired_degree() {
    let bus = Bus::new();
    let peers = cluster(&bus, 4, Dialect::Baseline);
    let dir = temp_dir("backup-degree");
    let (path, _) = write_file(&dir, "photo.raw", 150_000);

    let file_id = peers[0].peer.backup(&path, 2).unwrap();
    let keys: Vec<ChunkKey> = (0..3).map(|n| ChunkKey::new(file_id.clone(), n)).collect();

    let owner = &peers[0];
    let reached = wait_until(Duration::from_secs(5), || {
        keys.iter()
            .all(|k| owner.state().backup_degree(k).unwrap_or(0) >= 2)
    })
    .await;
    assert!(reached, "degree not reached:\n{}", owner.peer.state());

    for key in &keys {
        let holders = peers[1..]
            .iter()
            .filter(|p| p.state().is_stored_chunk(key))
            .count();
        assert!(holders >= 2, "{key} held by {holders} peers");
        assert!(!owner.state().is_stored_chunk(key), "owner stored its own chunk");
    }
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn duplicate_and_invalid_requests_are_rejected() {
    let bus = Bus::new();
    let peer = PeerBuilder::new(1, Dialect::Baseline).spawn(&bus);
    let dir = temp_dir("backup-reject");
    let (path, _) = write_file(&dir, "a.txt", 10);

    assert!(matches!(
        peer.peer.backup(&path, 0),
        Err(ControlError::InvalidReplicationDegree(0))
    ));
    assert!(matches!(
        peer.peer.backup(&path, 10),
        Err(ControlError::InvalidReplicationDegree(10))
    ));
    assert!(matches!(
        peer.peer.backup(&dir.join("missing"), 1),
        Err(ControlError::Io(_))
    ));

    peer.peer.backup(&path, 1).unwrap();
    assert!(matches!(
        peer.peer.backup(&path, 1),
        Err(ControlError::AlreadyBackedUp(_))
    ));
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn lonely_owner_abandons_backup() {
    let bus = Bus::new();
    let protocol = ProtocolConfig {
        backup_tries: 2,
        backup_initial_delay_ms: 30,
        ..fast_protocol()
    };
    let peer = PeerBuilder::new(1, Dialect::Baseline).protocol(protocol).spawn(&bus);
    let dir = temp_dir("backup-abandon");
    let (path, _) = write_file(&dir, "a.txt", 10);

    let file_id = peer.peer.backup(&path, 1).unwrap();
    assert!(peer.state().is_backup_file(&file_id));

    let abandoned = wait_until(Duration::from_secs(2), || !peer.state().is_backup_file(&file_id)).await;
    assert!(abandoned);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn no_space_means_no_stored() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).max_storage(5).spawn(&bus);
    let mut control = bus.tap(ChannelKind::Control);

    let chunk = foreign_chunk(0);
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 1, &chunk, 1));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!holder.state().is_stored_chunk(&chunk.key));
    assert!(drain(&mut control).is_empty());
}

#[tokio::test]
async fn repeated_putchunk_is_acknowledged_but_stored_once() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).spawn(&bus);
    let mut control = bus.tap(ChannelKind::Control);

    let chunk = foreign_chunk(0);
    let put = Message::put_chunk(Dialect::Baseline, 1, &chunk, 1);
    bus.inject(ChannelKind::BackupData, &put);
    assert!(wait_until(Duration::from_secs(1), || holder.state().is_stored_chunk(&chunk.key)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let once = holder.state().snapshot();

    bus.inject(ChannelKind::BackupData, &put);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(holder.state().snapshot(), once);

    let stored: Vec<_> = drain(&mut control)
        .into_iter()
        .filter(|m| m.message_type() == MessageType::Stored && m.sender == 2)
        .collect();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn enhanced_putchunk_on_baseline_peer_stores_regardless() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).spawn(&bus);

    let chunk = foreign_chunk(2);
    bus.inject(ChannelKind::Control, &Message::stored(3, chunk.key.clone()));
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Enhanced, 1, &chunk, 1));
    bus.inject(ChannelKind::Control, &Message::stored(4, chunk.key.clone()));

    assert!(wait_until(Duration::from_secs(1), || holder.state().is_stored_chunk(&chunk.key)).await);
}

#[tokio::test]
async fn own_putchunk_for_held_chunk_answers_stored() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).spawn(&bus);

    let chunk = foreign_chunk(3);
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 1, &chunk, 2));
    assert!(wait_until(Duration::from_secs(1), || holder.state().is_stored_chunk(&chunk.key)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let used = holder.state().usage().used;

    let mut control = bus.tap(ChannelKind::Control);
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 2, &chunk, 2));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored: Vec<_> = drain(&mut control)
        .into_iter()
        .filter(|m| m.message_type() == MessageType::Stored && m.sender == 2)
        .collect();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key(), Some(&chunk.key));
    assert_eq!(holder.state().usage().used, used);
}

#[tokio::test]
async fn own_putchunk_for_unknown_chunk_is_ignored() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).spawn(&bus);
    let mut control = bus.tap(ChannelKind::Control);

    let chunk = foreign_chunk(4);
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 2, &chunk, 2));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!holder.state().is_stored_chunk(&chunk.key));
    assert!(drain(&mut control).is_empty());
}
