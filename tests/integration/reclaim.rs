use crate::*;

use trove_core::wire::MessageType;
use trove_core::ChunkKey;
use trove_services::Control;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reclaimed_chunk_is_backed_up_elsewhere() {
    let bus = Bus::new();
    let peers = cluster(&bus, 5, Dialect::Baseline);
    let dir = temp_dir("reclaim-rebackup");
    let (path, _) = write_file(&dir, "archive.tar", 20_000);

    peers[4].set_online(false);
    let file_id = peers[0].peer.backup(&path, 3).unwrap();
    let key = ChunkKey::new(file_id.clone(), 0);
    let spread = wait_until(Duration::from_secs(5), || {
        peers[1..4].iter().all(|p| p.state().is_stored_chunk(&key))
            && peers[0].state().backup_degree(&key) == Some(3)
    })
    .await;
    assert!(spread, "{}", peers[0].peer.state());
    // Let late STOREDs settle before the fifth peer shows up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    peers[4].set_online(true);
    let mut control = bus.tap(ChannelKind::Control);
    let mut backup = bus.tap(ChannelKind::BackupData);
    assert_eq!(peers[1].peer.reclaim(0).unwrap(), 1);

    assert_eq!(peers[1].state().usage(), trove_services::state::StorageUsage { max: 0, used: 0 });
    assert!(!peers[1].state().is_stored_chunk(&key));
    assert!(!peers[1].chunk_dir().join(file_id.as_str()).join("0").exists());

    let replaced = wait_until(Duration::from_secs(5), || {
        peers[4].state().is_stored_chunk(&key) && peers[0].state().backup_degree(&key) == Some(3)
    })
    .await;
    assert!(replaced, "{}", peers[0].peer.state());
    assert!(!peers[1].state().is_stored_chunk(&key), "reclaimed peer stored the chunk again");

    let removed: Vec<_> = drain(&mut control)
        .into_iter()
        .filter(|m| m.message_type() == MessageType::Removed)
        .collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].sender, 2);
    assert_eq!(removed[0].key(), Some(&key));

    let rebackups: Vec<_> = drain(&mut backup)
        .into_iter()
        .filter(|m| m.message_type() == MessageType::PutChunk)
        .collect();
    assert!(!rebackups.is_empty());
    assert!(rebackups.iter().all(|m| m.sender == 3 || m.sender == 4));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn satisfied_degree_skips_rebackup() {
    let bus = Bus::new();
    let peers = cluster(&bus, 3, Dialect::Baseline);
    let dir = temp_dir("reclaim-satisfied");
    let (path, _) = write_file(&dir, "small.bin", 1_000);

    let file_id = peers[0].peer.backup(&path, 1).unwrap();
    let key = ChunkKey::new(file_id, 0);
    // Baseline holders store every PUTCHUNK they hear.
    let both = wait_until(Duration::from_secs(5), || {
        peers[1..].iter().all(|p| p.state().is_stored_chunk(&key))
    })
    .await;
    assert!(both);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut backup = bus.tap(ChannelKind::BackupData);
    assert_eq!(peers[1].peer.reclaim(0).unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(drain(&mut backup).is_empty());
    assert!(peers[2].state().is_stored_chunk(&key));
    assert_eq!(peers[0].state().backup_degree(&key), Some(1));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn reclaim_within_usage_evicts_nothing() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Baseline).spawn(&bus);
    let file_id: trove_core::FileId = "c".repeat(64).parse().unwrap();
    let chunk = trove_core::Chunk::new(
        ChunkKey::new(file_id, 0),
        bytes::Bytes::from_static(&[7u8; 500]),
    );
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 1, &chunk, 1));
    assert!(wait_until(Duration::from_secs(1), || holder.state().is_stored_chunk(&chunk.key)).await);

    let mut control = bus.tap(ChannelKind::Control);
    assert_eq!(holder.peer.reclaim(500).unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(holder.state().is_stored_chunk(&chunk.key));
    assert_eq!(holder.state().usage().max, 500);
    assert!(drain(&mut control)
        .iter()
        .all(|m| m.message_type() != MessageType::Removed));

    // A PUTCHUNK that no longer fits is refused.
    let other = trove_core::Chunk::new(
        ChunkKey::new(chunk.key.file_id.clone(), 1),
        bytes::Bytes::from_static(b"x"),
    );
    bus.inject(ChannelKind::BackupData, &Message::put_chunk(Dialect::Baseline, 1, &other, 1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!holder.state().is_stored_chunk(&other.key));
}
