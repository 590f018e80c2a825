use crate::*;

use trove_core::wire::MessageType;
use trove_core::{ChunkKey, FileId};
use trove_services::Control;

/// Back up a one-chunk file from peer 1 onto every other peer.
async fn spread(peers: &[TestPeer], dir: &Path, degree: u8) -> (PathBuf, FileId) {
    let (path, _) = write_file(dir, "old.log", 3_000);
    let file_id = peers[0].peer.backup(&path, degree).unwrap();
    let key = ChunkKey::new(file_id.clone(), 0);
    let everywhere = wait_until(Duration::from_secs(5), || {
        peers[1..].iter().all(|p| p.state().is_stored_chunk(&key))
            && peers[0].state().backup_degree(&key) == Some(peers.len() as u32 - 1)
    })
    .await;
    assert!(everywhere, "chunk not spread:\n{}", peers[0].peer.state());
    (path, file_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn baseline_delete_clears_every_holder() {
    let bus = Bus::new();
    let peers = cluster(&bus, 3, Dialect::Baseline);
    let dir = temp_dir("delete-baseline");
    let (path, file_id) = spread(&peers, &dir, 2).await;

    let mut control = bus.tap(ChannelKind::Control);
    assert_eq!(peers[0].peer.delete(&path).unwrap(), file_id);
    assert!(!peers[0].state().is_backup_file(&file_id));

    let gone = wait_until(Duration::from_secs(2), || {
        peers[1..].iter().all(|p| !p.state().is_stored_file(&file_id))
    })
    .await;
    assert!(gone);
    for holder in &peers[1..] {
        assert!(!holder.chunk_dir().join(file_id.as_str()).exists());
        assert_eq!(holder.state().usage().used, 0);
    }

    // Every try goes out; baseline peers never acknowledge.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let messages = drain(&mut control);
    let deletes = messages
        .iter()
        .filter(|m| m.message_type() == MessageType::Delete && m.sender == 1)
        .count();
    assert_eq!(deletes, 3);
    assert!(messages.iter().all(|m| m.message_type() != MessageType::Deleted));
    assert!(peers[0].state().all_undeleted().is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enhanced_delete_is_acknowledged() {
    let bus = Bus::new();
    let peers = cluster(&bus, 3, Dialect::Enhanced);
    let dir = temp_dir("delete-enhanced");
    let (path, file_id) = spread(&peers, &dir, 2).await;

    let mut control = bus.tap(ChannelKind::Control);
    peers[0].peer.delete(&path).unwrap();

    let acknowledged = wait_until(Duration::from_secs(2), || {
        !peers[0].state().is_undeleted(&file_id)
    })
    .await;
    assert!(acknowledged, "{}", peers[0].peer.state());
    assert!(peers[1..].iter().all(|p| !p.state().is_stored_file(&file_id)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let messages = drain(&mut control);
    let deleted_from: Vec<u32> = messages
        .iter()
        .filter(|m| m.message_type() == MessageType::Deleted)
        .map(|m| m.sender)
        .collect();
    assert!(deleted_from.contains(&2) && deleted_from.contains(&3));
    let deletes: Vec<_> = messages
        .iter()
        .filter(|m| m.message_type() == MessageType::Delete)
        .collect();
    assert!(deletes.len() < 3, "retries continued after acknowledgment");
    assert!(deletes.iter().all(|m| m.version == "2.0"));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn startup_gets_missed_delete_resent() {
    let bus = Bus::new();
    let peers = cluster(&bus, 3, Dialect::Enhanced);
    let dir = temp_dir("delete-startup");
    let (path, file_id) = spread(&peers, &dir, 2).await;

    peers[2].set_online(false);
    peers[0].peer.delete(&path).unwrap();

    // Peer 2 answers; peer 3 misses every try.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(peers[0].state().undeleted_files_of(3), vec![file_id.clone()]);
    assert!(peers[0].state().undeleted_files_of(2).is_empty());
    assert!(peers[2].state().is_stored_file(&file_id));

    peers[2].set_online(true);
    peers[2].peer.announce_startup();

    let converged = wait_until(Duration::from_secs(2), || {
        !peers[2].state().is_stored_file(&file_id) && !peers[0].state().is_undeleted(&file_id)
    })
    .await;
    assert!(converged, "{}", peers[0].peer.state());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rebackup_clears_pending_deletes() {
    let bus = Bus::new();
    let peers = cluster(&bus, 2, Dialect::Enhanced);
    let dir = temp_dir("delete-rebackup");
    let (path, file_id) = spread(&peers, &dir, 1).await;

    peers[1].set_online(false);
    peers[0].peer.delete(&path).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(peers[0].state().is_undeleted(&file_id));

    peers[1].set_online(true);
    assert_eq!(peers[0].peer.backup(&path, 1).unwrap(), file_id);
    assert!(!peers[0].state().is_undeleted(&file_id));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn repeated_delete_is_harmless() {
    let bus = Bus::new();
    let holder = PeerBuilder::new(2, Dialect::Enhanced).spawn(&bus);
    let file_id: FileId = "7".repeat(64).parse().unwrap();
    let mut control = bus.tap(ChannelKind::Control);

    let delete = Message::delete(Dialect::Enhanced, 1, file_id.clone());
    bus.inject(ChannelKind::Control, &delete);
    bus.inject(ChannelKind::Control, &delete);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Nothing stored, yet each DELETE is answered so the sender can stop.
    let acks = drain(&mut control)
        .into_iter()
        .filter(|m| m.message_type() == MessageType::Deleted && m.sender == 2)
        .count();
    assert_eq!(acks, 2);
    assert_eq!(holder.state().usage().used, 0);
}
