//! Space reclaim: evict chunks to fit a new cap, and re-replicate chunks
//! another peer evicted.

use trove_core::wire::Message;
use trove_core::{Chunk, ChunkKey, PeerId};

use crate::channel::ChannelKind;
use crate::peer::Peer;
use crate::protocol::backup::{BackupInitiator, BackupOrigin};

impl Peer {
    /// Apply a new storage cap. Each evicted chunk is announced with REMOVED
    /// before its content is deleted. Returns the number evicted.
    pub(crate) fn reclaim_space(&self, max_bytes: u64) -> usize {
        let evicted = self.state_store().reclaim(max_bytes);
        for key in &evicted {
            self.send(ChannelKind::Control, &Message::removed(self.id(), key.clone()));
            if let Err(e) = self.store().delete_chunk(key) {
                tracing::warn!(peer = self.id(), chunk = %key, error = %e, "failed to delete evicted chunk");
            }
        }

        let usage = self.state_store().usage();
        tracing::info!(
            peer = self.id(),
            max_bytes,
            used = usage.used,
            evicted = evicted.len(),
            "storage reclaimed"
        );
        evicted.len()
    }

    /// Another peer dropped a chunk. If this peer holds it too and the chunk
    /// fell below its desired degree, re-back it up unless somebody else
    /// starts first.
    pub(crate) async fn record_removed(self, sender: PeerId, key: ChunkKey) {
        let state = self.state_store();
        state.remove_backup_peer(&key, sender);
        state.remove_stored_peer(&key, sender);

        let (Some(perceived), Some(desired)) =
            (state.stored_degree(&key), state.stored_desired(&key.file_id))
        else {
            return;
        };
        if perceived >= u32::from(desired) {
            return;
        }

        self.inner.reclaim_sync.begin(key.clone());
        tokio::time::sleep(self.jitter()).await;
        let needed = self.inner.reclaim_sync.still_needed(&key);
        self.inner.reclaim_sync.end(&key);

        if !needed {
            tracing::debug!(peer = self.id(), chunk = %key, "another peer is re-backing up");
            return;
        }

        let content = match self.store().load_chunk(&key) {
            Ok(Some(content)) => content,
            Ok(None) => {
                tracing::warn!(peer = self.id(), chunk = %key, "chunk to re-back up is missing on disk");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = self.id(), chunk = %key, error = %e, "failed to load chunk");
                return;
            }
        };

        tracing::info!(peer = self.id(), chunk = %key, perceived, desired, "re-backing up chunk");
        let protocol = self.protocol();
        self.start_backup(BackupInitiator::new(
            Chunk::new(key, content),
            desired,
            protocol.backup_tries,
            protocol.backup_initial_delay(),
            BackupOrigin::Reclaim,
        ));
    }
}
