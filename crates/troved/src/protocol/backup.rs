//! Chunk backup: PUTCHUNK until enough peers answer STORED.

use std::time::Duration;

use bytes::Bytes;
use trove_core::wire::Message;
use trove_core::{Chunk, ChunkKey, PeerId};
use trove_services::Reservation;

use crate::channel::ChannelKind;
use crate::peer::Peer;

/// Whose bookkeeping a backup initiator reads its degree from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOrigin {
    /// This peer asked for the backup; degree comes from its backup files.
    Owner,
    /// Re-backup after a REMOVED; degree comes from the stored chunk.
    Reclaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStep {
    /// Broadcast PUTCHUNK, then check again after `wait`.
    Send { wait: Duration },
    Reached { perceived: u32 },
    Exhausted { perceived: u32 },
    /// Tries ran out and nobody stored anything: drop the request.
    Abandon,
    /// The file or chunk is no longer tracked.
    Cancelled,
}

/// Retry state of one chunk's backup.
#[derive(Debug, Clone)]
pub struct BackupInitiator {
    pub chunk: Chunk,
    pub desired: u8,
    pub tries_left: u32,
    pub delay: Duration,
    pub origin: BackupOrigin,
}

impl BackupInitiator {
    pub fn new(chunk: Chunk, desired: u8, tries: u32, initial_delay: Duration, origin: BackupOrigin) -> Self {
        Self {
            chunk,
            desired,
            tries_left: tries,
            delay: initial_delay,
            origin,
        }
    }

    /// Advance one tick given the current perceived degree (`None` when the
    /// chunk is no longer tracked). The delay doubles after every send.
    pub fn step(&mut self, perceived: Option<u32>) -> BackupStep {
        let Some(perceived) = perceived else {
            return BackupStep::Cancelled;
        };
        if perceived >= u32::from(self.desired) {
            return BackupStep::Reached { perceived };
        }
        if self.tries_left == 0 {
            if self.origin == BackupOrigin::Owner && perceived == 0 {
                return BackupStep::Abandon;
            }
            return BackupStep::Exhausted { perceived };
        }

        self.tries_left -= 1;
        let wait = self.delay;
        self.delay = self.delay.saturating_mul(2);
        BackupStep::Send { wait }
    }
}

impl Peer {
    fn perceived_degree(&self, origin: BackupOrigin, key: &ChunkKey) -> Option<u32> {
        match origin {
            BackupOrigin::Owner => self.state_store().backup_degree(key),
            BackupOrigin::Reclaim => self.state_store().stored_degree(key),
        }
    }

    pub(crate) fn start_backup(&self, initiator: BackupInitiator) {
        let peer = self.clone();
        self.spawn(async move { peer.run_backup(initiator).await });
    }

    async fn run_backup(self, mut initiator: BackupInitiator) {
        let key = initiator.chunk.key.clone();
        loop {
            let perceived = self.perceived_degree(initiator.origin, &key);
            match initiator.step(perceived) {
                BackupStep::Send { wait } => {
                    let message = Message::put_chunk(
                        self.dialect(),
                        self.id(),
                        &initiator.chunk,
                        initiator.desired,
                    );
                    self.send(ChannelKind::BackupData, &message);
                    tracing::trace!(
                        peer = self.id(),
                        chunk = %key,
                        tries_left = initiator.tries_left,
                        delay_ms = wait.as_millis() as u64,
                        "PUTCHUNK sent, waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
                BackupStep::Reached { perceived } => {
                    tracing::debug!(peer = self.id(), chunk = %key, perceived, "chunk replicated");
                    return;
                }
                BackupStep::Exhausted { perceived } => {
                    tracing::warn!(
                        peer = self.id(),
                        chunk = %key,
                        perceived,
                        desired = initiator.desired,
                        "backup gave up below desired degree"
                    );
                    return;
                }
                BackupStep::Abandon => {
                    tracing::warn!(
                        peer = self.id(),
                        file_id = key.file_id.short(),
                        chunk = %key,
                        "no peer stored chunk, abandoning backup"
                    );
                    self.state_store().abandon_backup_file(&key.file_id);
                    return;
                }
                BackupStep::Cancelled => {
                    tracing::debug!(peer = self.id(), chunk = %key, "backup no longer needed");
                    return;
                }
            }
        }
    }

    // ── Reactions ─────────────────────────────────────────────────────────────

    /// Reserve space and write a chunk. True when the chunk is (now) held.
    fn accept_chunk(&self, key: &ChunkKey, desired: u8, content: &Bytes) -> bool {
        match self.state_store().reserve_chunk(key, desired, content.len() as u64) {
            Reservation::AlreadyStored => true,
            Reservation::NoSpace => {
                tracing::debug!(peer = self.id(), chunk = %key, "not enough space, skipping");
                false
            }
            Reservation::Inserted => match self.store().store_chunk(key, content) {
                Ok(()) => {
                    tracing::debug!(peer = self.id(), chunk = %key, bytes = content.len(), "chunk stored");
                    true
                }
                Err(e) => {
                    tracing::warn!(peer = self.id(), chunk = %key, error = %e, "failed to store chunk");
                    self.state_store().release_chunk(key);
                    false
                }
            },
        }
    }

    /// Common prelude of both PUTCHUNK reactions. False when this peer must
    /// not store the chunk at all.
    fn observe_put_chunk(&self, sender: PeerId, key: &ChunkKey) -> bool {
        self.inner.reclaim_sync.record_put_chunk(key, sender);
        self.state_store().clear_undeleted(&key.file_id);

        if self.state_store().is_backup_file(&key.file_id) {
            tracing::trace!(peer = self.id(), chunk = %key, "own file, not storing");
            return false;
        }
        true
    }

    pub(crate) async fn store_chunk(self, sender: PeerId, key: ChunkKey, desired: u8, content: Bytes) {
        if !self.observe_put_chunk(sender, &key) || !self.accept_chunk(&key, desired, &content) {
            return;
        }
        tokio::time::sleep(self.jitter()).await;
        self.send(ChannelKind::Control, &Message::stored(self.id(), key));
    }

    /// Enhanced PUTCHUNK: wait first, and only store if the confirmations
    /// seen meanwhile leave the chunk under its desired degree.
    pub(crate) async fn store_chunk_checked(
        self,
        sender: PeerId,
        key: ChunkKey,
        desired: u8,
        content: Bytes,
    ) {
        if !self.observe_put_chunk(sender, &key) {
            return;
        }
        let already_stored = self.state_store().is_stored_chunk(&key);

        self.inner.backup_sync.begin(key.clone());
        tokio::time::sleep(self.jitter()).await;
        self.conclude_checked_store(key, desired, &content, already_stored);
    }

    /// Close the confirmation window opened for `key` and store if needed.
    fn conclude_checked_store(&self, key: ChunkKey, desired: u8, content: &Bytes, already_stored: bool) {
        let confirmed = self.inner.backup_sync.end(&key);

        if !already_stored && confirmed.len() >= usize::from(desired) {
            tracing::debug!(
                peer = self.id(),
                chunk = %key,
                confirmed = confirmed.len(),
                "chunk already replicated, skipping"
            );
            return;
        }
        if !self.accept_chunk(&key, desired, content) {
            return;
        }
        for peer in confirmed {
            self.state_store().add_stored_peer(&key, peer);
        }
        self.send(ChannelKind::Control, &Message::stored(self.id(), key));
    }

    pub(crate) fn record_stored(&self, sender: PeerId, key: &ChunkKey) {
        self.state_store().record_backup_peer(key, sender);
        self.state_store().add_stored_peer(key, sender);
        self.inner.backup_sync.record_stored(key, sender);
    }
}
