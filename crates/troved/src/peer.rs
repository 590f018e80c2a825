//! The peer: shared handles for every reaction and initiator task, plus
//! the control facade.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use trove_core::chunk::{ChunkedFile, FileFingerprint};
use trove_core::config::ProtocolConfig;
use trove_core::wire::Message;
use trove_core::{Dialect, FileId, PeerId};
use trove_services::control::REPLICATION_RANGE;
use trove_services::state::FileInfo;
use trove_services::{
    BackupSync, ChunkStore, Control, ControlError, PeerState, ReclaimSync, RestoreSync,
};

use crate::channel::{ChannelKind, Channels};
use crate::protocol::backup::{BackupInitiator, BackupOrigin};
use crate::protocol::delete::DeleteInitiator;

/// Identity and timing of a peer.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub id: PeerId,
    pub dialect: Dialect,
    pub protocol: ProtocolConfig,
}

pub(crate) struct Inner {
    pub(crate) options: PeerOptions,
    pub(crate) channels: Channels,
    pub(crate) state: Arc<PeerState>,
    pub(crate) store: Arc<dyn ChunkStore>,
    pub(crate) backup_sync: BackupSync,
    pub(crate) restore_sync: RestoreSync,
    pub(crate) reclaim_sync: ReclaimSync,
    runtime: tokio::runtime::Handle,
}

/// Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<Inner>,
}

impl Peer {
    /// Must be called from within a tokio runtime; background tasks are
    /// spawned on it, including from control calls made on blocking threads.
    pub fn new(
        options: PeerOptions,
        channels: Channels,
        state: PeerState,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                channels,
                state: Arc::new(state),
                store,
                backup_sync: BackupSync::default(),
                restore_sync: RestoreSync::default(),
                reclaim_sync: ReclaimSync::default(),
                runtime: tokio::runtime::Handle::current(),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.options.id
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.options.dialect
    }

    pub fn state_store(&self) -> &PeerState {
        &self.inner.state
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.inner.store
    }

    pub(crate) fn protocol(&self) -> &ProtocolConfig {
        &self.inner.options.protocol
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.runtime.spawn(task);
    }

    /// Uniform random delay in `[0, response_jitter)`.
    pub(crate) fn jitter(&self) -> Duration {
        let max = self.protocol().response_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }

    /// Broadcast on one channel. Send failures are logged and the message
    /// dropped; callers carry on.
    pub(crate) fn send(&self, kind: ChannelKind, message: &Message) -> bool {
        match self.inner.channels.get(kind).broadcast(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(peer = self.id(), error = %e, "send failed");
                false
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Announce a restart. Enhanced peers broadcast STARTUP and re-send
    /// DELETE for every file some peer has yet to delete.
    pub fn announce_startup(&self) {
        if !self.dialect().is_enhanced() {
            return;
        }
        self.send(ChannelKind::Control, &Message::startup(self.id()));

        let pending = self.state_store().all_undeleted();
        for file_id in pending {
            tracing::info!(peer = self.id(), file_id = file_id.short(), "re-sending DELETE");
            self.send(
                ChannelKind::Control,
                &Message::delete(self.dialect(), self.id(), file_id),
            );
        }
    }

    /// Save the state if it changed since the last save.
    pub fn persist_if_dirty(&self) {
        if !self.state_store().take_dirty() {
            return;
        }
        let snapshot = self.state_store().snapshot();
        match self.store().persist_state(&snapshot) {
            Ok(()) => tracing::trace!(peer = self.id(), "state saved"),
            Err(e) => {
                tracing::warn!(peer = self.id(), error = %e, "failed to save state");
                self.state_store().mark_dirty();
            }
        }
    }

    /// Save the state every `persist_interval` when dirty. Runs forever.
    pub async fn persist_loop(self) {
        let mut interval = tokio::time::interval(self.protocol().persist_interval());
        loop {
            interval.tick().await;
            self.persist_if_dirty();
        }
    }

    /// Find the backup entry for a path: by the current file ID when the
    /// file is unchanged, else by the path it was backed up from.
    fn resolve_backup(&self, path: &Path) -> Result<(FileId, FileInfo), ControlError> {
        if let Ok(fingerprint) = FileFingerprint::read(path) {
            let file_id = FileId::derive(&fingerprint);
            if let Some(info) = self.state_store().backup_file(&file_id) {
                return Ok((file_id, info));
            }
        }

        let full_path = std::fs::canonicalize(path)
            .or_else(|_| std::path::absolute(path))
            .map_err(|e| ControlError::Io(e.to_string()))?;
        self.state_store()
            .backup_files_for_path(&full_path)
            .into_iter()
            .find_map(|id| self.state_store().backup_file(&id).map(|info| (id, info)))
            .ok_or_else(|| ControlError::NotBackedUp(path.to_path_buf()))
    }
}

// ── Control facade ────────────────────────────────────────────────────────────

impl Control for Peer {
    fn backup(&self, path: &Path, replication: u8) -> Result<FileId, ControlError> {
        if !REPLICATION_RANGE.contains(&replication) {
            return Err(ControlError::InvalidReplicationDegree(replication));
        }

        let file = ChunkedFile::read(path)?;
        let chunk_count = file.chunks.len() as u32;

        if !self.state_store().insert_backup_file(
            &file.file_id,
            &file.fingerprint.path,
            replication,
            chunk_count,
        ) {
            return Err(ControlError::AlreadyBackedUp(file.fingerprint.path));
        }

        tracing::info!(
            peer = self.id(),
            file_id = file.file_id.short(),
            path = %file.fingerprint.path.display(),
            chunks = chunk_count,
            replication,
            "backup started"
        );

        let protocol = self.protocol();
        for chunk in file.chunks {
            self.start_backup(BackupInitiator::new(
                chunk,
                replication,
                protocol.backup_tries,
                protocol.backup_initial_delay(),
                BackupOrigin::Owner,
            ));
        }
        Ok(file.file_id)
    }

    fn restore(&self, path: &Path) -> Result<FileId, ControlError> {
        let (file_id, info) = self.resolve_backup(path)?;
        let name = info
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());

        self.start_restore(&file_id, name, info.chunk_count)?;
        Ok(file_id)
    }

    fn delete(&self, path: &Path) -> Result<FileId, ControlError> {
        let (file_id, _) = self.resolve_backup(path)?;

        let enhanced = self.dialect().is_enhanced();
        self.state_store().delete_backup_file(&file_id, enhanced);
        self.inner.restore_sync.cancel_session(&file_id);

        tracing::info!(peer = self.id(), file_id = file_id.short(), "delete started");

        let protocol = self.protocol();
        self.start_delete(DeleteInitiator::new(
            file_id.clone(),
            protocol.delete_tries,
            protocol.delete_interval(),
            enhanced,
        ));
        Ok(file_id)
    }

    fn reclaim(&self, max_bytes: u64) -> Result<usize, ControlError> {
        Ok(self.reclaim_space(max_bytes))
    }

    fn state(&self) -> String {
        format!(
            "Peer {} (dialect {})\n\n{}",
            self.id(),
            self.dialect(),
            self.inner.state
        )
    }
}
