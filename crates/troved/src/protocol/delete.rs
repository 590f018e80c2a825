//! File deletion: DELETE a fixed number of times at a fixed interval.
//!
//! Enhanced peers stop early once every holder answered DELETED, and
//! re-send DELETE to holders that announce STARTUP.

use std::time::Duration;

use trove_core::wire::Message;
use trove_core::{FileId, PeerId};

use crate::channel::ChannelKind;
use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    Send { wait: Duration },
    Done,
}

#[derive(Debug, Clone)]
pub struct DeleteInitiator {
    pub file_id: FileId,
    pub tries_left: u32,
    pub interval: Duration,
    /// Stop once no peer is listed as still holding the file.
    pub stop_when_acknowledged: bool,
    sent: bool,
}

impl DeleteInitiator {
    pub fn new(file_id: FileId, tries: u32, interval: Duration, stop_when_acknowledged: bool) -> Self {
        Self {
            file_id,
            tries_left: tries,
            interval,
            stop_when_acknowledged,
            sent: false,
        }
    }

    /// The first DELETE always goes out; later ones are skipped once
    /// acknowledged, when that applies.
    pub fn step(&mut self, still_undeleted: bool) -> DeleteStep {
        if self.sent && self.stop_when_acknowledged && !still_undeleted {
            return DeleteStep::Done;
        }
        if self.tries_left == 0 {
            return DeleteStep::Done;
        }
        self.tries_left -= 1;
        self.sent = true;
        DeleteStep::Send {
            wait: self.interval,
        }
    }
}

impl Peer {
    pub(crate) fn start_delete(&self, initiator: DeleteInitiator) {
        let peer = self.clone();
        self.spawn(async move { peer.run_delete(initiator).await });
    }

    async fn run_delete(self, mut initiator: DeleteInitiator) {
        loop {
            let still_undeleted = self.state_store().is_undeleted(&initiator.file_id);
            match initiator.step(still_undeleted) {
                DeleteStep::Send { wait } => {
                    let message = Message::delete(self.dialect(), self.id(), initiator.file_id.clone());
                    self.send(ChannelKind::Control, &message);
                    tokio::time::sleep(wait).await;
                }
                DeleteStep::Done => {
                    tracing::debug!(
                        peer = self.id(),
                        file_id = initiator.file_id.short(),
                        acknowledged = !still_undeleted,
                        "delete finished"
                    );
                    return;
                }
            }
        }
    }

    // ── Reactions ─────────────────────────────────────────────────────────────

    /// Drop every chunk of a file. With `acknowledge`, answer DELETED even
    /// when nothing was stored.
    pub(crate) fn delete_file(&self, file_id: &FileId, acknowledge: bool) {
        let removed = self.state_store().delete_stored_file(file_id);
        if let Err(e) = self.store().delete_all_chunks(file_id) {
            tracing::warn!(peer = self.id(), file_id = file_id.short(), error = %e, "failed to delete chunks");
        }
        if !removed.is_empty() {
            tracing::info!(
                peer = self.id(),
                file_id = file_id.short(),
                chunks = removed.len(),
                "file deleted"
            );
        }
        self.inner.restore_sync.cancel_session(file_id);

        if acknowledge {
            self.send(ChannelKind::Control, &Message::deleted(self.id(), file_id.clone()));
        }
    }

    /// A peer came back: re-send DELETE for the files it still holds.
    pub(crate) fn resend_deletes(&self, sender: PeerId) {
        for file_id in self.state_store().undeleted_files_of(sender) {
            tracing::debug!(peer = self.id(), to = sender, file_id = file_id.short(), "re-sending DELETE");
            self.send(
                ChannelKind::Control,
                &Message::delete(self.dialect(), self.id(), file_id),
            );
        }
    }

    pub(crate) fn record_deleted(&self, sender: PeerId, file_id: &FileId) {
        if self.state_store().peer_deleted_file(sender, file_id) {
            tracing::debug!(peer = self.id(), from = sender, file_id = file_id.short(), "delete acknowledged");
        }
    }
}
