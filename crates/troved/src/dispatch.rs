//! Routes inbound messages to reactions.
//!
//! The route table is keyed by (channel, message type, negotiated dialect).
//! Anything without a route, including messages on the wrong channel and
//! UNKNOWN types, is dropped.

use std::net::SocketAddr;

use trove_core::wire::{Message, MessageType, Payload};
use trove_core::Dialect;

use crate::channel::ChannelKind;
use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    StoreChunk,
    StoreChunkChecked,
    RecordStored,
    ServeChunk,
    ServeChunkDirect,
    ReceiveChunk,
    ReceiveChunkDirect,
    DeleteFile,
    DeleteFileAck,
    RecordRemoved,
    ResendDeletes,
    RecordDeleted,
}

use ChannelKind::{BackupData, Control, RestoreData};
use Dialect::{Baseline, Enhanced};

const ROUTES: &[(ChannelKind, MessageType, Dialect, Reaction)] = &[
    (BackupData, MessageType::PutChunk, Baseline, Reaction::StoreChunk),
    (BackupData, MessageType::PutChunk, Enhanced, Reaction::StoreChunkChecked),
    (Control, MessageType::Stored, Baseline, Reaction::RecordStored),
    (Control, MessageType::Stored, Enhanced, Reaction::RecordStored),
    (Control, MessageType::GetChunk, Baseline, Reaction::ServeChunk),
    (Control, MessageType::GetChunk, Enhanced, Reaction::ServeChunkDirect),
    (RestoreData, MessageType::Chunk, Baseline, Reaction::ReceiveChunk),
    (RestoreData, MessageType::Chunk, Enhanced, Reaction::ReceiveChunkDirect),
    (Control, MessageType::Delete, Baseline, Reaction::DeleteFile),
    (Control, MessageType::Delete, Enhanced, Reaction::DeleteFileAck),
    (Control, MessageType::Removed, Baseline, Reaction::RecordRemoved),
    (Control, MessageType::Removed, Enhanced, Reaction::RecordRemoved),
    (Control, MessageType::Startup, Enhanced, Reaction::ResendDeletes),
    (Control, MessageType::Deleted, Enhanced, Reaction::RecordDeleted),
];

pub fn route(channel: ChannelKind, message_type: MessageType, dialect: Dialect) -> Option<Reaction> {
    ROUTES
        .iter()
        .find(|(c, t, d, _)| *c == channel && *t == message_type && *d == dialect)
        .map(|&(_, _, _, reaction)| reaction)
}

impl Peer {
    /// Decode one datagram and spawn its reaction. Never blocks.
    pub fn deliver(&self, channel: ChannelKind, datagram: &[u8], source: SocketAddr) {
        let message = match Message::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    channel = channel.name(),
                    source = %source,
                    error = %e,
                    "dropping malformed datagram"
                );
                return;
            }
        };

        if message.sender == self.id() {
            self.on_own_message(channel, &message);
            return;
        }

        tracing::debug!(channel = channel.name(), message = %message, "received");

        let dialect = Dialect::negotiate(self.dialect(), &message.version);
        let Some(reaction) = route(channel, message.message_type(), dialect) else {
            tracing::trace!(channel = channel.name(), message = %message, "no route, dropped");
            return;
        };

        let peer = self.clone();
        self.spawn(async move { peer.react(reaction, message, source).await });
    }

    /// A peer hearing its own PUTCHUNK for a chunk it already holds for
    /// someone else confirms it, so the other holders count it.
    fn on_own_message(&self, channel: ChannelKind, message: &Message) {
        if let (ChannelKind::BackupData, Payload::PutChunk { key, .. }) = (channel, &message.payload) {
            if self.state_store().is_stored_chunk(key) {
                self.send(ChannelKind::Control, &Message::stored(self.id(), key.clone()));
            }
        }
    }

    async fn react(self, reaction: Reaction, message: Message, source: SocketAddr) {
        let sender = message.sender;
        match (reaction, message.payload) {
            (Reaction::StoreChunk, Payload::PutChunk { key, replication, body }) => {
                self.store_chunk(sender, key, replication, body).await
            }
            (Reaction::StoreChunkChecked, Payload::PutChunk { key, replication, body }) => {
                self.store_chunk_checked(sender, key, replication, body).await
            }
            (Reaction::RecordStored, Payload::Stored { key }) => self.record_stored(sender, &key),
            (Reaction::ServeChunk, Payload::GetChunk { key }) => self.serve_chunk(key).await,
            (Reaction::ServeChunkDirect, Payload::GetChunk { key }) => {
                self.serve_chunk_direct(key).await
            }
            (Reaction::ReceiveChunk, Payload::Chunk { key, body }) => {
                self.receive_chunk(sender, key, body)
            }
            (Reaction::ReceiveChunkDirect, Payload::Chunk { key, body }) => {
                self.receive_chunk_direct(sender, key, body, source).await
            }
            (Reaction::DeleteFile, Payload::Delete { file_id }) => {
                self.delete_file(&file_id, false)
            }
            (Reaction::DeleteFileAck, Payload::Delete { file_id }) => {
                self.delete_file(&file_id, true)
            }
            (Reaction::RecordRemoved, Payload::Removed { key }) => {
                self.record_removed(sender, key).await
            }
            (Reaction::ResendDeletes, Payload::Startup) => self.resend_deletes(sender),
            (Reaction::RecordDeleted, Payload::Deleted { file_id }) => {
                self.record_deleted(sender, &file_id)
            }
            (reaction, payload) => {
                tracing::warn!(?reaction, ?payload, "route does not match payload");
            }
        }
    }
}
