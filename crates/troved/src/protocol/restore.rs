//! Chunk restore: GETCHUNK once per chunk, collect CHUNK answers.
//!
//! Baseline answers carry the content on the restore channel. Enhanced
//! answers carry a TCP port instead; the restorer connects to the answering
//! peer and reads the content directly.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use trove_core::wire::{decode_port, Message};
use trove_core::{Chunk, ChunkKey, FileId, PeerId, MAX_CHUNK_SIZE};
use trove_services::ControlError;

use crate::channel::ChannelKind;
use crate::peer::Peer;

impl Peer {
    /// Open a restore session and ask for every chunk once.
    pub(crate) fn start_restore(
        &self,
        file_id: &FileId,
        name: String,
        chunk_count: u32,
    ) -> Result<(), ControlError> {
        let fresh = self.inner.restore_sync.begin_session(file_id.clone(), name);
        tracing::info!(
            peer = self.id(),
            file_id = file_id.short(),
            chunks = chunk_count,
            resumed = !fresh,
            "restore started"
        );

        let control = self.inner.channels.get(ChannelKind::Control);
        for number in 0..chunk_count {
            let key = ChunkKey::new(file_id.clone(), number);
            let message = Message::get_chunk(self.dialect(), self.id(), key);
            if let Err(e) = control.broadcast(&message) {
                self.inner.restore_sync.cancel_session(file_id);
                return Err(ControlError::Transport(format!("{e:#}")));
            }
        }
        Ok(())
    }

    /// Load a chunk this peer stores, once it is clear nobody else answered.
    async fn chunk_to_serve(&self, key: &ChunkKey) -> Option<Bytes> {
        if !self.state_store().is_stored_chunk(key) {
            return None;
        }
        self.inner.restore_sync.begin_response(key.clone());
        tokio::time::sleep(self.jitter()).await;

        if self.inner.restore_sync.answered(key) {
            tracing::trace!(peer = self.id(), chunk = %key, "already answered by another peer");
            self.inner.restore_sync.end_response(key);
            return None;
        }

        match self.store().load_chunk(key) {
            Ok(Some(content)) => Some(content),
            Ok(None) => {
                tracing::warn!(peer = self.id(), chunk = %key, "stored chunk missing on disk");
                self.inner.restore_sync.end_response(key);
                None
            }
            Err(e) => {
                tracing::warn!(peer = self.id(), chunk = %key, error = %e, "failed to load chunk");
                self.inner.restore_sync.end_response(key);
                None
            }
        }
    }

    pub(crate) async fn serve_chunk(self, key: ChunkKey) {
        let Some(content) = self.chunk_to_serve(&key).await else {
            return;
        };
        let chunk = Chunk::new(key.clone(), content);
        self.send(ChannelKind::RestoreData, &Message::chunk(self.id(), &chunk));
        self.inner.restore_sync.end_response(&key);
    }

    /// Advertise a one-shot TCP endpoint and stream the chunk to whoever
    /// connects first within the transfer timeout.
    pub(crate) async fn serve_chunk_direct(self, key: ChunkKey) {
        let Some(content) = self.chunk_to_serve(&key).await else {
            return;
        };

        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(peer = self.id(), chunk = %key, error = %e, "failed to open transfer port");
                self.inner.restore_sync.end_response(&key);
                return;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                tracing::warn!(peer = self.id(), chunk = %key, error = %e, "transfer port unknown");
                self.inner.restore_sync.end_response(&key);
                return;
            }
        };

        let sent = self.send(
            ChannelKind::RestoreData,
            &Message::chunk_port(self.id(), key.clone(), port),
        );
        self.inner.restore_sync.end_response(&key);
        if !sent {
            return;
        }

        match tokio::time::timeout(self.protocol().transfer_timeout(), listener.accept()).await {
            Ok(Ok((mut stream, remote))) => {
                let result = async {
                    stream.write_all(&content).await?;
                    stream.shutdown().await
                }
                .await;
                match result {
                    Ok(()) => tracing::debug!(
                        peer = self.id(),
                        chunk = %key,
                        remote = %remote,
                        bytes = content.len(),
                        "chunk sent directly"
                    ),
                    Err(e) => tracing::warn!(peer = self.id(), chunk = %key, error = %e, "direct transfer failed"),
                }
            }
            Ok(Err(e)) => tracing::warn!(peer = self.id(), chunk = %key, error = %e, "accept failed"),
            Err(_) => tracing::debug!(peer = self.id(), chunk = %key, "nobody connected for chunk"),
        }
    }

    /// Baseline CHUNK. Marks the key answered; keeps the content only when
    /// this peer is restoring the file.
    pub(crate) fn receive_chunk(&self, sender: PeerId, key: ChunkKey, content: Bytes) {
        self.inner.restore_sync.record_chunk_message(&key, sender);
        if !self.inner.restore_sync.is_restoring(&key.file_id) {
            return;
        }
        self.collect_chunk(Chunk::new(key, content));
    }

    /// Enhanced CHUNK: the body is the port to pull the content from.
    pub(crate) async fn receive_chunk_direct(
        self,
        sender: PeerId,
        key: ChunkKey,
        body: Bytes,
        source: SocketAddr,
    ) {
        self.inner.restore_sync.record_chunk_message(&key, sender);
        if !self.inner.restore_sync.is_restoring(&key.file_id) {
            return;
        }

        let port = match decode_port(&body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(peer = self.id(), chunk = %key, error = %e, "bad transfer port");
                return;
            }
        };
        let remote = SocketAddr::new(source.ip(), port);

        match tokio::time::timeout(self.protocol().transfer_timeout(), fetch_chunk(remote)).await {
            Ok(Ok(content)) => self.collect_chunk(Chunk::new(key, content)),
            Ok(Err(e)) => {
                tracing::warn!(peer = self.id(), chunk = %key, remote = %remote, error = %e, "direct fetch failed")
            }
            Err(_) => {
                tracing::warn!(peer = self.id(), chunk = %key, remote = %remote, "direct fetch timed out")
            }
        }
    }

    fn collect_chunk(&self, chunk: Chunk) {
        tracing::trace!(peer = self.id(), chunk = %chunk.key, bytes = chunk.len(), "chunk received");
        let Some(done) = self.inner.restore_sync.add_chunk(chunk) else {
            return;
        };
        match self.store().restore_file(&done.name, &done.chunks) {
            Ok(path) => tracing::info!(
                peer = self.id(),
                file_id = done.file_id.short(),
                path = %path.display(),
                chunks = done.chunks.len(),
                "file restored"
            ),
            Err(e) => tracing::warn!(
                peer = self.id(),
                file_id = done.file_id.short(),
                error = %e,
                "failed to write restored file"
            ),
        }
    }
}

/// Read one chunk from a direct-transfer endpoint.
async fn fetch_chunk(remote: SocketAddr) -> io::Result<Bytes> {
    let stream = TcpStream::connect(remote).await?;
    let mut content = Vec::with_capacity(MAX_CHUNK_SIZE);
    stream
        .take(MAX_CHUNK_SIZE as u64 + 1)
        .read_to_end(&mut content)
        .await?;
    if content.len() > MAX_CHUNK_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("chunk larger than {MAX_CHUNK_SIZE} bytes"),
        ));
    }
    Ok(Bytes::from(content))
}
