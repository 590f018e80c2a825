//! Synchronizers: per-protocol listening state built on [`ListeningWindow`],
//! plus the restore sessions that collect chunks until a file is complete.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use trove_core::{Chunk, ChunkKey, FileId, PeerId, MAX_CHUNK_SIZE};

use crate::window::ListeningWindow;

/// Restore sessions older than this are dropped when a new one starts.
pub const RESTORE_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

// ── Backup ────────────────────────────────────────────────────────────────────

/// Counts STORED replies for a chunk while an enhanced PUTCHUNK reaction waits.
#[derive(Default)]
pub struct BackupSync {
    stored: ListeningWindow<ChunkKey>,
}

impl BackupSync {
    pub fn begin(&self, key: ChunkKey) {
        self.stored.begin(key);
    }

    pub fn record_stored(&self, key: &ChunkKey, peer: PeerId) {
        self.stored.observe(key, peer);
    }

    pub fn confirmations(&self, key: &ChunkKey) -> usize {
        self.stored.observed(key)
    }

    /// Close the window, returning the peers that confirmed meanwhile.
    pub fn end(&self, key: &ChunkKey) -> HashSet<PeerId> {
        self.stored.end(key)
    }
}

// ── Reclaim ───────────────────────────────────────────────────────────────────

/// Watches for a PUTCHUNK that makes a pending re-backup redundant.
#[derive(Default)]
pub struct ReclaimSync {
    put_chunks: ListeningWindow<ChunkKey>,
}

impl ReclaimSync {
    pub fn begin(&self, key: ChunkKey) {
        self.put_chunks.begin(key);
    }

    pub fn record_put_chunk(&self, key: &ChunkKey, peer: PeerId) {
        self.put_chunks.observe(key, peer);
    }

    /// True if no PUTCHUNK was seen since `begin`.
    pub fn still_needed(&self, key: &ChunkKey) -> bool {
        self.put_chunks.still_pending(key)
    }

    pub fn end(&self, key: &ChunkKey) {
        self.put_chunks.end(key);
    }
}

// ── Restore ───────────────────────────────────────────────────────────────────

struct RestoreSession {
    name: String,
    started_at: Instant,
    chunks: BTreeMap<u32, Bytes>,
}

impl RestoreSession {
    /// Chunks 0..=n all present and chunk n shorter than the maximum.
    fn is_complete(&self) -> bool {
        let Some((&last, content)) = self.chunks.last_key_value() else {
            return false;
        };
        content.len() < MAX_CHUNK_SIZE && self.chunks.len() as u64 == u64::from(last) + 1
    }
}

/// A restore that received every chunk, in chunk-number order.
#[derive(Debug)]
pub struct CompletedRestore {
    pub file_id: FileId,
    pub name: String,
    pub chunks: Vec<Chunk>,
}

/// Answer suppression for GETCHUNK responders, and the sessions of files
/// this peer is restoring.
#[derive(Default)]
pub struct RestoreSync {
    responses: ListeningWindow<ChunkKey>,
    sessions: DashMap<FileId, RestoreSession>,
}

impl RestoreSync {
    // Responder side.

    pub fn begin_response(&self, key: ChunkKey) {
        self.responses.begin(key);
    }

    pub fn record_chunk_message(&self, key: &ChunkKey, peer: PeerId) {
        self.responses.observe(key, peer);
    }

    /// True if another peer already answered during the wait.
    pub fn answered(&self, key: &ChunkKey) -> bool {
        self.responses.observed(key) > 0
    }

    pub fn end_response(&self, key: &ChunkKey) {
        self.responses.end(key);
    }

    // Restoring side.

    /// Start collecting chunks for `file_id`. A session already in progress
    /// keeps what it has. Returns false in that case.
    pub fn begin_session(&self, file_id: FileId, name: String) -> bool {
        self.sessions
            .retain(|_, s| s.started_at.elapsed() < RESTORE_SESSION_TTL);

        let mut fresh = false;
        self.sessions.entry(file_id).or_insert_with(|| {
            fresh = true;
            RestoreSession {
                name,
                started_at: Instant::now(),
                chunks: BTreeMap::new(),
            }
        });
        fresh
    }

    pub fn is_restoring(&self, file_id: &FileId) -> bool {
        self.sessions.contains_key(file_id)
    }

    pub fn received(&self, file_id: &FileId) -> usize {
        self.sessions.get(file_id).map(|s| s.chunks.len()).unwrap_or(0)
    }

    /// Add a chunk to its session. Yields the whole file once complete; only
    /// one caller ever receives a given completed session.
    pub fn add_chunk(&self, chunk: Chunk) -> Option<CompletedRestore> {
        let file_id = chunk.key.file_id.clone();
        let complete = {
            let mut session = self.sessions.get_mut(&file_id)?;
            session.chunks.insert(chunk.key.number, chunk.content);
            session.is_complete()
        };
        if !complete {
            return None;
        }

        let (file_id, session) = self.sessions.remove(&file_id)?;
        let chunks = session
            .chunks
            .into_iter()
            .map(|(number, content)| Chunk::new(ChunkKey::new(file_id.clone(), number), content))
            .collect();
        Some(CompletedRestore {
            file_id,
            name: session.name,
            chunks,
        })
    }

    pub fn cancel_session(&self, file_id: &FileId) {
        self.sessions.remove(file_id);
    }
}
