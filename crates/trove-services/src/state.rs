//! Replication state store.
//!
//! Three concurrent maps, one entry per file or peer:
//! - backup files:   files this peer asked others to back up
//! - stored chunks:  chunks this peer holds on behalf of others
//! - undeleted:      peers still holding chunks of files this peer deleted
//!
//! Storage counters live behind one mutex. Any operation that touches both
//! the counters and a stored-chunk entry takes the mutex first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use trove_core::{ChunkKey, FileId, PeerId};

use crate::reclaim::{self, ReclaimCandidate};

/// A file this peer requested backup for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub desired: u8,
    pub chunk_count: u32,
    /// Chunk number → peers that confirmed storing it.
    pub chunks: BTreeMap<u32, BTreeSet<PeerId>>,
}

impl FileInfo {
    /// Every peer that confirmed any chunk.
    pub fn holders(&self) -> BTreeSet<PeerId> {
        self.chunks.values().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub size: u64,
    /// Other peers known to store this chunk.
    pub peers: BTreeSet<PeerId>,
}

impl ChunkInfo {
    /// Other holders plus this peer.
    pub fn perceived(&self) -> u32 {
        self.peers.len() as u32 + 1
    }
}

/// Chunks of one file stored on behalf of another peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInfo {
    /// As declared by the PUTCHUNK sender.
    pub desired: u8,
    pub chunks: BTreeMap<u32, ChunkInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub max: u64,
    pub used: u64,
}

impl StorageUsage {
    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.used)
    }
}

/// Outcome of [`PeerState::reserve_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Recorded and space accounted. The caller must write the content.
    Inserted,
    AlreadyStored,
    NoSpace,
}

/// Serialized form of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub max_storage: u64,
    pub used_storage: u64,
    pub backup_files: BTreeMap<FileId, FileInfo>,
    pub stored_chunks: BTreeMap<FileId, StoredInfo>,
    pub undeleted_files: BTreeMap<PeerId, BTreeSet<FileId>>,
}

pub struct PeerState {
    backup_files: DashMap<FileId, FileInfo>,
    stored_chunks: DashMap<FileId, StoredInfo>,
    undeleted_files: DashMap<PeerId, BTreeSet<FileId>>,
    usage: Mutex<StorageUsage>,
    dirty: AtomicBool,
}

impl PeerState {
    pub fn new(max_storage: u64) -> Self {
        Self {
            backup_files: DashMap::new(),
            stored_chunks: DashMap::new(),
            undeleted_files: DashMap::new(),
            usage: Mutex::new(StorageUsage {
                max: max_storage,
                used: 0,
            }),
            dirty: AtomicBool::new(true),
        }
    }

    pub fn from_persisted(saved: PersistedState) -> Self {
        // Recompute usage from the entries rather than trusting the counter.
        let used = saved
            .stored_chunks
            .values()
            .flat_map(|s| s.chunks.values())
            .map(|c| c.size)
            .sum();
        Self {
            backup_files: saved.backup_files.into_iter().collect(),
            stored_chunks: saved.stored_chunks.into_iter().collect(),
            undeleted_files: saved.undeleted_files.into_iter().collect(),
            usage: Mutex::new(StorageUsage {
                max: saved.max_storage,
                used,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> PersistedState {
        let usage = *self.lock_usage();
        PersistedState {
            max_storage: usage.max,
            used_storage: usage.used,
            backup_files: self
                .backup_files
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            stored_chunks: self
                .stored_chunks
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            undeleted_files: self
                .undeleted_files
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        }
    }

    fn lock_usage(&self) -> MutexGuard<'_, StorageUsage> {
        // Counters stay consistent even if a holder panicked.
        self.usage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.touch();
    }

    pub fn usage(&self) -> StorageUsage {
        *self.lock_usage()
    }

    // ── Backup files (owner side) ─────────────────────────────────────────────

    /// Register a new backup request. Returns false if the file ID is already
    /// backed up. A successful insert clears any undeleted bookkeeping for it.
    pub fn insert_backup_file(&self, file_id: &FileId, path: &Path, desired: u8, chunk_count: u32) -> bool {
        use dashmap::mapref::entry::Entry;

        let inserted = match self.backup_files.entry(file_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(FileInfo {
                    path: path.to_path_buf(),
                    desired,
                    chunk_count,
                    chunks: BTreeMap::new(),
                });
                true
            }
        };
        if inserted {
            self.clear_undeleted(file_id);
            self.touch();
        }
        inserted
    }

    pub fn is_backup_file(&self, file_id: &FileId) -> bool {
        self.backup_files.contains_key(file_id)
    }

    pub fn backup_file(&self, file_id: &FileId) -> Option<FileInfo> {
        self.backup_files.get(file_id).map(|e| e.value().clone())
    }

    /// Backed-up file IDs registered for `path`, if any.
    pub fn backup_files_for_path(&self, path: &Path) -> Vec<FileId> {
        self.backup_files
            .iter()
            .filter(|e| e.value().path == path)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Record that `peer` confirmed storing a chunk of a file this peer owns.
    pub fn record_backup_peer(&self, key: &ChunkKey, peer: PeerId) -> bool {
        let Some(mut info) = self.backup_files.get_mut(&key.file_id) else {
            return false;
        };
        let added = info.chunks.entry(key.number).or_default().insert(peer);
        drop(info);
        if added {
            self.touch();
        }
        added
    }

    pub fn remove_backup_peer(&self, key: &ChunkKey, peer: PeerId) -> bool {
        let Some(mut info) = self.backup_files.get_mut(&key.file_id) else {
            return false;
        };
        let removed = info
            .chunks
            .get_mut(&key.number)
            .map(|peers| peers.remove(&peer))
            .unwrap_or(false);
        drop(info);
        if removed {
            self.touch();
        }
        removed
    }

    /// Confirmed peers for an owned chunk. `None` when the file is not (or no
    /// longer) backed up by this peer.
    pub fn backup_degree(&self, key: &ChunkKey) -> Option<u32> {
        self.backup_files.get(&key.file_id).map(|info| {
            info.chunks
                .get(&key.number)
                .map(|peers| peers.len() as u32)
                .unwrap_or(0)
        })
    }

    /// Drop a backup request without recording undeleted peers.
    pub fn abandon_backup_file(&self, file_id: &FileId) -> Option<FileInfo> {
        let removed = self.backup_files.remove(file_id).map(|(_, info)| info);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Remove a backed-up file. With `track_undeleted`, every peer that
    /// confirmed any chunk is recorded as still holding the file.
    pub fn delete_backup_file(&self, file_id: &FileId, track_undeleted: bool) -> Option<FileInfo> {
        let (_, info) = self.backup_files.remove(file_id)?;
        if track_undeleted {
            for peer in info.holders() {
                self.undeleted_files.entry(peer).or_default().insert(file_id.clone());
            }
        }
        self.touch();
        Some(info)
    }

    // ── Stored chunks (holder side) ───────────────────────────────────────────

    /// Atomically check space and record a chunk about to be stored.
    pub fn reserve_chunk(&self, key: &ChunkKey, desired: u8, size: u64) -> Reservation {
        let mut usage = self.lock_usage();

        let mut stored = self.stored_chunks.entry(key.file_id.clone()).or_insert_with(|| StoredInfo {
            desired,
            chunks: BTreeMap::new(),
        });
        if stored.chunks.contains_key(&key.number) {
            return Reservation::AlreadyStored;
        }
        if usage.available() < size {
            let empty = stored.chunks.is_empty();
            drop(stored);
            if empty {
                self.stored_chunks.remove_if(&key.file_id, |_, s| s.chunks.is_empty());
            }
            return Reservation::NoSpace;
        }

        stored.chunks.insert(
            key.number,
            ChunkInfo {
                size,
                peers: BTreeSet::new(),
            },
        );
        usage.used += size;
        drop(stored);
        self.touch();
        Reservation::Inserted
    }

    /// Forget one stored chunk and release its bytes. Returns the freed size.
    pub fn release_chunk(&self, key: &ChunkKey) -> Option<u64> {
        let mut usage = self.lock_usage();
        self.release_chunk_locked(&mut usage, key)
    }

    fn release_chunk_locked(&self, usage: &mut StorageUsage, key: &ChunkKey) -> Option<u64> {
        let mut stored = self.stored_chunks.get_mut(&key.file_id)?;
        let chunk = stored.chunks.remove(&key.number)?;
        let empty = stored.chunks.is_empty();
        drop(stored);
        if empty {
            self.stored_chunks.remove_if(&key.file_id, |_, s| s.chunks.is_empty());
        }
        usage.used = usage.used.saturating_sub(chunk.size);
        self.touch();
        Some(chunk.size)
    }

    pub fn is_stored_chunk(&self, key: &ChunkKey) -> bool {
        self.stored_chunks
            .get(&key.file_id)
            .map(|s| s.chunks.contains_key(&key.number))
            .unwrap_or(false)
    }

    pub fn is_stored_file(&self, file_id: &FileId) -> bool {
        self.stored_chunks.contains_key(file_id)
    }

    /// Record another holder of a chunk this peer stores.
    pub fn add_stored_peer(&self, key: &ChunkKey, peer: PeerId) -> bool {
        let added = self
            .stored_chunks
            .get_mut(&key.file_id)
            .and_then(|mut s| s.chunks.get_mut(&key.number).map(|c| c.peers.insert(peer)))
            .unwrap_or(false);
        if added {
            self.touch();
        }
        added
    }

    pub fn remove_stored_peer(&self, key: &ChunkKey, peer: PeerId) -> bool {
        let removed = self
            .stored_chunks
            .get_mut(&key.file_id)
            .and_then(|mut s| s.chunks.get_mut(&key.number).map(|c| c.peers.remove(&peer)))
            .unwrap_or(false);
        if removed {
            self.touch();
        }
        removed
    }

    /// Perceived degree of a stored chunk, counting this peer.
    pub fn stored_degree(&self, key: &ChunkKey) -> Option<u32> {
        self.stored_chunks
            .get(&key.file_id)
            .and_then(|s| s.chunks.get(&key.number).map(ChunkInfo::perceived))
    }

    pub fn stored_desired(&self, file_id: &FileId) -> Option<u8> {
        self.stored_chunks.get(file_id).map(|s| s.desired)
    }

    /// Drop every stored chunk of a file. Returns the chunk numbers removed.
    pub fn delete_stored_file(&self, file_id: &FileId) -> Vec<u32> {
        let mut usage = self.lock_usage();
        let Some((_, stored)) = self.stored_chunks.remove(file_id) else {
            return Vec::new();
        };
        let freed: u64 = stored.chunks.values().map(|c| c.size).sum();
        usage.used = usage.used.saturating_sub(freed);
        drop(usage);
        self.touch();
        stored.chunks.into_keys().collect()
    }

    // ── Undeleted files (enhanced) ───────────────────────────────────────────

    pub fn clear_undeleted(&self, file_id: &FileId) {
        let mut changed = false;
        for mut files in self.undeleted_files.iter_mut() {
            changed |= files.remove(file_id);
        }
        self.undeleted_files.retain(|_, files| !files.is_empty());
        if changed {
            self.touch();
        }
    }

    /// `peer` acknowledged deleting `file_id`.
    pub fn peer_deleted_file(&self, peer: PeerId, file_id: &FileId) -> bool {
        let removed = self
            .undeleted_files
            .get_mut(&peer)
            .map(|mut files| files.remove(file_id))
            .unwrap_or(false);
        self.undeleted_files.remove_if(&peer, |_, files| files.is_empty());
        if removed {
            self.touch();
        }
        removed
    }

    pub fn undeleted_files_of(&self, peer: PeerId) -> Vec<FileId> {
        self.undeleted_files
            .get(&peer)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True while any peer is still listed as holding `file_id`.
    pub fn is_undeleted(&self, file_id: &FileId) -> bool {
        self.undeleted_files.iter().any(|e| e.value().contains(file_id))
    }

    /// Every file some peer has yet to delete.
    pub fn all_undeleted(&self) -> BTreeSet<FileId> {
        self.undeleted_files
            .iter()
            .flat_map(|e| e.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    // ── Reclaim ───────────────────────────────────────────────────────────────

    /// Set a new storage cap and forget the chunks that must go to respect it.
    /// The caller announces and deletes the returned chunks.
    pub fn reclaim(&self, new_max: u64) -> Vec<ChunkKey> {
        let mut usage = self.lock_usage();
        usage.max = new_max;
        self.touch();

        let excess = usage.used.saturating_sub(new_max);
        if excess == 0 {
            return Vec::new();
        }

        let candidates: Vec<ReclaimCandidate> = self
            .stored_chunks
            .iter()
            .flat_map(|entry| {
                let file_id = entry.key().clone();
                let desired = entry.value().desired;
                entry
                    .value()
                    .chunks
                    .iter()
                    .map(|(number, chunk)| {
                        ReclaimCandidate::new(
                            ChunkKey::new(file_id.clone(), *number),
                            desired,
                            chunk.perceived(),
                            chunk.size,
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        reclaim::select_evictions(candidates, excess)
            .into_iter()
            .filter_map(|c| {
                self.release_chunk_locked(&mut usage, &c.key)?;
                Some(c.key)
            })
            .collect()
    }
}

// ── State dump ────────────────────────────────────────────────────────────────

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();

        writeln!(
            f,
            "Storage: {} / {} bytes",
            snapshot.used_storage, snapshot.max_storage
        )?;

        writeln!(f, "\nBacked up files:")?;
        for (id, info) in &snapshot.backup_files {
            writeln!(f, "  {} ({})", info.path.display(), id)?;
            writeln!(
                f,
                "    desired degree {}, {} chunks",
                info.desired, info.chunk_count
            )?;
            for number in 0..info.chunk_count {
                let peers = info.chunks.get(&number).cloned().unwrap_or_default();
                writeln!(
                    f,
                    "    chunk {:>6}  perceived {}  peers {:?}",
                    number,
                    peers.len(),
                    peers
                )?;
            }
        }

        writeln!(f, "\nStored chunks:")?;
        for (id, stored) in &snapshot.stored_chunks {
            writeln!(f, "  {} (desired degree {})", id, stored.desired)?;
            for (number, chunk) in &stored.chunks {
                writeln!(
                    f,
                    "    chunk {:>6}  {:>6} bytes  perceived {}  peers {:?}",
                    number,
                    chunk.size,
                    chunk.perceived(),
                    chunk.peers
                )?;
            }
        }

        if !snapshot.undeleted_files.is_empty() {
            writeln!(f, "\nFiles not yet deleted:")?;
            for (peer, files) in &snapshot.undeleted_files {
                writeln!(f, "  peer {peer}")?;
                for id in files {
                    writeln!(f, "    {id}")?;
                }
            }
        }
        Ok(())
    }
}
