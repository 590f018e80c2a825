//! Eviction ordering for space reclaim.
//!
//! Each locally stored chunk is scored with
//! `diff = declared desired degree − perceived degree` and chunks are
//! evicted by descending diff, larger chunks first on ties, until enough
//! bytes have been freed. The score is per chunk, not per file.

use trove_core::ChunkKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimCandidate {
    pub key: ChunkKey,
    pub diff: i64,
    pub size: u64,
}

impl ReclaimCandidate {
    pub fn new(key: ChunkKey, desired: u8, perceived: u32, size: u64) -> Self {
        Self {
            key,
            diff: i64::from(desired) - i64::from(perceived),
            size,
        }
    }
}

/// Sort candidates into eviction order. Chunk key breaks the remaining ties
/// so the order is deterministic.
pub fn eviction_order(candidates: &mut [ReclaimCandidate]) {
    candidates.sort_by(|a, b| {
        b.diff
            .cmp(&a.diff)
            .then(b.size.cmp(&a.size))
            .then_with(|| a.key.cmp(&b.key))
    });
}

/// Pick chunks to evict until at least `excess` bytes are freed.
pub fn select_evictions(mut candidates: Vec<ReclaimCandidate>, excess: u64) -> Vec<ReclaimCandidate> {
    eviction_order(&mut candidates);

    let mut freed = 0u64;
    candidates
        .into_iter()
        .take_while(|c| {
            if freed >= excess {
                return false;
            }
            freed += c.size;
            true
        })
        .collect()
}
