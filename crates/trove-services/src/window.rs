//! Listening windows.
//!
//! A task opens a window on a key, sleeps, then checks what was observed on
//! that key meanwhile before closing it. Backup counts STORED replies,
//! restore watches for competing CHUNK answers and reclaim watches for a
//! PUTCHUNK that makes its own re-backup redundant.
//!
//! Windows are reference counted: concurrent tasks listening on the same key
//! share one window and it closes when the last one ends.

use std::collections::HashSet;
use std::hash::Hash;

use dashmap::DashMap;
use trove_core::PeerId;

#[derive(Debug, Default)]
struct Window {
    holders: usize,
    observed: HashSet<PeerId>,
}

pub struct ListeningWindow<K: Eq + Hash> {
    windows: DashMap<K, Window>,
}

impl<K: Eq + Hash> Default for ListeningWindow<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> ListeningWindow<K> {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    pub fn begin(&self, key: K) {
        self.windows.entry(key).or_default().holders += 1;
    }

    /// Note that `peer` answered on `key`. Ignored when no window is open.
    pub fn observe(&self, key: &K, peer: PeerId) -> bool {
        match self.windows.get_mut(key) {
            Some(mut window) => {
                window.observed.insert(peer);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, key: &K) -> bool {
        self.windows.contains_key(key)
    }

    /// Distinct peers observed so far.
    pub fn observed(&self, key: &K) -> usize {
        self.windows.get(key).map(|w| w.observed.len()).unwrap_or(0)
    }

    /// Open and nothing observed yet.
    pub fn still_pending(&self, key: &K) -> bool {
        self.windows
            .get(key)
            .map(|w| w.observed.is_empty())
            .unwrap_or(false)
    }

    /// Release one holder. Returns the peers observed while open.
    pub fn end(&self, key: &K) -> HashSet<PeerId> {
        let Some(mut window) = self.windows.get_mut(key) else {
            return HashSet::new();
        };
        window.holders = window.holders.saturating_sub(1);
        let observed = window.observed.clone();
        drop(window);
        self.windows.remove_if(key, |_, w| w.holders == 0);
        observed
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
