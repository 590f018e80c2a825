//! Control facade: what a local operator can ask a peer to do.
//!
//! Calls return once the request is accepted. Backup, restore and reclaim
//! keep running in the background afterwards.

use std::path::{Path, PathBuf};

use trove_core::FileId;

/// Replication degrees accepted by `backup`.
pub const REPLICATION_RANGE: std::ops::RangeInclusive<u8> = 1..=9;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("replication degree {0} outside 1..=9")]
    InvalidReplicationDegree(u8),

    #[error("{path} is {len} bytes, larger than the {max} byte limit")]
    FileTooLarge { path: PathBuf, len: u64, max: u64 },

    #[error("{0}")]
    Io(String),

    #[error("{0} is already backed up")]
    AlreadyBackedUp(PathBuf),

    #[error("{0} was never backed up by this peer")]
    NotBackedUp(PathBuf),

    #[error("network failure: {0}")]
    Transport(String),
}

impl ControlError {
    /// Rejections caused by the request itself rather than by the peer.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ControlError::InvalidReplicationDegree(_)
                | ControlError::FileTooLarge { .. }
                | ControlError::AlreadyBackedUp(_)
                | ControlError::NotBackedUp(_)
        )
    }
}

impl From<trove_core::chunk::ChunkError> for ControlError {
    fn from(e: trove_core::chunk::ChunkError) -> Self {
        use trove_core::chunk::ChunkError;
        match e {
            ChunkError::FileTooLarge { path, len, max } => ControlError::FileTooLarge { path, len, max },
            ChunkError::Io(path, err) => ControlError::Io(format!("{}: {}", path.display(), err)),
        }
    }
}

pub trait Control: Send + Sync {
    /// Split `path` and start replicating every chunk `replication` times.
    fn backup(&self, path: &Path, replication: u8) -> Result<FileId, ControlError>;

    /// Ask the network for every chunk of a file backed up earlier.
    fn restore(&self, path: &Path) -> Result<FileId, ControlError>;

    /// Tell every peer to drop a file backed up earlier.
    fn delete(&self, path: &Path) -> Result<FileId, ControlError>;

    /// Apply a new storage cap. Returns how many chunks were evicted.
    fn reclaim(&self, max_bytes: u64) -> Result<usize, ControlError>;

    /// Human-readable state dump.
    fn state(&self) -> String;
}
