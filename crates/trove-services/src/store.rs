//! Storage backend.
//!
//! The protocol engine only talks to [`ChunkStore`]. [`FsStore`] lays a
//! peer's data out under one root:
//!
//! ```text
//! <root>/chunks/<file_id>/<chunk_no>   stored chunk content
//! <root>/recovered/<name>              restored files
//! <root>/state.json                    persisted replication state
//! ```
//!
//! Every write goes to a temp file first and is renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use memmap2::Mmap;
use trove_core::{Chunk, ChunkKey, FileId};

use crate::state::PersistedState;

pub trait ChunkStore: Send + Sync {
    fn store_chunk(&self, key: &ChunkKey, content: &[u8]) -> Result<()>;

    /// `None` when the chunk is not on disk.
    fn load_chunk(&self, key: &ChunkKey) -> Result<Option<Bytes>>;

    fn delete_chunk(&self, key: &ChunkKey) -> Result<()>;

    fn delete_all_chunks(&self, file_id: &FileId) -> Result<()>;

    /// Write `chunks` (already in chunk-number order) out as one file.
    fn restore_file(&self, name: &str, chunks: &[Chunk]) -> Result<PathBuf>;

    fn persist_state(&self, state: &PersistedState) -> Result<()>;

    fn load_state(&self) -> Result<Option<PersistedState>>;
}

/// Filesystem-backed chunk store.
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("chunks"))
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_dir(&self, file_id: &FileId) -> PathBuf {
        self.root.join("chunks").join(file_id.as_str())
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.file_dir(&key.file_id).join(key.number.to_string())
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn recovered_dir(&self) -> PathBuf {
        self.root.join("recovered")
    }
}

/// Atomic write: tmp file → rename.
fn write_atomic(path: &Path, parts: &[&[u8]]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        for part in parts {
            file.write_all(part)
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        }
        file.sync_all().context("failed to sync to disk")?;
    }

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}

impl ChunkStore for FsStore {
    fn store_chunk(&self, key: &ChunkKey, content: &[u8]) -> Result<()> {
        write_atomic(&self.chunk_path(key), &[content])?;
        tracing::trace!(chunk = %key, bytes = content.len(), "chunk written");
        Ok(())
    }

    fn load_chunk(&self, key: &ChunkKey) -> Result<Option<Bytes>> {
        let path = self.chunk_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open chunk: {}", path.display()))?;

        // Zero-length files cannot be mapped.
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn delete_chunk(&self, key: &ChunkKey) -> Result<()> {
        let path = self.chunk_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to delete {}", path.display()))
            }
        }
        // Drop the file directory once its last chunk is gone.
        let _ = fs::remove_dir(self.file_dir(&key.file_id));
        Ok(())
    }

    fn delete_all_chunks(&self, file_id: &FileId) -> Result<()> {
        let dir = self.file_dir(file_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", dir.display())),
        }
    }

    fn restore_file(&self, name: &str, chunks: &[Chunk]) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .with_context(|| format!("restore target has no file name: {name:?}"))?;
        let path = self.recovered_dir().join(file_name);

        let parts: Vec<&[u8]> = chunks.iter().map(|c| c.content.as_ref()).collect();
        write_atomic(&path, &parts)?;
        Ok(path)
    }

    fn persist_state(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state).context("failed to serialize state")?;
        write_atomic(&self.state_path(), &[&json])
    }

    fn load_state(&self) -> Result<Option<PersistedState>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if text.is_empty() {
            bail!("state file {} is empty", path.display());
        }
        let state = serde_json::from_slice(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(state))
    }
}
