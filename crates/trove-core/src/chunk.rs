//! Chunk identity and file splitting.
//!
//! A file is cut into `MAX_CHUNK_SIZE` slices. When the file length is an
//! exact multiple of `MAX_CHUNK_SIZE` (zero included) an empty terminal chunk
//! is appended, so a chunk shorter than the maximum always marks the end of
//! the file. Restore relies on this: the chunk count is never transmitted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum chunk payload in bytes.
pub const MAX_CHUNK_SIZE: usize = 64_000;

/// Upper bound on chunks per file. Bounds the largest file that can be backed up.
pub const MAX_CHUNKS: u64 = 1_000_000;

/// Numeric peer identifier, assigned at startup and carried in every header.
pub type PeerId = u32;

// ── File ID ───────────────────────────────────────────────────────────────────

/// 256-bit file identifier, hex-encoded (64 lowercase characters).
///
/// Derived from the file's absolute path, modification time and length, so
/// two backups of an unchanged file share an ID while an edited file gets a
/// new one. The ID doubles as a directory name in the chunk store, which is
/// why parsing is strict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

impl FileId {
    /// Length of the hex representation.
    pub const HEX_LEN: usize = 64;

    /// Derive the ID from a file fingerprint.
    pub fn derive(fingerprint: &FileFingerprint) -> Self {
        let material = format!(
            "{}{}{}",
            fingerprint.path.display(),
            fingerprint.modified_ms,
            fingerprint.len
        );
        FileId(hex::encode(blake3::hash(material.as_bytes()).as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl FromStr for FileId {
    type Err = InvalidFileId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidFileId(s.to_string()));
        }
        Ok(FileId(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for FileId {
    type Error = InvalidFileId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> String {
        id.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid file id: {0:?}")]
pub struct InvalidFileId(pub String);

/// The metadata a file ID is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub modified_ms: u128,
    pub len: u64,
}

impl FileFingerprint {
    /// Read the fingerprint of an existing file. The path is made absolute.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let path = fs::canonicalize(path)?;
        let meta = fs::metadata(&path)?;
        let modified_ms = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Ok(Self {
            path,
            modified_ms,
            len: meta.len(),
        })
    }

    /// Number of chunks a file of this length splits into.
    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.len)
    }
}

// ── Chunk key / chunk ────────────────────────────────────────────────────────

/// A file ID plus chunk number. Identifies a chunk everywhere in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub number: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, number: u32) -> Self {
        Self { file_id, number }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id.short(), self.number)
    }
}

/// A chunk with its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub key: ChunkKey,
    pub content: Bytes,
}

impl Chunk {
    pub fn new(key: ChunkKey, content: Bytes) -> Self {
        Self { key, content }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// A chunk shorter than the maximum is the last chunk of its file.
    pub fn is_last(&self) -> bool {
        self.content.len() < MAX_CHUNK_SIZE
    }
}

// ── Splitting ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("{path} is {len} bytes, larger than the {max} byte limit")]
    FileTooLarge { path: PathBuf, len: u64, max: u64 },

    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

/// Largest file that can be split.
pub const fn max_file_size() -> u64 {
    MAX_CHUNK_SIZE as u64 * MAX_CHUNKS
}

/// Chunks produced for a file of `len` bytes, terminal empty chunk included.
pub fn chunk_count(len: u64) -> u64 {
    len / MAX_CHUNK_SIZE as u64 + 1
}

/// Split raw bytes into chunks of `file_id`.
pub fn split(file_id: &FileId, data: &Bytes) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = (0..data.len())
        .step_by(MAX_CHUNK_SIZE)
        .enumerate()
        .map(|(number, start)| {
            let end = (start + MAX_CHUNK_SIZE).min(data.len());
            Chunk::new(
                ChunkKey::new(file_id.clone(), number as u32),
                data.slice(start..end),
            )
        })
        .collect();

    if data.len() % MAX_CHUNK_SIZE == 0 {
        let number = chunks.len() as u32;
        chunks.push(Chunk::new(
            ChunkKey::new(file_id.clone(), number),
            Bytes::new(),
        ));
    }
    chunks
}

/// Concatenate chunk contents in chunk-number order.
pub fn reassemble<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Vec<u8> {
    let mut ordered: Vec<&Chunk> = chunks.into_iter().collect();
    ordered.sort_by_key(|c| c.key.number);
    let mut out = Vec::with_capacity(ordered.iter().map(|c| c.len()).sum());
    for chunk in ordered {
        out.extend_from_slice(&chunk.content);
    }
    out
}

/// A file read from disk and split, ready for backup.
#[derive(Debug)]
pub struct ChunkedFile {
    pub fingerprint: FileFingerprint,
    pub file_id: FileId,
    pub chunks: Vec<Chunk>,
}

impl ChunkedFile {
    pub fn read(path: &Path) -> Result<Self, ChunkError> {
        let fingerprint =
            FileFingerprint::read(path).map_err(|e| ChunkError::Io(path.to_path_buf(), e))?;

        if fingerprint.len > max_file_size() {
            return Err(ChunkError::FileTooLarge {
                path: fingerprint.path,
                len: fingerprint.len,
                max: max_file_size(),
            });
        }

        let data = fs::read(&fingerprint.path)
            .map_err(|e| ChunkError::Io(fingerprint.path.clone(), e))?;
        let file_id = FileId::derive(&fingerprint);
        let chunks = split(&file_id, &Bytes::from(data));

        Ok(Self {
            fingerprint,
            file_id,
            chunks,
        })
    }
}
