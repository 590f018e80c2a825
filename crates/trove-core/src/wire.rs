//! Trove wire format: the text-header datagram shared by every peer.
//!
//! ```text
//! <version> <TYPE> <sender> [<file_id>] [<chunk_no>] [<replication>] \r\n\r\n [body]
//! ```
//!
//! Every header field is followed by a single space, then the header ends
//! with a blank line. Only PUTCHUNK and CHUNK carry a body. Both dialects
//! share this layout, so encoding must stay byte-exact.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkKey, FileId, PeerId, MAX_CHUNK_SIZE};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Separates the header from the body.
pub const TERMINATOR: &[u8] = b"\r\n\r\n";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("header terminator not found")]
    MissingTerminator,
    #[error("header is not valid UTF-8")]
    NotUtf8,
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("invalid {field} field: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid file id: {0:?}")]
    InvalidFileId(String),
    #[error("body of {0} bytes exceeds the chunk size limit")]
    BodyTooLarge(usize),
    #[error("datagram of {0} bytes exceeds {MAX_DATAGRAM}")]
    DatagramTooLarge(usize),
    #[error("unknown protocol dialect {0:?}")]
    UnknownDialect(String),
    #[error("direct transfer port must be 4 bytes holding 1..=65535")]
    InvalidPort,
}

// ── Dialect ───────────────────────────────────────────────────────────────────

/// Protocol dialect spoken by a peer.
///
/// `Enhanced` adds direct chunk transfer on restore, a degree check before
/// storing on backup, and delete acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dialect {
    Baseline,
    Enhanced,
}

impl Dialect {
    pub fn version(self) -> &'static str {
        match self {
            Dialect::Baseline => "1.0",
            Dialect::Enhanced => "2.0",
        }
    }

    /// Dialect to handle an inbound message with. Enhanced behaviour only
    /// applies when both this peer and the message speak it; anything else,
    /// unknown versions included, falls back to baseline.
    pub fn negotiate(local: Dialect, remote_version: &str) -> Dialect {
        match (local, remote_version) {
            (Dialect::Enhanced, "2.0") => Dialect::Enhanced,
            _ => Dialect::Baseline,
        }
    }

    pub fn is_enhanced(self) -> bool {
        self == Dialect::Enhanced
    }
}

impl FromStr for Dialect {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Dialect::Baseline),
            "2.0" => Ok(Dialect::Enhanced),
            other => Err(WireError::UnknownDialect(other.to_string())),
        }
    }
}

impl TryFrom<String> for Dialect {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Dialect> for String {
    fn from(d: Dialect) -> String {
        d.version().to_string()
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.version())
    }
}

// ── Message type ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PutChunk,
    Stored,
    GetChunk,
    Chunk,
    Delete,
    Removed,
    Startup,
    Deleted,
    Unknown,
}

impl MessageType {
    pub fn token(self) -> &'static str {
        match self {
            MessageType::PutChunk => "PUTCHUNK",
            MessageType::Stored => "STORED",
            MessageType::GetChunk => "GETCHUNK",
            MessageType::Chunk => "CHUNK",
            MessageType::Delete => "DELETE",
            MessageType::Removed => "REMOVED",
            MessageType::Startup => "STARTUP",
            MessageType::Deleted => "DELETED",
            MessageType::Unknown => "UNKNOWN",
        }
    }

    /// Unrecognised tokens map to `Unknown` instead of failing.
    pub fn from_token(token: &str) -> Self {
        match token {
            "PUTCHUNK" => MessageType::PutChunk,
            "STORED" => MessageType::Stored,
            "GETCHUNK" => MessageType::GetChunk,
            "CHUNK" => MessageType::Chunk,
            "DELETE" => MessageType::Delete,
            "REMOVED" => MessageType::Removed,
            "STARTUP" => MessageType::Startup,
            "DELETED" => MessageType::Deleted,
            _ => MessageType::Unknown,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// Type-specific fields of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    PutChunk {
        key: ChunkKey,
        replication: u8,
        body: Bytes,
    },
    Stored {
        key: ChunkKey,
    },
    GetChunk {
        key: ChunkKey,
    },
    /// Chunk content, or under the enhanced dialect a 4-byte port to pull it from.
    Chunk {
        key: ChunkKey,
        body: Bytes,
    },
    Delete {
        file_id: FileId,
    },
    Removed {
        key: ChunkKey,
    },
    Startup,
    Deleted {
        file_id: FileId,
    },
    Unknown {
        token: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Version token as received. Kept verbatim so unknown versions can
    /// still be negotiated down to baseline.
    pub version: String,
    pub sender: PeerId,
    pub payload: Payload,
}

impl Message {
    pub fn new(dialect: Dialect, sender: PeerId, payload: Payload) -> Self {
        Self {
            version: dialect.version().to_string(),
            sender,
            payload,
        }
    }

    pub fn put_chunk(dialect: Dialect, sender: PeerId, chunk: &Chunk, replication: u8) -> Self {
        Self::new(
            dialect,
            sender,
            Payload::PutChunk {
                key: chunk.key.clone(),
                replication,
                body: chunk.content.clone(),
            },
        )
    }

    /// STORED is always tagged baseline.
    pub fn stored(sender: PeerId, key: ChunkKey) -> Self {
        Self::new(Dialect::Baseline, sender, Payload::Stored { key })
    }

    pub fn get_chunk(dialect: Dialect, sender: PeerId, key: ChunkKey) -> Self {
        Self::new(dialect, sender, Payload::GetChunk { key })
    }

    pub fn chunk(sender: PeerId, chunk: &Chunk) -> Self {
        Self::new(
            Dialect::Baseline,
            sender,
            Payload::Chunk {
                key: chunk.key.clone(),
                body: chunk.content.clone(),
            },
        )
    }

    /// Enhanced CHUNK advertising the port the content is served on.
    pub fn chunk_port(sender: PeerId, key: ChunkKey, port: u16) -> Self {
        Self::new(
            Dialect::Enhanced,
            sender,
            Payload::Chunk {
                key,
                body: Bytes::copy_from_slice(&encode_port(port)),
            },
        )
    }

    pub fn delete(dialect: Dialect, sender: PeerId, file_id: FileId) -> Self {
        Self::new(dialect, sender, Payload::Delete { file_id })
    }

    /// REMOVED is always tagged baseline.
    pub fn removed(sender: PeerId, key: ChunkKey) -> Self {
        Self::new(Dialect::Baseline, sender, Payload::Removed { key })
    }

    pub fn startup(sender: PeerId) -> Self {
        Self::new(Dialect::Enhanced, sender, Payload::Startup)
    }

    pub fn deleted(sender: PeerId, file_id: FileId) -> Self {
        Self::new(Dialect::Enhanced, sender, Payload::Deleted { file_id })
    }

    pub fn message_type(&self) -> MessageType {
        match &self.payload {
            Payload::PutChunk { .. } => MessageType::PutChunk,
            Payload::Stored { .. } => MessageType::Stored,
            Payload::GetChunk { .. } => MessageType::GetChunk,
            Payload::Chunk { .. } => MessageType::Chunk,
            Payload::Delete { .. } => MessageType::Delete,
            Payload::Removed { .. } => MessageType::Removed,
            Payload::Startup => MessageType::Startup,
            Payload::Deleted { .. } => MessageType::Deleted,
            Payload::Unknown { .. } => MessageType::Unknown,
        }
    }

    pub fn key(&self) -> Option<&ChunkKey> {
        match &self.payload {
            Payload::PutChunk { key, .. }
            | Payload::Stored { key }
            | Payload::GetChunk { key }
            | Payload::Chunk { key, .. }
            | Payload::Removed { key } => Some(key),
            _ => None,
        }
    }

    pub fn file_id(&self) -> Option<&FileId> {
        match &self.payload {
            Payload::Delete { file_id } | Payload::Deleted { file_id } => Some(file_id),
            _ => self.key().map(|k| &k.file_id),
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::PutChunk { body, .. } | Payload::Chunk { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Header text including the trailing terminator.
    pub fn header(&self) -> String {
        let mut header = format!(
            "{} {} {} ",
            self.version,
            self.message_type(),
            self.sender
        );
        match &self.payload {
            Payload::PutChunk {
                key, replication, ..
            } => {
                header.push_str(&format!("{} {} {} ", key.file_id, key.number, replication));
            }
            Payload::Stored { key }
            | Payload::GetChunk { key }
            | Payload::Chunk { key, .. }
            | Payload::Removed { key } => {
                header.push_str(&format!("{} {} ", key.file_id, key.number));
            }
            Payload::Delete { file_id } | Payload::Deleted { file_id } => {
                header.push_str(&format!("{} ", file_id));
            }
            Payload::Startup | Payload::Unknown { .. } => {}
        }
        header.push_str("\r\n\r\n");
        header
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let body: &[u8] = self.body().map(|b| &b[..]).unwrap_or_default();
        let mut out = Vec::with_capacity(header.len() + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(body);
        out
    }

    /// Encode and check the result fits in one datagram.
    pub fn to_datagram(&self) -> Result<Vec<u8>, WireError> {
        let bytes = self.encode();
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::DatagramTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let end = datagram
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
            .ok_or(WireError::MissingTerminator)?;

        let header = std::str::from_utf8(&datagram[..end]).map_err(|_| WireError::NotUtf8)?;
        // Extra header lines are allowed and ignored.
        let first_line = header.split("\r\n").next().unwrap_or_default();
        let mut fields = first_line.split_whitespace();

        let version = fields.next().ok_or(WireError::MissingField("version"))?;
        let token = fields.next().ok_or(WireError::MissingField("type"))?;
        let sender = parse_number::<PeerId>(fields.next(), "sender")?;
        let body = &datagram[end + TERMINATOR.len()..];

        let payload = match MessageType::from_token(token) {
            MessageType::PutChunk => Payload::PutChunk {
                key: parse_key(&mut fields)?,
                replication: parse_number(fields.next(), "replication")?,
                body: parse_body(body)?,
            },
            MessageType::Stored => Payload::Stored {
                key: parse_key(&mut fields)?,
            },
            MessageType::GetChunk => Payload::GetChunk {
                key: parse_key(&mut fields)?,
            },
            MessageType::Chunk => Payload::Chunk {
                key: parse_key(&mut fields)?,
                body: parse_body(body)?,
            },
            MessageType::Delete => Payload::Delete {
                file_id: parse_file_id(fields.next())?,
            },
            MessageType::Removed => Payload::Removed {
                key: parse_key(&mut fields)?,
            },
            MessageType::Startup => Payload::Startup,
            MessageType::Deleted => Payload::Deleted {
                file_id: parse_file_id(fields.next())?,
            },
            MessageType::Unknown => Payload::Unknown {
                token: token.to_string(),
            },
        };

        Ok(Self {
            version: version.to_string(),
            sender,
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} from {}", self.version, self.message_type(), self.sender)?;
        if let Some(key) = self.key() {
            write!(f, " {key}")?;
        } else if let Some(id) = self.file_id() {
            write!(f, " {}", id.short())?;
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(field: Option<&str>, name: &'static str) -> Result<T, WireError> {
    let value = field.ok_or(WireError::MissingField(name))?;
    value.parse().map_err(|_| WireError::InvalidNumber {
        field: name,
        value: value.to_string(),
    })
}

fn parse_file_id(field: Option<&str>) -> Result<FileId, WireError> {
    let value = field.ok_or(WireError::MissingField("file_id"))?;
    value
        .parse()
        .map_err(|_| WireError::InvalidFileId(value.to_string()))
}

fn parse_key<'a>(fields: &mut impl Iterator<Item = &'a str>) -> Result<ChunkKey, WireError> {
    let file_id = parse_file_id(fields.next())?;
    let number = parse_number(fields.next(), "chunk_no")?;
    Ok(ChunkKey::new(file_id, number))
}

fn parse_body(body: &[u8]) -> Result<Bytes, WireError> {
    if body.len() > MAX_CHUNK_SIZE {
        return Err(WireError::BodyTooLarge(body.len()));
    }
    Ok(Bytes::copy_from_slice(body))
}

// ── Direct transfer port ──────────────────────────────────────────────────────

/// Port as a 4-byte big-endian integer, the enhanced CHUNK body.
pub fn encode_port(port: u16) -> [u8; 4] {
    u32::from(port).to_be_bytes()
}

pub fn decode_port(body: &[u8]) -> Result<u16, WireError> {
    let raw: [u8; 4] = body.try_into().map_err(|_| WireError::InvalidPort)?;
    match u32::from_be_bytes(raw) {
        0 => Err(WireError::InvalidPort),
        p => u16::try_from(p).map_err(|_| WireError::InvalidPort),
    }
}
