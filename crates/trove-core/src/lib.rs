//! trove-core: chunk identity, the wire format and configuration.
//! All other trove crates depend on this one.

pub mod chunk;
pub mod config;
pub mod wire;

pub use chunk::{Chunk, ChunkKey, FileId, PeerId, MAX_CHUNK_SIZE};
pub use wire::{Dialect, Message, MessageType, Payload, WireError};
