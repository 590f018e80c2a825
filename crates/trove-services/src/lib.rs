//! trove-services: replication bookkeeping, listening windows, storage
//! backend and the control facade contract.

pub mod control;
pub mod reclaim;
pub mod state;
pub mod store;
pub mod sync;
pub mod window;

pub use control::{Control, ControlError};
pub use state::{PeerState, PersistedState, Reservation};
pub use store::{ChunkStore, FsStore};
pub use sync::{BackupSync, ReclaimSync, RestoreSync};
pub use window::ListeningWindow;
