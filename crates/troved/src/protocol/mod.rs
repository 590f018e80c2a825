//! The four sub-protocols.
//!
//! Each one has an initiator (a retry state struct stepped by a spawned
//! runner) and the reactions other peers run when its messages arrive.
//! Initiator state is plain data so its retry logic is testable without a
//! runtime.

pub mod backup;
pub mod delete;
pub mod reclaim;
pub mod restore;
