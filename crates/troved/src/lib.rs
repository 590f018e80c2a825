//! troved: a trove backup peer.
//!
//! Three multicast channels feed one dispatcher, which spawns a reaction task
//! per inbound message. The four sub-protocols live in [`protocol`]; [`Peer`]
//! ties them to the state store, the chunk store and the control facade.

pub mod channel;
pub mod dispatch;
pub mod peer;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use channel::{Channel, ChannelKind, Channels, DatagramSink};
pub use peer::{Peer, PeerOptions};
