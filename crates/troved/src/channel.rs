//! Multicast channels.
//!
//! Each logical channel is one multicast group. Sending goes through a
//! [`DatagramSink`] so tests can swap the network for an in-process bus;
//! receiving is a loop that only decodes and hands off to the dispatcher.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use trove_core::wire::{Message, MAX_DATAGRAM};

use crate::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// DELETE, STORED, GETCHUNK, REMOVED, STARTUP, DELETED
    Control,
    /// PUTCHUNK
    BackupData,
    /// CHUNK
    RestoreData,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Control,
        ChannelKind::BackupData,
        ChannelKind::RestoreData,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Control => "control",
            ChannelKind::BackupData => "backup",
            ChannelKind::RestoreData => "restore",
        }
    }
}

/// Outbound half of a channel.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<()>;
}

/// Sends to a multicast group from an unbound UDP socket.
pub struct MulticastSink {
    socket: StdUdpSocket,
    group: SocketAddr,
}

impl DatagramSink for MulticastSink {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.group).map(|_| ())
    }
}

#[derive(Clone)]
pub struct Channel {
    kind: ChannelKind,
    sink: Arc<dyn DatagramSink>,
}

impl Channel {
    pub fn new(kind: ChannelKind, sink: Arc<dyn DatagramSink>) -> Self {
        Self { kind, sink }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn broadcast(&self, message: &Message) -> Result<()> {
        let datagram = message.to_datagram()?;
        self.sink
            .send_datagram(&datagram)
            .with_context(|| format!("failed to send {message} on {} channel", self.kind.name()))?;
        tracing::debug!(channel = self.kind.name(), message = %message, "sent");
        Ok(())
    }
}

/// The three channels a peer talks on.
#[derive(Clone)]
pub struct Channels {
    pub control: Channel,
    pub backup: Channel,
    pub restore: Channel,
}

impl Channels {
    pub fn get(&self, kind: ChannelKind) -> &Channel {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::BackupData => &self.backup,
            ChannelKind::RestoreData => &self.restore,
        }
    }
}

// ── Sockets ───────────────────────────────────────────────────────────────────

/// Join `group` and return the sending channel plus the socket to receive on.
pub fn open_multicast(kind: ChannelKind, group: SocketAddr) -> Result<(Channel, UdpSocket)> {
    if !group.ip().is_multicast() {
        bail!("{} channel address {} is not a multicast group", kind.name(), group);
    }

    let sender = make_sender_socket(group)
        .with_context(|| format!("failed to create {} sender socket", kind.name()))?;
    let listener = make_listener_socket(group)
        .with_context(|| format!("failed to join {} group {}", kind.name(), group))?;
    let listener =
        UdpSocket::from_std(listener).context("failed to convert to tokio UdpSocket")?;

    tracing::info!(channel = kind.name(), group = %group, "joined multicast group");

    let sink = MulticastSink {
        socket: sender,
        group,
    };
    Ok((Channel::new(kind, Arc::new(sink)), listener))
}

fn make_sender_socket(group: SocketAddr) -> Result<StdUdpSocket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    // TTL 1 keeps traffic on the local segment. Loopback on so peers sharing
    // a host hear each other and a peer hears its own PUTCHUNKs.
    match group {
        SocketAddr::V4(_) => {
            socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;
            socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
        }
        SocketAddr::V6(_) => {
            socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
            socket.set_multicast_loop_v6(true).context("IPV6_MULTICAST_LOOP")?;
        }
    }
    Ok(socket.into())
}

fn make_listener_socket(group: SocketAddr) -> Result<StdUdpSocket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;

    match group {
        SocketAddr::V4(v4) => {
            let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, v4.port()));
            socket.bind(&bind.into()).context("bind")?;
            socket
                .join_multicast_v4(v4.ip(), &Ipv4Addr::UNSPECIFIED)
                .context("IP_ADD_MEMBERSHIP")?;
        }
        SocketAddr::V6(v6) => {
            let bind = SocketAddr::from((Ipv6Addr::UNSPECIFIED, v6.port()));
            socket.bind(&bind.into()).context("bind")?;
            socket
                .join_multicast_v6(v6.ip(), v6.scope_id())
                .context("IPV6_JOIN_GROUP")?;
        }
    }

    socket.set_nonblocking(true).context("O_NONBLOCK")?;
    Ok(socket.into())
}

// ── Receive loop ──────────────────────────────────────────────────────────────

/// Receive datagrams forever and hand each to the dispatcher.
///
/// Runs until the task is dropped.
pub async fn receive_loop(kind: ChannelKind, socket: UdpSocket, peer: Peer) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    tracing::info!(channel = kind.name(), "receive loop starting");

    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(channel = kind.name(), error = %e, "recv_from failed");
                continue;
            }
        };
        peer.deliver(kind, &buf[..len], source);
    }
}
