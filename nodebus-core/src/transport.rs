//! Transport capability interface and the kind → implementation registry.
//!
//! Every operation is non-blocking. Absence of a connection or of data is an
//! ordinary outcome (`Dropped`, `Empty`), never an error; `TransportError` is
//! reserved for operational and configuration failures.

use std::fmt;
use std::io;
use std::time::Instant;

use serde::Deserialize;

use crate::config::{ConfigError, NetworkDescriptor, PeerEntry};
use crate::host::BusHost;
use crate::identity::{NetId, NodeId};
use crate::protocol::{Message, MsgType};
use crate::wire::{FrameDecodeError, FrameEncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(alias = "tcp")]
    Stream,
    #[serde(alias = "udp")]
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Datagram => f.write_str("datagram"),
        }
    }
}

/// Where inbound traffic is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvScope {
    /// One connection per peer: call `recv_from_peer` for each peer.
    Peer,
    /// One shared socket per network: call `recv_from_net`.
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No live connection (or no room in the socket buffer); the message is not queued.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    Message(Message),
    /// Transport-level traffic was consumed (heartbeat, announce, disconnect). Call again.
    Handled,
    /// Nothing ready.
    Empty,
}

/// Snapshot of one peer's runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub node: NodeId,
    pub connected: bool,
    pub dial_attempts: u64,
    pub last_send: Option<Instant>,
    pub last_recv: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{op} failed on net {net}: {source}")]
    Io {
        op: &'static str,
        net: NetId,
        #[source]
        source: io::Error,
    },
    #[error("network {0} is not initialized")]
    UnknownNetwork(NetId),
    #[error("network {0} is already initialized")]
    NetworkExists(NetId),
    #[error("node {node} is not a peer on net {net}")]
    UnknownPeer { net: NetId, node: NodeId },
    #[error("datagram from unknown sender {node} on net {net}")]
    UnknownSender { net: NetId, node: NodeId },
    #[error("malformed frame on net {net}: {source}")]
    Frame {
        net: NetId,
        #[source]
        source: FrameDecodeError,
    },
    #[error("frame encode failed: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("short write to node {node} on net {net}: {written} of {expected} bytes")]
    ShortWrite {
        net: NetId,
        node: NodeId,
        written: usize,
        expected: usize,
    },
    #[error("{op} is not supported by the {kind} transport")]
    Unsupported { op: &'static str, kind: TransportKind },
}

/// Operations a bus transport exposes to the driver. All calls are non-blocking.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    fn recv_scope(&self) -> RecvScope;

    /// Bring up a network and every peer it lists. On failure nothing is stored.
    fn init_net(&mut self, desc: NetworkDescriptor) -> Result<(), TransportError>;

    /// Add one peer to an initialized network.
    fn load_peer(&mut self, net: NetId, entry: PeerEntry) -> Result<(), TransportError>;

    /// Periodic per-peer work (liveness, reconnection). Default: nothing to do.
    fn poll_peer(
        &mut self,
        _host: &mut dyn BusHost,
        _net: NetId,
        _node: NodeId,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn send(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
        msg_type: MsgType,
        payload: &[u8],
    ) -> Result<SendOutcome, TransportError>;

    fn recv_from_peer(
        &mut self,
        _host: &mut dyn BusHost,
        _net: NetId,
        _node: NodeId,
    ) -> Result<RecvOutcome, TransportError> {
        Err(TransportError::Unsupported {
            op: "recv_from_peer",
            kind: self.kind(),
        })
    }

    fn recv_from_net(
        &mut self,
        _host: &mut dyn BusHost,
        _net: NetId,
    ) -> Result<RecvOutcome, TransportError> {
        Err(TransportError::Unsupported {
            op: "recv_from_net",
            kind: self.kind(),
        })
    }

    fn unload_peer(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
    ) -> Result<(), TransportError>;

    fn unload_net(&mut self, host: &mut dyn BusHost, net: NetId) -> Result<(), TransportError>;

    fn peer_status(&self, net: NetId, node: NodeId) -> Option<PeerStatus>;
}

/// Transport implementations by kind, filled once at startup.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<Box<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation. A later registration for the same kind replaces the earlier one.
    pub fn register(&mut self, transport: Box<dyn Transport>) {
        let kind = transport.kind();
        self.transports.retain(|t| t.kind() != kind);
        self.transports.push(transport);
    }

    pub fn with(mut self, transport: Box<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, kind: TransportKind) -> Option<&dyn Transport> {
        self.transports
            .iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.as_ref())
    }

    pub fn get_mut(&mut self, kind: TransportKind) -> Option<&mut (dyn Transport + 'static)> {
        self.transports
            .iter_mut()
            .find(|t| t.kind() == kind)
            .map(|t| t.as_mut())
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.transports.iter().map(|t| t.kind()).collect()
    }
}
