//! Configuration records: address parsing, host/peer role resolution, network descriptors, timing.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::identity::{NetId, NodeId};
use crate::transport::TransportKind;

/// Host parts of a `host:port` address must be shorter than this many bytes.
pub const MAX_HOST_LEN: usize = 20;

/// Tunable intervals for both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Stream: minimum gap between failed dial attempts to the same peer.
    pub reconnect_cooldown: Duration,
    /// Stream: upper bound on one dial attempt.
    pub connect_timeout: Duration,
    /// Datagram: silence after which a connected peer is dropped.
    pub peer_timeout: Duration,
    /// Datagram: send a heartbeat when nothing was sent for this long.
    pub heartbeat_interval: Duration,
    /// Datagram: announce interval while disconnected.
    pub announce_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reconnect_cooldown: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(50),
            peer_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            announce_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid address {0:?}: expected host:port")]
    MissingColon(String),
    #[error("invalid address {0:?}: empty host")]
    EmptyHost(String),
    #[error("invalid address {address:?}: host must be shorter than {max} bytes")]
    HostTooLong { address: String, max: usize },
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
    #[error("invalid host in address {0:?}")]
    InvalidHost(String),
    #[error("stream address {0:?} must use a dotted-decimal IPv4 host")]
    NotIpv4(String),
    #[error("network id {0} out of range")]
    NetIdOutOfRange(u32),
    #[error("network {0} has no host entry for this node")]
    MissingHost(NetId),
    #[error("network {0} has more than one host entry")]
    DuplicateHost(NetId),
    #[error("node {node} listed twice on network {net}")]
    DuplicatePeer { net: NetId, node: NodeId },
    #[error("network {net} is {expected}, entry asks for {found}")]
    TransportMismatch {
        net: NetId,
        expected: TransportKind,
        found: TransportKind,
    },
}

/// Parse `host:port`, splitting at the last colon. The host must be an IP literal.
pub fn parse_address(text: &str) -> Result<SocketAddr, ConfigError> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::MissingColon(text.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::EmptyHost(text.to_string()));
    }
    if host.len() >= MAX_HOST_LEN {
        return Err(ConfigError::HostTooLong {
            address: text.to_string(),
            max: MAX_HOST_LEN,
        });
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidPort(text.to_string()))?;
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ConfigError::InvalidHost(text.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Stream form: same syntax, but the host must be dotted-decimal IPv4.
pub fn parse_stream_address(text: &str) -> Result<SocketAddr, ConfigError> {
    let addr = parse_address(text)?;
    if !addr.is_ipv4() {
        return Err(ConfigError::NotIpv4(text.to_string()));
    }
    Ok(addr)
}

/// One raw configuration line: which node sits at which address on which network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryRecord {
    pub net: u32,
    pub node: u32,
    pub transport: TransportKind,
    pub address: String,
}

impl EntryRecord {
    /// Resolve the record for this node: its own entry becomes the host role, any other a peer.
    pub fn classify(&self, local: NodeId) -> Result<Role, ConfigError> {
        let net = NetId::new(self.net)?;
        let address = match self.transport {
            TransportKind::Stream => parse_stream_address(&self.address)?,
            TransportKind::Datagram => parse_address(&self.address)?,
        };
        let node = NodeId(self.node);
        if node == local {
            Ok(Role::Host(HostEntry { net, node, address }))
        } else {
            Ok(Role::Peer(PeerEntry::new(local, net, node, address)))
        }
    }
}

/// Local endpoint on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub net: NetId,
    pub node: NodeId,
    pub address: SocketAddr,
}

/// Static identity of a remote node. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub net: NetId,
    pub node: NodeId,
    pub address: SocketAddr,
    /// Stream only: this node initiates the connection.
    pub dials_out: bool,
}

impl PeerEntry {
    pub fn new(local: NodeId, net: NetId, node: NodeId, address: SocketAddr) -> Self {
        Self {
            net,
            node,
            address,
            dials_out: local.dials_out_to(node),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Host(HostEntry),
    Peer(PeerEntry),
}

/// One bus segment: at most one host entry and the peers in config order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDescriptor {
    id: NetId,
    host: Option<HostEntry>,
    peers: Vec<PeerEntry>,
}

impl NetworkDescriptor {
    pub fn new(id: NetId) -> Self {
        Self {
            id,
            host: None,
            peers: Vec::new(),
        }
    }

    pub fn id(&self) -> NetId {
        self.id
    }

    pub fn host(&self) -> Option<&HostEntry> {
        self.host.as_ref()
    }

    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    pub fn peer_index(&self, node: NodeId) -> Option<usize> {
        self.peers.iter().position(|p| p.node == node)
    }

    pub fn peer(&self, node: NodeId) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.node == node)
    }

    pub fn set_host(&mut self, host: HostEntry) -> Result<(), ConfigError> {
        if self.host.is_some() {
            return Err(ConfigError::DuplicateHost(self.id));
        }
        self.host = Some(host);
        Ok(())
    }

    /// Append a peer; returns its index.
    pub fn add_peer(&mut self, peer: PeerEntry) -> Result<usize, ConfigError> {
        if self.peer_index(peer.node).is_some() {
            return Err(ConfigError::DuplicatePeer {
                net: self.id,
                node: peer.node,
            });
        }
        self.peers.push(peer);
        Ok(self.peers.len() - 1)
    }

    pub fn remove_peer(&mut self, node: NodeId) -> Option<PeerEntry> {
        let idx = self.peer_index(node)?;
        Some(self.peers.remove(idx))
    }

    pub fn with_host(mut self, host: HostEntry) -> Result<Self, ConfigError> {
        self.set_host(host)?;
        Ok(self)
    }

    pub fn with_peer(mut self, peer: PeerEntry) -> Result<Self, ConfigError> {
        self.add_peer(peer)?;
        Ok(self)
    }
}

/// A record that could not be applied. The rest of the configuration still loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub entry: usize,
    pub error: ConfigError,
}

/// Group records into per-network descriptors. Bad records are reported and skipped.
pub fn build_networks(
    local: NodeId,
    records: &[EntryRecord],
) -> (Vec<(TransportKind, NetworkDescriptor)>, Vec<EntryFailure>) {
    let mut nets: Vec<(TransportKind, NetworkDescriptor)> = Vec::new();
    let mut failures = Vec::new();
    for (entry, record) in records.iter().enumerate() {
        if let Err(error) = apply_record(local, record, &mut nets) {
            failures.push(EntryFailure { entry, error });
        }
    }
    (nets, failures)
}

fn apply_record(
    local: NodeId,
    record: &EntryRecord,
    nets: &mut Vec<(TransportKind, NetworkDescriptor)>,
) -> Result<(), ConfigError> {
    let role = record.classify(local)?;
    let net = match &role {
        Role::Host(h) => h.net,
        Role::Peer(p) => p.net,
    };
    let slot = match nets.iter().position(|(_, d)| d.id() == net) {
        Some(i) => i,
        None => {
            nets.push((record.transport, NetworkDescriptor::new(net)));
            nets.len() - 1
        }
    };
    let (kind, desc) = &mut nets[slot];
    if *kind != record.transport {
        return Err(ConfigError::TransportMismatch {
            net,
            expected: *kind,
            found: record.transport,
        });
    }
    match role {
        Role::Host(h) => desc.set_host(h),
        Role::Peer(p) => desc.add_peer(p).map(|_| ()),
    }
}
