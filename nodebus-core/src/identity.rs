//! Node and network identity: node ids double as ranks for the asymmetric connection roles.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Upper bound (exclusive) on network ids. Each transport keeps one arena slot per id.
pub const MAX_NETWORKS: usize = 16;

/// Node id (processor id). Carried in every wire header as the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Stream role: the numerically greater rank initiates the connection.
    pub fn dials_out_to(self, peer: NodeId) -> bool {
        self > peer
    }

    /// Datagram role: the numerically lower rank announces itself while disconnected.
    pub fn announces_to(self, peer: NodeId) -> bool {
        self < peer
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network id. Indexes directly into a transport's network arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetId(u8);

impl NetId {
    /// Validate a raw network number from a configuration record.
    pub fn new(raw: u32) -> Result<Self, ConfigError> {
        if (raw as usize) < MAX_NETWORKS {
            Ok(NetId(raw as u8))
        } else {
            Err(ConfigError::NetIdOutOfRange(raw))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
