//! nodebus wire protocol: message types, frame limits, decoded message.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Packed header size: body length (2) + message type (1) + sender node id (4).
pub const HEADER_SIZE: usize = 7;

/// Largest body a frame may declare. Larger headers are treated as a desynchronized stream.
pub const MAX_BODY_SIZE: usize = 32 * 1024;

/// Message type byte. Values outside the named constants pass through as application types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgType(pub u8);

impl MsgType {
    pub const NONE: MsgType = MsgType(0x00);
    pub const SUBSCRIBE: MsgType = MsgType(0x01);
    pub const UNSUBSCRIBE: MsgType = MsgType(0x02);
    pub const APP: MsgType = MsgType(0x03);
    pub const PROTOCOL: MsgType = MsgType(0x04);

    /// Datagram liveness: keep a connected peer from timing out.
    pub const HEARTBEAT: MsgType = MsgType(0xA0);
    /// Datagram liveness: sent by the announcing side while disconnected.
    pub const ANNOUNCE: MsgType = MsgType(0xA1);
    /// Datagram liveness: sender is going away.
    pub const DISCONNECT: MsgType = MsgType(0xA2);

    /// Liveness traffic is consumed by the datagram transport and never delivered.
    pub fn is_liveness(self) -> bool {
        matches!(self, Self::HEARTBEAT | Self::ANNOUNCE | Self::DISCONNECT)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// A fully received message: header fields plus exactly `body_len` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub sender: NodeId,
    pub payload: Vec<u8>,
}
