//! Boundary to the host bus: inbound delivery and peer connection notifications.

use crate::identity::{NetId, NodeId};
use crate::protocol::Message;

/// Calls the transport layer makes into the bus. Must be fast and must not re-enter the transport.
pub trait BusHost {
    fn deliver(&mut self, net: NetId, msg: Message);
    fn peer_connected(&mut self, net: NetId, node: NodeId);
    fn peer_disconnected(&mut self, net: NetId, node: NodeId);
}

/// One recorded host call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Delivered { net: NetId, msg: Message },
    Connected { net: NetId, node: NodeId },
    Disconnected { net: NetId, node: NodeId },
}

/// Records every call in order. Handy for simulations and for hosts that process events in batches.
impl BusHost for Vec<BusEvent> {
    fn deliver(&mut self, net: NetId, msg: Message) {
        self.push(BusEvent::Delivered { net, msg });
    }

    fn peer_connected(&mut self, net: NetId, node: NodeId) {
        self.push(BusEvent::Connected { net, node });
    }

    fn peer_disconnected(&mut self, net: NetId, node: NodeId) {
        self.push(BusEvent::Disconnected { net, node });
    }
}
