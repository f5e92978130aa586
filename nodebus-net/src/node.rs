//! Poll-driven node: brings networks up from configuration entries and cycles every
//! transport on each tick (drain receive, then per-peer upkeep).

use nodebus_core::{
    build_networks, BusHost, EntryFailure, EntryRecord, MsgType, NetId, NodeId, PeerStatus,
    RecvOutcome, RecvScope, SendOutcome, TransportError, TransportKind, TransportRegistry,
};
use tracing::{error, info, warn};

/// What `Node::load` managed to bring up.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub up: Vec<NetId>,
    /// Entries skipped during validation, by position in the input.
    pub rejected: Vec<EntryFailure>,
    /// Networks whose transport refused to initialize.
    pub failed: Vec<(NetId, TransportError)>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    pub errors: usize,
}

struct LiveNet {
    kind: TransportKind,
    net: NetId,
    peers: Vec<NodeId>,
}

pub struct Node {
    local: NodeId,
    registry: TransportRegistry,
    nets: Vec<LiveNet>,
    recv_budget: usize,
}

impl Node {
    /// Receive calls per peer (stream) or per network (datagram) in one tick.
    pub const DEFAULT_RECV_BUDGET: usize = 64;

    pub fn new(local: NodeId, registry: TransportRegistry) -> Self {
        Self {
            local,
            registry,
            nets: Vec::new(),
            recv_budget: Self::DEFAULT_RECV_BUDGET,
        }
    }

    pub fn with_recv_budget(mut self, budget: usize) -> Self {
        self.recv_budget = budget.max(1);
        self
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn networks(&self) -> Vec<(NetId, TransportKind)> {
        self.nets.iter().map(|n| (n.net, n.kind)).collect()
    }

    /// Validate entries, group them by network and hand each network to its transport.
    /// Bad entries and failing networks are reported; the rest still come up.
    pub fn load(&mut self, records: &[EntryRecord]) -> LoadReport {
        let (descs, rejected) = build_networks(self.local, records);
        for f in &rejected {
            warn!(entry = f.entry, error = %f.error, "configuration entry skipped");
        }
        let mut report = LoadReport {
            rejected,
            ..LoadReport::default()
        };
        for (kind, desc) in descs {
            let net = desc.id();
            if self.nets.iter().any(|n| n.net == net) {
                report.failed.push((net, TransportError::NetworkExists(net)));
                continue;
            }
            let Some(transport) = self.registry.get_mut(kind) else {
                warn!(%net, %kind, "no transport registered");
                report.failed.push((
                    net,
                    TransportError::Unsupported {
                        op: "init_net",
                        kind,
                    },
                ));
                continue;
            };
            let peers = desc.peers().iter().map(|p| p.node).collect();
            match transport.init_net(desc) {
                Ok(()) => {
                    info!(%net, %kind, "network up");
                    self.nets.push(LiveNet { kind, net, peers });
                    report.up.push(net);
                }
                Err(e) => {
                    error!(%net, %kind, error = %e, "network not brought up");
                    report.failed.push((net, e));
                }
            }
        }
        report
    }

    /// One pass over every network: drain inbound traffic into `host`, then run peer upkeep.
    pub fn tick(&mut self, host: &mut dyn BusHost) -> TickReport {
        let mut report = TickReport::default();
        let budget = self.recv_budget;
        for live in &self.nets {
            let Some(transport) = self.registry.get_mut(live.kind) else {
                continue;
            };
            let net = live.net;
            match transport.recv_scope() {
                RecvScope::Network => drain(budget, net, host, &mut report, |h| {
                    transport.recv_from_net(h, net)
                }),
                RecvScope::Peer => {
                    for &node in &live.peers {
                        drain(budget, net, host, &mut report, |h| {
                            transport.recv_from_peer(h, net, node)
                        });
                    }
                }
            }
            for &node in &live.peers {
                if let Err(e) = transport.poll_peer(host, net, node) {
                    report.errors += 1;
                    warn!(%net, %node, error = %e, "peer upkeep failed");
                }
            }
        }
        report
    }

    pub fn send(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
        msg_type: MsgType,
        payload: &[u8],
    ) -> Result<SendOutcome, TransportError> {
        let kind = self.kind_of(net)?;
        let transport = self
            .registry
            .get_mut(kind)
            .ok_or(TransportError::UnknownNetwork(net))?;
        transport.send(host, net, node, msg_type, payload)
    }

    /// Send to every peer on every network. Returns how many sends went out.
    pub fn broadcast(&mut self, host: &mut dyn BusHost, msg_type: MsgType, payload: &[u8]) -> usize {
        let mut sent = 0;
        for live in &self.nets {
            let Some(transport) = self.registry.get_mut(live.kind) else {
                continue;
            };
            for &node in &live.peers {
                match transport.send(host, live.net, node, msg_type, payload) {
                    Ok(SendOutcome::Sent) => sent += 1,
                    Ok(SendOutcome::Dropped) => {}
                    Err(e) => warn!(net = %live.net, %node, error = %e, "broadcast send failed"),
                }
            }
        }
        sent
    }

    pub fn status(&self) -> Vec<(NetId, PeerStatus)> {
        let mut out = Vec::new();
        for live in &self.nets {
            let Some(transport) = self.registry.get(live.kind) else {
                continue;
            };
            out.extend(
                live.peers
                    .iter()
                    .filter_map(|&node| transport.peer_status(live.net, node))
                    .map(|s| (live.net, s)),
            );
        }
        out
    }

    /// Unload every network. Connected peers are told where the transport supports it.
    pub fn shutdown(&mut self, host: &mut dyn BusHost) {
        for live in self.nets.drain(..) {
            let Some(transport) = self.registry.get_mut(live.kind) else {
                continue;
            };
            match transport.unload_net(host, live.net) {
                Ok(()) => info!(net = %live.net, "network down"),
                Err(e) => warn!(net = %live.net, error = %e, "unload failed"),
            }
        }
    }

    fn kind_of(&self, net: NetId) -> Result<TransportKind, TransportError> {
        self.nets
            .iter()
            .find(|n| n.net == net)
            .map(|n| n.kind)
            .ok_or(TransportError::UnknownNetwork(net))
    }
}

fn drain(
    budget: usize,
    net: NetId,
    host: &mut dyn BusHost,
    report: &mut TickReport,
    mut recv: impl FnMut(&mut dyn BusHost) -> Result<RecvOutcome, TransportError>,
) {
    for _ in 0..budget {
        match recv(&mut *host) {
            Ok(RecvOutcome::Message(msg)) => {
                report.delivered += 1;
                host.deliver(net, msg);
            }
            Ok(RecvOutcome::Handled) => {}
            Ok(RecvOutcome::Empty) => break,
            Err(e) => {
                report.errors += 1;
                warn!(%net, error = %e, "receive failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::thread::sleep;
    use std::time::Duration;

    use nodebus_core::{BusEvent, Timing};

    use crate::{DatagramTransport, StreamTransport};

    fn net(n: u32) -> NetId {
        NetId::new(n).unwrap()
    }

    fn record(net: u32, node: u32, transport: TransportKind, address: &str) -> EntryRecord {
        EntryRecord {
            net,
            node,
            transport,
            address: address.to_string(),
        }
    }

    fn node(local: u32) -> Node {
        let id = NodeId(local);
        let registry = TransportRegistry::new()
            .with(Box::new(StreamTransport::new(id, Timing::default())))
            .with(Box::new(DatagramTransport::new(id, Timing::default())));
        Node::new(id, registry)
    }

    /// Two distinct loopback UDP ports, released for the nodes to bind.
    fn free_udp_ports() -> (u16, u16) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
    }

    /// Tick until `host` has recorded `n` events, or ~1s passes.
    fn tick_until(node: &mut Node, host: &mut Vec<BusEvent>, n: usize) {
        for _ in 0..100 {
            node.tick(host);
            if host.len() >= n {
                return;
            }
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn load_skips_bad_entries_and_brings_up_the_rest() {
        let mut n = node(1);
        let report = n.load(&[
            record(0, 1, TransportKind::Stream, "127.0.0.1:0"),
            record(0, 2, TransportKind::Stream, "127.0.0.1:1"),
            record(1, 1, TransportKind::Datagram, "127.0.0.1:0"),
            record(2, 3, TransportKind::Stream, "no-port"),
            record(20, 3, TransportKind::Stream, "127.0.0.1:1"),
        ]);
        assert_eq!(report.up, vec![net(0), net(1)]);
        assert_eq!(
            report.rejected.iter().map(|f| f.entry).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(report.failed.is_empty());
        assert_eq!(n.status().len(), 1);
    }

    #[test]
    fn unregistered_transport_kind_fails_that_network() {
        let mut n = Node::new(
            NodeId(1),
            TransportRegistry::new().with(Box::new(StreamTransport::new(NodeId(1), Timing::default()))),
        );
        let report = n.load(&[record(4, 1, TransportKind::Datagram, "127.0.0.1:0")]);
        assert!(report.up.is_empty());
        assert!(matches!(
            report.failed.as_slice(),
            [(_, TransportError::Unsupported { op: "init_net", .. })]
        ));
    }

    #[test]
    fn send_to_unknown_network_is_an_error() {
        let mut n = node(1);
        let mut host: Vec<BusEvent> = Vec::new();
        assert!(matches!(
            n.send(&mut host, net(3), NodeId(2), MsgType::APP, b"x"),
            Err(TransportError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn datagram_nodes_connect_exchange_and_part() {
        let (p1, p2) = free_udp_ports();
        let entries = [
            record(0, 1, TransportKind::Datagram, &format!("127.0.0.1:{p1}")),
            record(0, 2, TransportKind::Datagram, &format!("127.0.0.1:{p2}")),
        ];
        let mut n1 = node(1);
        let mut n2 = node(2);
        assert_eq!(n1.load(&entries).up, vec![net(0)]);
        assert_eq!(n2.load(&entries).up, vec![net(0)]);

        let mut h1: Vec<BusEvent> = Vec::new();
        let mut h2: Vec<BusEvent> = Vec::new();
        // Node 1 announces; node 2 answers with a heartbeat.
        n1.tick(&mut h1);
        tick_until(&mut n2, &mut h2, 1);
        tick_until(&mut n1, &mut h1, 1);
        assert_eq!(h1, vec![BusEvent::Connected { net: net(0), node: NodeId(2) }]);
        assert_eq!(h2, vec![BusEvent::Connected { net: net(0), node: NodeId(1) }]);

        assert_eq!(n1.broadcast(&mut h1, MsgType::APP, b"hi all"), 1);
        tick_until(&mut n2, &mut h2, 2);
        match &h2[1] {
            BusEvent::Delivered { net: got, msg } => {
                assert_eq!(*got, net(0));
                assert_eq!(msg.payload, b"hi all");
            }
            other => panic!("expected delivery, got {other:?}"),
        }

        n1.shutdown(&mut h1);
        assert!(n1.networks().is_empty());
        tick_until(&mut n2, &mut h2, 3);
        assert_eq!(h2[2], BusEvent::Disconnected { net: net(0), node: NodeId(1) });
    }
}
