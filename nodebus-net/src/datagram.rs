//! UDP datagram transport: one bound socket per network, one frame per datagram,
//! liveness inferred from traffic (announce / heartbeat / timeout).

use std::io;
use std::net::{SocketAddr, UdpSocket};

use nodebus_core::{
    wire, BusHost, Clock, ConfigError, LivenessAction, MsgType, NetId, NetworkDescriptor, NodeId,
    PeerEntry, PeerLiveness, PeerStatus, RecvOutcome, RecvScope, SendOutcome, SystemClock, Timing,
    Transport, TransportError, TransportKind, HEADER_SIZE, MAX_BODY_SIZE, MAX_NETWORKS,
};
use tracing::{debug, info, warn};

// One byte past the largest legal frame, so an oversized datagram shows up as trailing bytes
// instead of being silently truncated by the kernel.
const RECV_BUF_SIZE: usize = HEADER_SIZE + MAX_BODY_SIZE + 1;

struct DatagramNet {
    desc: NetworkDescriptor,
    socket: UdpSocket,
    /// Parallel to `desc.peers()`.
    peers: Vec<PeerLiveness>,
    buf: Vec<u8>,
}

impl DatagramNet {
    fn peer_index(&self, node: NodeId) -> Result<usize, TransportError> {
        self.desc.peer_index(node).ok_or(TransportError::UnknownPeer {
            net: self.desc.id(),
            node,
        })
    }
}

/// UDP transport. Network ids index directly into its arena.
pub struct DatagramTransport<C: Clock = SystemClock> {
    local: NodeId,
    timing: Timing,
    clock: C,
    nets: Vec<Option<DatagramNet>>,
}

impl DatagramTransport<SystemClock> {
    pub fn new(local: NodeId, timing: Timing) -> Self {
        Self::with_clock(local, timing, SystemClock)
    }
}

impl<C: Clock> DatagramTransport<C> {
    pub fn with_clock(local: NodeId, timing: Timing, clock: C) -> Self {
        Self {
            local,
            timing,
            clock,
            nets: (0..MAX_NETWORKS).map(|_| None).collect(),
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Address the network's socket is bound to.
    pub fn local_addr(&self, net: NetId) -> Option<SocketAddr> {
        let dnet = self.nets.get(net.index())?.as_ref()?;
        dnet.socket.local_addr().ok()
    }

    fn net_mut(&mut self, net: NetId) -> Result<&mut DatagramNet, TransportError> {
        self.nets
            .get_mut(net.index())
            .and_then(Option::as_mut)
            .ok_or(TransportError::UnknownNetwork(net))
    }

    fn send_control(&mut self, host: &mut dyn BusHost, net: NetId, node: NodeId, msg_type: MsgType) {
        if let Err(e) = self.send(host, net, node, msg_type, &[]) {
            warn!(%net, %node, msg_type = %msg_type, error = %e, "control datagram not sent");
        }
    }

    // Best-effort disconnect marker, then local state and notification.
    fn disconnect_peer(&mut self, host: &mut dyn BusHost, net: NetId, node: NodeId) -> Result<(), TransportError> {
        let dnet = self.net_mut(net)?;
        let idx = dnet.peer_index(node)?;
        if !dnet.peers[idx].is_connected() {
            return Ok(());
        }
        self.send_control(host, net, node, MsgType::DISCONNECT);
        let dnet = self.net_mut(net)?;
        dnet.peers[idx].mark_disconnected();
        info!(%net, %node, "peer disconnected (unloaded)");
        host.peer_disconnected(net, node);
        Ok(())
    }
}

impl<C: Clock> Transport for DatagramTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn recv_scope(&self) -> RecvScope {
        RecvScope::Network
    }

    fn init_net(&mut self, desc: NetworkDescriptor) -> Result<(), TransportError> {
        let net = desc.id();
        if self.nets[net.index()].is_some() {
            return Err(TransportError::NetworkExists(net));
        }
        let bind_addr = desc
            .host()
            .map(|h| h.address)
            .ok_or(ConfigError::MissingHost(net))?;
        let socket = UdpSocket::bind(bind_addr).map_err(|source| TransportError::Io {
            op: "bind",
            net,
            source,
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| TransportError::Io {
                op: "set_nonblocking",
                net,
                source,
            })?;
        info!(%net, addr = %bind_addr, peers = desc.peers().len(), "datagram network up");
        let peers = desc.peers().iter().map(|_| PeerLiveness::new()).collect();
        self.nets[net.index()] = Some(DatagramNet {
            desc,
            socket,
            peers,
            buf: vec![0u8; RECV_BUF_SIZE],
        });
        Ok(())
    }

    fn load_peer(&mut self, net: NetId, entry: PeerEntry) -> Result<(), TransportError> {
        let dnet = self.net_mut(net)?;
        dnet.desc.add_peer(entry)?;
        dnet.peers.push(PeerLiveness::new());
        Ok(())
    }

    fn poll_peer(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
    ) -> Result<(), TransportError> {
        let now = self.clock.now();
        let timing = self.timing;
        let announcer = self.local.announces_to(node);
        let dnet = self.net_mut(net)?;
        let idx = dnet.peer_index(node)?;
        match dnet.peers[idx].poll(now, &timing, announcer) {
            LivenessAction::Idle => {}
            LivenessAction::Disconnected => {
                info!(%net, %node, "peer timed out");
                host.peer_disconnected(net, node);
            }
            LivenessAction::SendHeartbeat => {
                debug!(%net, %node, "heartbeat");
                self.send(host, net, node, MsgType::HEARTBEAT, &[])?;
            }
            LivenessAction::SendAnnounce => {
                debug!(%net, %node, "announce");
                self.send(host, net, node, MsgType::ANNOUNCE, &[])?;
            }
        }
        Ok(())
    }

    fn send(
        &mut self,
        _host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
        msg_type: MsgType,
        payload: &[u8],
    ) -> Result<SendOutcome, TransportError> {
        let frame = wire::encode_frame(msg_type, self.local, payload)?;
        let now = self.clock.now();
        let dnet = self.net_mut(net)?;
        let idx = dnet.peer_index(node)?;
        let addr = dnet.desc.peers()[idx].address;
        match dnet.socket.send_to(&frame, addr) {
            Ok(_) => {
                dnet.peers[idx].record_send(now);
                Ok(SendOutcome::Sent)
            }
            Err(source) => {
                warn!(%net, %node, %addr, error = %source, "send_to failed");
                Err(TransportError::Io {
                    op: "send_to",
                    net,
                    source,
                })
            }
        }
    }

    fn recv_from_net(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
    ) -> Result<RecvOutcome, TransportError> {
        let now = self.clock.now();
        let dnet = self.net_mut(net)?;
        let len = match dnet.socket.recv_from(&mut dnet.buf) {
            Ok((len, _from)) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(RecvOutcome::Empty)
            }
            Err(source) => {
                return Err(TransportError::Io {
                    op: "recv_from",
                    net,
                    source,
                })
            }
        };
        let msg = wire::decode_datagram(&dnet.buf[..len])
            .map_err(|source| TransportError::Frame { net, source })?;
        let node = msg.sender;
        let idx = dnet
            .desc
            .peer_index(node)
            .ok_or(TransportError::UnknownSender { net, node })?;
        let liveness = &mut dnet.peers[idx];

        // Any datagram proves the peer is up, a DISCONNECT marker included.
        if liveness.record_recv(now) {
            info!(%net, %node, "peer connected");
            host.peer_connected(net, node);
        }
        if msg.msg_type == MsgType::DISCONNECT {
            liveness.mark_disconnected();
            info!(%net, %node, "peer disconnected");
            host.peer_disconnected(net, node);
            return Ok(RecvOutcome::Handled);
        }
        if msg.msg_type.is_liveness() {
            Ok(RecvOutcome::Handled)
        } else {
            Ok(RecvOutcome::Message(msg))
        }
    }

    fn unload_peer(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
    ) -> Result<(), TransportError> {
        self.disconnect_peer(host, net, node)?;
        let dnet = self.net_mut(net)?;
        if let Some(idx) = dnet.desc.peer_index(node) {
            dnet.peers.remove(idx);
            dnet.desc.remove_peer(node);
        }
        Ok(())
    }

    fn unload_net(&mut self, host: &mut dyn BusHost, net: NetId) -> Result<(), TransportError> {
        let nodes: Vec<NodeId> = self
            .net_mut(net)?
            .desc
            .peers()
            .iter()
            .map(|p| p.node)
            .collect();
        // Markers go out before the socket closes.
        for node in nodes {
            self.disconnect_peer(host, net, node)?;
        }
        self.nets[net.index()] = None;
        info!(%net, "datagram network down");
        Ok(())
    }

    fn peer_status(&self, net: NetId, node: NodeId) -> Option<PeerStatus> {
        let dnet = self.nets.get(net.index())?.as_ref()?;
        let liveness = &dnet.peers[dnet.desc.peer_index(node)?];
        Some(PeerStatus {
            node,
            connected: liveness.is_connected(),
            dial_attempts: 0,
            last_send: liveness.last_send(),
            last_recv: liveness.last_recv(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    use nodebus_core::{BusEvent, HostEntry, ManualClock};

    type Node = DatagramTransport<ManualClock>;

    fn net0() -> NetId {
        NetId::new(0).unwrap()
    }

    fn loopback0() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn bound(local: u32, clock: &ManualClock) -> Node {
        let mut t = DatagramTransport::with_clock(NodeId(local), Timing::default(), clock.clone());
        let desc = NetworkDescriptor::new(net0())
            .with_host(HostEntry {
                net: net0(),
                node: NodeId(local),
                address: loopback0(),
            })
            .unwrap();
        t.init_net(desc).unwrap();
        t
    }

    fn link(a: &mut Node, b: &mut Node) {
        let a_addr = a.local_addr(net0()).unwrap();
        let b_addr = b.local_addr(net0()).unwrap();
        a.load_peer(net0(), PeerEntry::new(a.local(), net0(), b.local(), b_addr))
            .unwrap();
        b.load_peer(net0(), PeerEntry::new(b.local(), net0(), a.local(), a_addr))
            .unwrap();
    }

    /// Receive until something other than `Empty` shows up, or give up after ~500ms.
    fn recv_next(t: &mut Node, events: &mut Vec<BusEvent>) -> Result<RecvOutcome, TransportError> {
        for _ in 0..100 {
            match t.recv_from_net(events, net0()) {
                Ok(RecvOutcome::Empty) => sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
        Ok(RecvOutcome::Empty)
    }

    fn connected_pair(clock: &ManualClock) -> (Node, Node, Vec<BusEvent>, Vec<BusEvent>) {
        let mut a = bound(1, clock);
        let mut b = bound(2, clock);
        link(&mut a, &mut b);
        let (mut ev_a, mut ev_b) = (Vec::new(), Vec::new());
        a.poll_peer(&mut ev_a, net0(), NodeId(2)).unwrap();
        assert_eq!(recv_next(&mut b, &mut ev_b).unwrap(), RecvOutcome::Handled);
        b.poll_peer(&mut ev_b, net0(), NodeId(1)).unwrap();
        assert_eq!(recv_next(&mut a, &mut ev_a).unwrap(), RecvOutcome::Handled);
        (a, b, ev_a, ev_b)
    }

    #[test]
    fn announce_then_heartbeat_connects_both_sides() {
        let clock = ManualClock::new();
        let (a, b, ev_a, ev_b) = connected_pair(&clock);
        assert_eq!(ev_a, vec![BusEvent::Connected { net: net0(), node: NodeId(2) }]);
        assert_eq!(ev_b, vec![BusEvent::Connected { net: net0(), node: NodeId(1) }]);
        assert!(a.peer_status(net0(), NodeId(2)).unwrap().connected);
        assert!(b.peer_status(net0(), NodeId(1)).unwrap().connected);
    }

    #[test]
    fn higher_rank_does_not_announce() {
        let clock = ManualClock::new();
        let mut a = bound(1, &clock);
        let mut b = bound(2, &clock);
        link(&mut a, &mut b);
        let mut events = Vec::new();
        b.poll_peer(&mut events, net0(), NodeId(1)).unwrap();
        assert!(b.peer_status(net0(), NodeId(1)).unwrap().last_send.is_none());
        a.poll_peer(&mut events, net0(), NodeId(2)).unwrap();
        assert!(a.peer_status(net0(), NodeId(2)).unwrap().last_send.is_some());
    }

    #[test]
    fn app_message_is_delivered_and_connects() {
        let clock = ManualClock::new();
        let mut a = bound(1, &clock);
        let mut b = bound(2, &clock);
        link(&mut a, &mut b);
        let mut events = Vec::new();
        assert_eq!(
            a.send(&mut events, net0(), NodeId(2), MsgType::APP, b"hello").unwrap(),
            SendOutcome::Sent
        );
        match recv_next(&mut b, &mut events).unwrap() {
            RecvOutcome::Message(m) => {
                assert_eq!(m.sender, NodeId(1));
                assert_eq!(m.msg_type, MsgType::APP);
                assert_eq!(m.payload, b"hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(events, vec![BusEvent::Connected { net: net0(), node: NodeId(1) }]);
    }

    #[test]
    fn silence_times_out_exactly_once() {
        let clock = ManualClock::new();
        let (_a, mut b, _, mut ev_b) = connected_pair(&clock);
        ev_b.clear();
        clock.advance(Duration::from_secs(11));
        for _ in 0..5 {
            b.poll_peer(&mut ev_b, net0(), NodeId(1)).unwrap();
            clock.advance(Duration::from_secs(3));
        }
        assert_eq!(ev_b, vec![BusEvent::Disconnected { net: net0(), node: NodeId(1) }]);
        assert!(!b.peer_status(net0(), NodeId(1)).unwrap().connected);
    }

    #[test]
    fn unknown_sender_is_rejected_without_state_change() {
        let clock = ManualClock::new();
        let mut a = bound(1, &clock);
        let mut b = bound(2, &clock);
        link(&mut a, &mut b);
        let raw = UdpSocket::bind(loopback0()).unwrap();
        let frame = wire::encode_frame(MsgType::APP, NodeId(9), b"who").unwrap();
        raw.send_to(&frame, b.local_addr(net0()).unwrap()).unwrap();

        let mut events = Vec::new();
        assert!(matches!(
            recv_next(&mut b, &mut events),
            Err(TransportError::UnknownSender { node: NodeId(9), .. })
        ));
        assert!(events.is_empty());
        assert!(!b.peer_status(net0(), NodeId(1)).unwrap().connected);
    }

    #[test]
    fn malformed_datagram_is_rejected() {
        let clock = ManualClock::new();
        let mut b = bound(2, &clock);
        let raw = UdpSocket::bind(loopback0()).unwrap();
        raw.send_to(&[1, 2, 3], b.local_addr(net0()).unwrap()).unwrap();
        let mut events = Vec::new();
        assert!(matches!(
            recv_next(&mut b, &mut events),
            Err(TransportError::Frame { .. })
        ));
    }

    #[test]
    fn unload_peer_tells_the_other_side() {
        let clock = ManualClock::new();
        let (mut a, mut b, mut ev_a, mut ev_b) = connected_pair(&clock);
        ev_a.clear();
        ev_b.clear();

        a.unload_peer(&mut ev_a, net0(), NodeId(2)).unwrap();
        assert_eq!(ev_a, vec![BusEvent::Disconnected { net: net0(), node: NodeId(2) }]);
        assert!(a.peer_status(net0(), NodeId(2)).is_none());

        assert_eq!(recv_next(&mut b, &mut ev_b).unwrap(), RecvOutcome::Handled);
        assert_eq!(ev_b, vec![BusEvent::Disconnected { net: net0(), node: NodeId(1) }]);
    }

    #[test]
    fn disconnect_from_disconnected_peer_connects_then_disconnects() {
        let clock = ManualClock::new();
        let mut a = bound(1, &clock);
        let mut b = bound(2, &clock);
        link(&mut a, &mut b);
        let mut sent: Vec<BusEvent> = Vec::new();
        a.send(&mut sent, net0(), NodeId(2), MsgType::DISCONNECT, &[]).unwrap();
        let mut events = Vec::new();
        assert_eq!(recv_next(&mut b, &mut events).unwrap(), RecvOutcome::Handled);
        assert_eq!(
            events,
            vec![
                BusEvent::Connected { net: net0(), node: NodeId(1) },
                BusEvent::Disconnected { net: net0(), node: NodeId(1) },
            ]
        );
        let status = b.peer_status(net0(), NodeId(1)).unwrap();
        assert!(!status.connected);
        assert!(status.last_recv.is_some());
    }

    #[test]
    fn network_without_host_entry_is_rejected() {
        let mut t = DatagramTransport::new(NodeId(1), Timing::default());
        let err = t.init_net(NetworkDescriptor::new(net0())).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Config(ConfigError::MissingHost(_))
        ));
        let mut events: Vec<BusEvent> = Vec::new();
        assert!(matches!(
            t.recv_from_net(&mut events, net0()),
            Err(TransportError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn unload_net_closes_socket() {
        let clock = ManualClock::new();
        let (mut a, _b, mut ev_a, _) = connected_pair(&clock);
        a.unload_net(&mut ev_a, net0()).unwrap();
        assert!(a.local_addr(net0()).is_none());
        assert_eq!(
            ev_a.last(),
            Some(&BusEvent::Disconnected { net: net0(), node: NodeId(2) })
        );
    }
}
