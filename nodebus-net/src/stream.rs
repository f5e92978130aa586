//! TCP stream transport: one listener per network, outbound dial to lower-ranked peers,
//! incremental frame reassembly per peer connection.
//!
//! Nothing here blocks: the listener and every peer socket are non-blocking, and an
//! outbound dial is bounded by `Timing::connect_timeout`.
//!
//! An inbound connection is matched to a peer by source IP. When several peers share that
//! IP the connection is parked until its first frame header arrives, and the header's
//! sender id picks the peer.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use nodebus_core::reassembly::{FrameReassembler, HeaderProgress, ReadOutcome, ReassemblyError};
use nodebus_core::{
    wire, BusHost, Clock, MsgType, NetId, NetworkDescriptor, NodeId, PeerEntry, PeerStatus,
    RecvOutcome, RecvScope, SendOutcome, SystemClock, Timing, Transport, TransportError,
    TransportKind, MAX_NETWORKS,
};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 16;
const MAX_UNCLAIMED: usize = 16;

/// Runtime state for one peer: live socket (if any), dial bookkeeping, partial inbound frame.
#[derive(Debug, Default)]
struct PeerConnection {
    socket: Option<TcpStream>,
    last_dial: Option<Instant>,
    dial_attempts: u64,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    rx: FrameReassembler,
}

impl PeerConnection {
    /// Returns true if the peer had no connection before. `rx` carries any bytes already read.
    fn install(&mut self, socket: TcpStream, rx: FrameReassembler) -> bool {
        let fresh = self.socket.is_none();
        self.socket = Some(socket);
        self.rx = rx;
        fresh
    }

    /// Returns true if a connection was closed.
    fn close(&mut self) -> bool {
        self.rx.reset();
        self.socket.take().is_some()
    }
}

/// Inbound connection from an IP several peers share, waiting for its first header.
struct Unclaimed {
    socket: TcpStream,
    from: SocketAddr,
    rx: FrameReassembler,
}

enum InboundMatch {
    Unknown,
    One(usize),
    Shared,
}

struct StreamNet {
    desc: NetworkDescriptor,
    listener: Option<TcpListener>,
    /// Parallel to `desc.peers()`.
    peers: Vec<PeerConnection>,
    unclaimed: Vec<Unclaimed>,
}

impl StreamNet {
    fn id(&self) -> NetId {
        self.desc.id()
    }

    fn peer_index(&self, node: NodeId) -> Result<usize, TransportError> {
        self.desc
            .peer_index(node)
            .ok_or(TransportError::UnknownPeer { net: self.id(), node })
    }

    /// Claim every queued inbound connection. Unknown source addresses are closed at once.
    fn accept_pending(&mut self, host: &mut dyn BusHost) -> usize {
        let net = self.desc.id();
        let mut claimed = 0;
        for (stream, from) in self.drain_listener() {
            if let Err(e) = stream.set_nonblocking(true) {
                warn!(%net, %from, error = %e, "could not make inbound socket non-blocking");
                continue;
            }
            match match_inbound(&self.desc, from) {
                InboundMatch::Unknown => {
                    warn!(%net, %from, "rejected connection from unconfigured address");
                }
                InboundMatch::One(idx) => {
                    self.attach(idx, stream, FrameReassembler::new(), from, host);
                    claimed += 1;
                }
                InboundMatch::Shared if self.unclaimed.len() >= MAX_UNCLAIMED => {
                    warn!(%net, %from, "too many unidentified connections, closing");
                }
                InboundMatch::Shared => {
                    debug!(%net, %from, "address shared by several peers, waiting for first header");
                    self.unclaimed.push(Unclaimed {
                        socket: stream,
                        from,
                        rx: FrameReassembler::new(),
                    });
                }
            }
        }
        claimed + self.identify_unclaimed(host)
    }

    fn drain_listener(&self) -> Vec<(TcpStream, SocketAddr)> {
        let mut out = Vec::new();
        let Some(listener) = &self.listener else {
            return out;
        };
        loop {
            match listener.accept() {
                Ok(pair) => out.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(net = %self.desc.id(), error = %e, "accept failed");
                    break;
                }
            }
        }
        out
    }

    // The header's sender must be a configured peer at the connection's source IP.
    fn identify_unclaimed(&mut self, host: &mut dyn BusHost) -> usize {
        let net = self.desc.id();
        let mut claimed = 0;
        for mut conn in std::mem::take(&mut self.unclaimed) {
            match conn.rx.read_header_from(&mut conn.socket) {
                Ok(HeaderProgress::Pending) => self.unclaimed.push(conn),
                Ok(HeaderProgress::Ready(header)) => {
                    let sender = header.sender;
                    match self.desc.peer_index(sender) {
                        Some(idx) if self.desc.peers()[idx].address.ip() == conn.from.ip() => {
                            self.attach(idx, conn.socket, conn.rx, conn.from, host);
                            claimed += 1;
                        }
                        _ => {
                            warn!(%net, from = %conn.from, %sender, "sender does not match source address, closing");
                        }
                    }
                }
                Ok(HeaderProgress::Closed) => {
                    debug!(%net, from = %conn.from, "unidentified connection closed");
                }
                Err(e) => {
                    warn!(%net, from = %conn.from, error = %e, "unidentified connection failed, closing");
                }
            }
        }
        claimed
    }

    fn attach(
        &mut self,
        idx: usize,
        socket: TcpStream,
        rx: FrameReassembler,
        from: SocketAddr,
        host: &mut dyn BusHost,
    ) {
        let net = self.desc.id();
        let node = self.desc.peers()[idx].node;
        if self.peers[idx].install(socket, rx) {
            info!(%net, %node, %from, "peer connected (inbound)");
            host.peer_connected(net, node);
        } else {
            info!(%net, %node, %from, "peer reconnected, replacing old socket");
        }
    }

    /// Make sure peer `idx` has a socket if one can be had right now. Returns whether it has one.
    fn ensure_socket(
        &mut self,
        idx: usize,
        now: Instant,
        timing: &Timing,
        host: &mut dyn BusHost,
    ) -> bool {
        self.accept_pending(host);
        if self.peers[idx].socket.is_some() {
            return true;
        }
        let net = self.desc.id();
        let entry = &self.desc.peers()[idx];
        if !entry.dials_out {
            return false;
        }
        let link = &mut self.peers[idx];
        if let Some(last) = link.last_dial {
            if now.saturating_duration_since(last) < timing.reconnect_cooldown {
                return false;
            }
        }
        link.dial_attempts += 1;
        debug!(%net, node = %entry.node, addr = %entry.address, attempt = link.dial_attempts, "dialing peer");
        match dial(entry.address, timing.connect_timeout) {
            Ok(stream) => {
                link.install(stream, FrameReassembler::new());
                info!(%net, node = %entry.node, addr = %entry.address, "peer connected (outbound)");
                host.peer_connected(net, entry.node);
                true
            }
            Err(e) => {
                link.last_dial = Some(now);
                debug!(%net, node = %entry.node, error = %e, "dial failed");
                false
            }
        }
    }

    fn drop_connection(&mut self, idx: usize, host: &mut dyn BusHost) {
        if self.peers[idx].close() {
            let net = self.desc.id();
            let node = self.desc.peers()[idx].node;
            info!(%net, %node, "peer disconnected");
            host.peer_disconnected(net, node);
        }
    }
}

fn match_inbound(desc: &NetworkDescriptor, from: SocketAddr) -> InboundMatch {
    let mut hits = desc
        .peers()
        .iter()
        .enumerate()
        .filter(|(_, peer)| peer.address.ip() == from.ip())
        .map(|(idx, _)| idx);
    match (hits.next(), hits.next()) {
        (None, _) => InboundMatch::Unknown,
        (Some(idx), None) => InboundMatch::One(idx),
        (Some(_), Some(_)) => InboundMatch::Shared,
    }
}

fn listen(addr: SocketAddr) -> Result<TcpListener, (&'static str, io::Error)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ("socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ("setsockopt", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ("set_nonblocking", e))?;
    socket.bind(&addr.into()).map_err(|e| ("bind", e))?;
    socket.listen(LISTEN_BACKLOG).map_err(|e| ("listen", e))?;
    Ok(socket.into())
}

fn dial(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout.max(Duration::from_millis(1)))?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// Write as much of the frame as the socket takes without blocking. Returns bytes written.
fn write_frame<W: Write>(socket: &mut W, frame: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < frame.len() {
        match socket.write(&frame[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// TCP transport. Network ids index directly into its arena.
pub struct StreamTransport<C: Clock = SystemClock> {
    local: NodeId,
    timing: Timing,
    clock: C,
    nets: Vec<Option<StreamNet>>,
}

impl StreamTransport<SystemClock> {
    pub fn new(local: NodeId, timing: Timing) -> Self {
        Self::with_clock(local, timing, SystemClock)
    }
}

impl<C: Clock> StreamTransport<C> {
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

    /// Bound listener address, once the network is up with a host entry.
    pub fn listen_addr(&self, net: NetId) -> Option<SocketAddr> {
        let snet = self.nets.get(net.index())?.as_ref()?;
        snet.listener.as_ref()?.local_addr().ok()
    }

    /// Claim queued inbound connections without touching any peer socket. Returns how many were installed.
    pub fn accept_pending(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
    ) -> Result<usize, TransportError> {
        Ok(self.net_mut(net)?.accept_pending(host))
    }

    fn net_mut(&mut self, net: NetId) -> Result<&mut StreamNet, TransportError> {
        self.nets
            .get_mut(net.index())
            .and_then(Option::as_mut)
            .ok_or(TransportError::UnknownNetwork(net))
    }
}

impl<C: Clock> Transport for StreamTransport<C> {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn recv_scope(&self) -> RecvScope {
        RecvScope::Peer
    }

    fn init_net(&mut self, desc: NetworkDescriptor) -> Result<(), TransportError> {
        let net = desc.id();
        if self.nets[net.index()].is_some() {
            return Err(TransportError::NetworkExists(net));
        }
        let listener = match desc.host() {
            Some(host) => {
                let listener = listen(host.address)
                    .map_err(|(op, source)| TransportError::Io { op, net, source })?;
                info!(%net, addr = %host.address, "listening");
                Some(listener)
            }
            None => None,
        };
        let peers = desc.peers().iter().map(|_| PeerConnection::default()).collect();
        info!(%net, peers = desc.peers().len(), "stream network up");
        self.nets[net.index()] = Some(StreamNet {
            desc,
            listener,
            peers,
            unclaimed: Vec::new(),
        });
        Ok(())
    }

    fn load_peer(&mut self, net: NetId, entry: PeerEntry) -> Result<(), TransportError> {
        let snet = self.net_mut(net)?;
        snet.desc.add_peer(entry)?;
        snet.peers.push(PeerConnection::default());
        Ok(())
    }

    fn send(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
        msg_type: MsgType,
        payload: &[u8],
    ) -> Result<SendOutcome, TransportError> {
        let frame = wire::encode_frame(msg_type, self.local, payload)?;
        let now = self.clock.now();
        let timing = self.timing;
        let snet = self.net_mut(net)?;
        let idx = snet.peer_index(node)?;
        if !snet.ensure_socket(idx, now, &timing, host) {
            debug!(%net, %node, "no connection, message dropped");
            return Ok(SendOutcome::Dropped);
        }
        let link = &mut snet.peers[idx];
        let Some(socket) = link.socket.as_mut() else {
            return Ok(SendOutcome::Dropped);
        };
        match write_frame(socket, &frame) {
            Ok(written) if written == frame.len() => {
                link.last_send = Some(now);
                Ok(SendOutcome::Sent)
            }
            Ok(0) => {
                debug!(%net, %node, "socket buffer full, message dropped");
                Ok(SendOutcome::Dropped)
            }
            Ok(written) => {
                // The peer now holds half a frame; the stream cannot be resynchronized.
                snet.drop_connection(idx, host);
                Err(TransportError::ShortWrite {
                    net,
                    node,
                    written,
                    expected: frame.len(),
                })
            }
            Err(source) => {
                snet.drop_connection(idx, host);
                Err(TransportError::Io {
                    op: "send",
                    net,
                    source,
                })
            }
        }
    }

    fn recv_from_peer(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
    ) -> Result<RecvOutcome, TransportError> {
        let now = self.clock.now();
        let timing = self.timing;
        let snet = self.net_mut(net)?;
        let idx = snet.peer_index(node)?;
        if !snet.ensure_socket(idx, now, &timing, host) {
            return Ok(RecvOutcome::Empty);
        }
        let PeerConnection {
            socket,
            rx,
            last_recv,
            ..
        } = &mut snet.peers[idx];
        let Some(stream) = socket.as_mut() else {
            return Ok(RecvOutcome::Empty);
        };
        match rx.read_from(stream) {
            Ok(ReadOutcome::Message(msg)) => {
                *last_recv = Some(now);
                Ok(RecvOutcome::Message(msg))
            }
            Ok(ReadOutcome::Pending) => Ok(RecvOutcome::Empty),
            Ok(ReadOutcome::Closed) => {
                snet.drop_connection(idx, host);
                Ok(RecvOutcome::Empty)
            }
            Err(ReassemblyError::Io(source)) => Err(TransportError::Io {
                op: "recv",
                net,
                source,
            }),
            Err(ReassemblyError::Frame(source)) => {
                snet.drop_connection(idx, host);
                Err(TransportError::Frame { net, source })
            }
        }
    }

    fn unload_peer(
        &mut self,
        host: &mut dyn BusHost,
        net: NetId,
        node: NodeId,
    ) -> Result<(), TransportError> {
        let snet = self.net_mut(net)?;
        let idx = snet.peer_index(node)?;
        snet.drop_connection(idx, host);
        snet.peers.remove(idx);
        snet.desc.remove_peer(node);
        Ok(())
    }

    fn unload_net(&mut self, host: &mut dyn BusHost, net: NetId) -> Result<(), TransportError> {
        let mut snet = self
            .nets
            .get_mut(net.index())
            .and_then(Option::take)
            .ok_or(TransportError::UnknownNetwork(net))?;
        for idx in 0..snet.peers.len() {
            snet.drop_connection(idx, host);
        }
        info!(%net, "stream network down");
        Ok(())
    }

    fn peer_status(&self, net: NetId, node: NodeId) -> Option<PeerStatus> {
        let snet = self.nets.get(net.index())?.as_ref()?;
        let link = &snet.peers[snet.desc.peer_index(node)?];
        Some(PeerStatus {
            node,
            connected: link.socket.is_some(),
            dial_attempts: link.dial_attempts,
            last_send: link.last_send,
            last_recv: link.last_recv,
        })
    }
}
