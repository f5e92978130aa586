//! Two nodes on loopback, driven the way the daemon drives them.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread::sleep;
use std::time::Duration;

use nodebus_core::{
    encode_frame, BusEvent, EntryRecord, HostEntry, MsgType, NetId, NetworkDescriptor, NodeId,
    PeerEntry, RecvOutcome, Timing, Transport, TransportKind, TransportRegistry,
};
use nodebus_net::{Node, StreamTransport};

fn net0() -> NetId {
    NetId::new(0).unwrap()
}

fn pause() {
    sleep(Duration::from_millis(50));
}

#[test]
fn frame_split_across_reads_is_reassembled() {
    let mut node1 = StreamTransport::new(NodeId(1), Timing::default());
    let desc = NetworkDescriptor::new(net0())
        .with_host(HostEntry {
            net: net0(),
            node: NodeId(1),
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
        })
        .unwrap()
        .with_peer(PeerEntry::new(
            NodeId(1),
            net0(),
            NodeId(2),
            SocketAddr::from(([127, 0, 0, 1], 7000)),
        ))
        .unwrap();
    node1.init_net(desc).unwrap();

    // Node 2 is played by a raw socket writing one 17-byte frame in three pieces.
    let mut node2 = TcpStream::connect(node1.listen_addr(net0()).unwrap()).unwrap();
    let frame = encode_frame(MsgType::APP, NodeId(2), b"0123456789").unwrap();
    assert_eq!(frame.len(), 17);

    let mut events: Vec<BusEvent> = Vec::new();
    let mut outcomes = Vec::new();
    for chunk in [&frame[..3], &frame[3..12], &frame[12..]] {
        node2.write_all(chunk).unwrap();
        pause();
        outcomes.push(node1.recv_from_peer(&mut events, net0(), NodeId(2)).unwrap());
    }

    assert_eq!(outcomes[0], RecvOutcome::Empty);
    assert_eq!(outcomes[1], RecvOutcome::Empty);
    match &outcomes[2] {
        RecvOutcome::Message(m) => {
            assert_eq!(m.msg_type, MsgType::APP);
            assert_eq!(m.sender, NodeId(2));
            assert_eq!(m.payload, b"0123456789");
        }
        other => panic!("expected the frame, got {other:?}"),
    }
    assert_eq!(
        events,
        vec![BusEvent::Connected {
            net: net0(),
            node: NodeId(2)
        }]
    );
}

fn stream_node(local: u32) -> Node {
    let id = NodeId(local);
    Node::new(
        id,
        TransportRegistry::new().with(Box::new(StreamTransport::new(id, Timing::default()))),
    )
}

fn entry(node: u32, port: u16) -> EntryRecord {
    EntryRecord {
        net: 0,
        node,
        transport: TransportKind::Stream,
        address: format!("127.0.0.1:{port}"),
    }
}

#[test]
fn stream_nodes_talk_through_the_driver() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    // Node 1 listens; node 2 outranks it and dials.
    let entries = [entry(1, port), entry(2, 0)];
    let mut n1 = stream_node(1);
    let mut n2 = stream_node(2);
    assert_eq!(n1.load(&entries).up, vec![net0()]);
    assert_eq!(n2.load(&entries).up, vec![net0()]);

    let mut h1: Vec<BusEvent> = Vec::new();
    let mut h2: Vec<BusEvent> = Vec::new();
    n2.tick(&mut h2);
    assert_eq!(h2, vec![BusEvent::Connected { net: net0(), node: NodeId(1) }]);

    n2.send(&mut h2, net0(), NodeId(1), MsgType::APP, b"hello node 1")
        .unwrap();
    pause();
    let report = n1.tick(&mut h1);
    assert_eq!(report.delivered, 1);
    assert_eq!(h1[0], BusEvent::Connected { net: net0(), node: NodeId(2) });
    match &h1[1] {
        BusEvent::Delivered { msg, .. } => assert_eq!(msg.payload, b"hello node 1"),
        other => panic!("expected delivery, got {other:?}"),
    }

    n2.shutdown(&mut h2);
    pause();
    n1.tick(&mut h1);
    assert_eq!(
        h1.last(),
        Some(&BusEvent::Disconnected { net: net0(), node: NodeId(2) })
    );
    assert!(!n1.status()[0].1.connected);
}
