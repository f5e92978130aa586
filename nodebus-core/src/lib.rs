//! nodebus transport core.
//! No I/O: wire codec, stream reassembly and liveness state machines, configuration records,
//! and the `Transport` interface the socket implementations in `nodebus-net` fill in.

pub mod clock;
pub mod config;
pub mod host;
pub mod identity;
pub mod liveness;
pub mod protocol;
pub mod reassembly;
pub mod transport;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    build_networks, parse_address, parse_stream_address, ConfigError, EntryFailure, EntryRecord,
    HostEntry, NetworkDescriptor, PeerEntry, Role, Timing,
};
pub use host::{BusEvent, BusHost};
pub use identity::{NetId, NodeId, MAX_NETWORKS};
pub use liveness::{LivenessAction, PeerLiveness};
pub use protocol::{Message, MsgType, HEADER_SIZE, MAX_BODY_SIZE};
pub use reassembly::{FrameReassembler, HeaderProgress, ReadOutcome, ReassemblyError, RecvPhase};
pub use transport::{
    PeerStatus, RecvOutcome, RecvScope, SendOutcome, Transport, TransportError, TransportKind,
    TransportRegistry,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, Header};
