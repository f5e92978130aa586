//! nodebus socket transports (TCP stream, UDP datagram), the poll-driven node, and daemon config.

pub mod config;
pub mod datagram;
pub mod node;
pub mod stream;

pub use datagram::DatagramTransport;
pub use node::{LoadReport, Node, TickReport};
pub use stream::StreamTransport;
