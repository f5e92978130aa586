//! Framing: packed 7-byte big-endian header (body length, type, sender) + body.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::protocol::{Message, MsgType, HEADER_SIZE, MAX_BODY_SIZE};

/// Wire header. Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub body_len: u16,
    pub msg_type: MsgType,
    pub sender: NodeId,
}

impl Header {
    pub fn body_len(&self) -> usize {
        self.body_len as usize
    }
}

// Fixed-width integers in network byte order; no length prefixes for plain structs.
fn header_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Encode a message into a single frame: header followed by `payload`.
pub fn encode_frame(
    msg_type: MsgType,
    sender: NodeId,
    payload: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.len() > MAX_BODY_SIZE {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let header = Header {
        body_len: payload.len() as u16,
        msg_type,
        sender,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    header_codec().serialize_into(&mut out, &header)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame (bincode or body size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("body of {0} bytes exceeds {MAX_BODY_SIZE}")]
    TooLarge(usize),
}

/// Decode the header at the front of `bytes`. Rejects bodies over `MAX_BODY_SIZE`.
pub fn decode_header(bytes: &[u8]) -> Result<Header, FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let header: Header = header_codec().deserialize(&bytes[..HEADER_SIZE])?;
    if header.body_len() > MAX_BODY_SIZE {
        return Err(FrameDecodeError::TooLarge(header.body_len()));
    }
    Ok(header)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if the frame is not complete yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let header = decode_header(bytes)?;
    let end = HEADER_SIZE + header.body_len();
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = Message {
        msg_type: header.msg_type,
        sender: header.sender,
        payload: bytes[HEADER_SIZE..end].to_vec(),
    };
    Ok((msg, end))
}

/// Decode a datagram that must hold exactly one frame.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    match decode_frame(bytes) {
        Ok((msg, used)) if used == bytes.len() => Ok(msg),
        Ok((_, used)) => Err(FrameDecodeError::TrailingBytes(bytes.len() - used)),
        Err(FrameDecodeError::NeedMore) => Err(FrameDecodeError::Truncated(bytes.len())),
        Err(e) => Err(e),
    }
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("declared body of {0} bytes exceeds {MAX_BODY_SIZE}")]
    TooLarge(usize),
    #[error("datagram of {0} bytes is shorter than its frame")]
    Truncated(usize),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
