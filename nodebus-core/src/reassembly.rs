//! Incremental frame reassembly for byte-stream transports.
//!
//! A frame arrives in arbitrary-sized pieces. The reassembler collects exactly
//! `HEADER_SIZE` bytes, learns the body length from the completed header, then
//! collects exactly that many body bytes. It never reads past the end of the
//! current frame, so bytes of the next frame stay in the source.
//!
//! One [`FrameReassembler::read_from`] call performs at most one read per phase:
//! a call that completes the header re-checks the phase and goes straight on to
//! the body, so a single call can take a frame from nothing to fully decoded.

use std::io::{self, Read};

use crate::protocol::{Message, HEADER_SIZE};
use crate::wire::{self, FrameDecodeError, Header};

/// Which part of the frame is being collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvPhase {
    AwaitingHeader,
    AwaitingBody(Header),
}

/// Result of one read step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame was decoded; the reassembler is back to `AwaitingHeader`.
    Message(Message),
    /// No data ready, or the current phase is still short. Partial state is kept.
    Pending,
    /// The source reported end of stream.
    Closed,
}

/// Result of a header-only read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProgress {
    Ready(Header),
    Pending,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("bad frame header: {0}")]
    Frame(#[from] FrameDecodeError),
}

/// Per-connection receive buffer with a two-phase state machine.
#[derive(Debug)]
pub struct FrameReassembler {
    phase: RecvPhase,
    buf: Vec<u8>,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self {
            phase: RecvPhase::AwaitingHeader,
            buf: Vec::with_capacity(HEADER_SIZE),
        }
    }

    pub fn phase(&self) -> RecvPhase {
        self.phase
    }

    /// Bytes of the current frame received so far (header included).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame, e.g. when the underlying connection is replaced.
    pub fn reset(&mut self) {
        self.phase = RecvPhase::AwaitingHeader;
        self.buf.clear();
    }

    /// Advance only as far as the end of the current header. Body bytes stay in the source.
    pub fn read_header_from<R: Read>(
        &mut self,
        src: &mut R,
    ) -> Result<HeaderProgress, ReassemblyError> {
        if let RecvPhase::AwaitingBody(header) = self.phase {
            return Ok(HeaderProgress::Ready(header));
        }
        match self.fill_to(src, HEADER_SIZE)? {
            Fill::Complete => {
                let header = wire::decode_header(&self.buf)?;
                self.phase = RecvPhase::AwaitingBody(header);
                Ok(HeaderProgress::Ready(header))
            }
            Fill::Short => Ok(HeaderProgress::Pending),
            Fill::Eof => Ok(HeaderProgress::Closed),
        }
    }

    /// Advance using a non-blocking source. `WouldBlock` from the source means "not ready".
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<ReadOutcome, ReassemblyError> {
        let header = match self.read_header_from(src)? {
            HeaderProgress::Ready(header) => header,
            HeaderProgress::Pending => return Ok(ReadOutcome::Pending),
            HeaderProgress::Closed => return Ok(ReadOutcome::Closed),
        };
        match self.fill_to(src, HEADER_SIZE + header.body_len())? {
            Fill::Complete => {
                let msg = Message {
                    msg_type: header.msg_type,
                    sender: header.sender,
                    payload: self.buf[HEADER_SIZE..].to_vec(),
                };
                self.reset();
                Ok(ReadOutcome::Message(msg))
            }
            Fill::Short => Ok(ReadOutcome::Pending),
            Fill::Eof => Ok(ReadOutcome::Closed),
        }
    }

    // One read of at most `target - buffered` bytes. The buffer never grows past `target`.
    fn fill_to<R: Read>(&mut self, src: &mut R, target: usize) -> io::Result<Fill> {
        let start = self.buf.len();
        if start >= target {
            return Ok(Fill::Complete);
        }
        self.buf.resize(target, 0);
        let read = loop {
            match src.read(&mut self.buf[start..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match read {
            Ok(0) => {
                self.buf.truncate(start);
                Ok(Fill::Eof)
            }
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(if start + n == target {
                    Fill::Complete
                } else {
                    Fill::Short
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.buf.truncate(start);
                Ok(Fill::Short)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }
}

enum Fill {
    Complete,
    Short,
    Eof,
}
