//! Datagram peer liveness: announce while disconnected, heartbeat while connected, time out on silence.
//! Host-driven: the transport feeds sends/receives and polls; the monitor answers with an action.

use std::time::{Duration, Instant};

use crate::config::Timing;

/// What the transport should do for a peer on this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    Idle,
    /// The peer just timed out; already marked disconnected. Notify the bus, send nothing.
    Disconnected,
    SendHeartbeat,
    SendAnnounce,
}

/// Per-peer liveness state.
#[derive(Debug, Clone, Default)]
pub struct PeerLiveness {
    connected: bool,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
}

impl PeerLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn last_recv(&self) -> Option<Instant> {
        self.last_recv
    }

    pub fn record_send(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    /// Any datagram from the peer. Returns true if this connected the peer.
    pub fn record_recv(&mut self, now: Instant) -> bool {
        self.last_recv = Some(now);
        let was = self.connected;
        self.connected = true;
        !was
    }

    /// Returns true if the peer was connected.
    pub fn mark_disconnected(&mut self) -> bool {
        let was = self.connected;
        self.connected = false;
        was
    }

    /// Periodic check. `announcer` is true when the local node is the side that announces.
    pub fn poll(&mut self, now: Instant, timing: &Timing, announcer: bool) -> LivenessAction {
        if self.connected {
            if older_than(self.last_recv, now, timing.peer_timeout) {
                self.connected = false;
                return LivenessAction::Disconnected;
            }
            if older_than(self.last_send, now, timing.heartbeat_interval) {
                return LivenessAction::SendHeartbeat;
            }
        } else if announcer && older_than(self.last_send, now, timing.announce_interval) {
            return LivenessAction::SendAnnounce;
        }
        LivenessAction::Idle
    }
}

// A timestamp never taken is infinitely old.
fn older_than(stamp: Option<Instant>, now: Instant, limit: Duration) -> bool {
    stamp.map_or(true, |t| now.saturating_duration_since(t) > limit)
}
