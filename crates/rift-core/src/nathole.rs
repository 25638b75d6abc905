//! Hole-punch session state shared by the coordinator and both peers.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Progress of one hole-punch attempt. Status only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PunchStatus {
    /// Visitor request accepted; waiting for the client's candidate.
    Initiated,
    /// Both candidates known and sent to both peers.
    CandidatesExchanged,
    /// The client reported a successful probe.
    DetectConfirmed,
    /// Peers exchanged traffic directly.
    Established,
    Failed,
}

impl PunchStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Initiated => 0,
            Self::CandidatesExchanged => 1,
            Self::DetectConfirmed => 2,
            Self::Established => 3,
            Self::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Failed)
    }
}

impl fmt::Display for PunchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::CandidatesExchanged => "candidates-exchanged",
            Self::DetectConfirmed => "detect-confirmed",
            Self::Established => "established",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Coordinator-side record of one attempt.
#[derive(Debug, Clone)]
pub struct HolePunchSession {
    pub sid: String,
    pub proxy_name: String,
    pub visitor_addr: SocketAddr,
    pub visitor_local_addr: String,
    pub client_addr: Option<SocketAddr>,
    pub client_local_addr: String,
    pub status: PunchStatus,
    pub created_at: Instant,
}

impl HolePunchSession {
    pub fn new(sid: String, proxy_name: String, visitor_addr: SocketAddr) -> Self {
        Self {
            sid,
            proxy_name,
            visitor_addr,
            visitor_local_addr: String::new(),
            client_addr: None,
            client_local_addr: String::new(),
            status: PunchStatus::Initiated,
            created_at: Instant::now(),
        }
    }

    /// Move to `next` if that is forward progress. Returns whether the status changed.
    ///
    /// Any non-terminal state may fail; nothing leaves a terminal state.
    pub fn advance(&mut self, next: PunchStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if next == PunchStatus::Failed || next.rank() > self.status.rank() {
            self.status = next;
            return true;
        }
        false
    }
}

/// Result reported to whoever asked for a punch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PunchOutcome {
    Established { sid: String, peer: SocketAddr },
    Failed { sid: String, reason: String },
}

impl PunchOutcome {
    pub fn sid(&self) -> &str {
        match self {
            Self::Established { sid, .. } | Self::Failed { sid, .. } => sid,
        }
    }
}
