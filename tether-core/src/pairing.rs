//! Per-link pairing handshake.
//! No I/O: the owning device passes events and current time, and performs the returned actions.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::packet::Packet;
use crate::protocol::PACKET_TYPE_PAIR;

pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    RequestedByMe,
    RequestedByPeer,
    Paired,
}

impl PairState {
    pub fn is_requested(self) -> bool {
        matches!(self, PairState::RequestedByMe | PairState::RequestedByPeer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing timed out")]
    Timeout,
    #[error("pairing rejected")]
    Rejected,
}

/// Action for the owning device to perform.
#[derive(Debug, Clone)]
pub enum PairingAction {
    /// Send a pairing control packet on this handler's link.
    Send(Packet),
    /// The handshake completed; the device becomes trusted.
    Trusted,
    /// The peer unpaired us.
    Untrusted,
    /// The peer asked to pair; surface it so the user can accept or reject.
    IncomingRequest,
    Failed(PairingError),
    /// Call `check_deadline` at this instant.
    ArmDeadline(Instant),
}

/// Build a pairing control packet: `{"pair": true}` requests or accepts, `false` rejects or unpairs.
pub fn pair_packet(pair: bool) -> Packet {
    Packet::new(PACKET_TYPE_PAIR).with_field("pair", pair)
}

#[derive(Debug, Clone)]
pub struct PairingHandler {
    state: PairState,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl PairingHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: PairState::Unpaired,
            deadline: None,
            timeout,
        }
    }

    /// Handler for a link of a device that is already trusted.
    pub fn paired(timeout: Duration) -> Self {
        Self {
            state: PairState::Paired,
            ..Self::new(timeout)
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn transition(&mut self, to: PairState) {
        if self.state != to {
            debug!(from = ?self.state, to = ?to, "pairing state");
            self.state = to;
        }
        if !to.is_requested() {
            self.deadline = None;
        }
    }

    fn arm(&mut self, now: Instant) -> PairingAction {
        let deadline = now + self.timeout;
        self.deadline = Some(deadline);
        PairingAction::ArmDeadline(deadline)
    }

    pub fn request_pair(&mut self, now: Instant) -> Vec<PairingAction> {
        match self.state {
            PairState::RequestedByPeer => self.accept_pairing(),
            PairState::Unpaired => {
                self.transition(PairState::RequestedByMe);
                vec![PairingAction::Send(pair_packet(true)), self.arm(now)]
            }
            PairState::RequestedByMe | PairState::Paired => Vec::new(),
        }
    }

    pub fn accept_pairing(&mut self) -> Vec<PairingAction> {
        if self.state != PairState::RequestedByPeer {
            return Vec::new();
        }
        self.transition(PairState::Paired);
        vec![PairingAction::Send(pair_packet(true)), PairingAction::Trusted]
    }

    pub fn reject_pairing(&mut self) -> Vec<PairingAction> {
        if !self.state.is_requested() {
            return Vec::new();
        }
        self.transition(PairState::Unpaired);
        vec![
            PairingAction::Send(pair_packet(false)),
            PairingAction::Failed(PairingError::Rejected),
        ]
    }

    /// Handle an inbound `tether.pair` packet. A packet without a boolean `pair` field is ignored.
    pub fn receive_packet(&mut self, packet: &Packet, now: Instant) -> Vec<PairingAction> {
        let Some(pair) = packet.get::<bool>("pair") else {
            debug!("pairing packet without pair field");
            return Vec::new();
        };
        match (pair, self.state) {
            (true, PairState::Unpaired) => {
                self.transition(PairState::RequestedByPeer);
                vec![self.arm(now), PairingAction::IncomingRequest]
            }
            (true, PairState::RequestedByMe) => {
                self.transition(PairState::Paired);
                vec![PairingAction::Trusted]
            }
            (true, PairState::RequestedByPeer) => vec![self.arm(now)],
            (true, PairState::Paired) => vec![PairingAction::Send(pair_packet(true))],
            (false, PairState::RequestedByMe | PairState::RequestedByPeer) => {
                self.transition(PairState::Unpaired);
                vec![PairingAction::Failed(PairingError::Rejected)]
            }
            (false, PairState::Paired) => {
                self.transition(PairState::Unpaired);
                vec![PairingAction::Untrusted]
            }
            (false, PairState::Unpaired) => Vec::new(),
        }
    }

    /// Expire an outstanding request. Reports the timeout at most once per request.
    pub fn check_deadline(&mut self, now: Instant) -> Vec<PairingAction> {
        match self.deadline {
            Some(deadline) if self.state.is_requested() && now >= deadline => {
                self.transition(PairState::Unpaired);
                vec![PairingAction::Failed(PairingError::Timeout)]
            }
            _ => Vec::new(),
        }
    }

    /// Drop an outstanding request without telling anyone.
    pub fn cancel(&mut self) {
        if self.state.is_requested() {
            self.transition(PairState::Unpaired);
        }
    }

    /// Follow a trust change decided at device scope (another link paired, or local unpair).
    pub fn set_trusted(&mut self, trusted: bool) {
        self.transition(if trusted {
            PairState::Paired
        } else {
            PairState::Unpaired
        });
    }
}

impl Default for PairingHandler {
    fn default() -> Self {
        Self::new(DEFAULT_PAIRING_TIMEOUT)
    }
}
