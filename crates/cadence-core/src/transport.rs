//! The ICE transport seam.
//!
//! The engine does not do NAT traversal itself; it drives one agent per
//! remote peer through a small lifecycle and exchanges SDP strings through
//! the signaling relay. Agents surface everything — connectivity changes,
//! gathered candidates, inbound datagrams — as polled events, which the
//! session drains synchronously from its single thread during
//! [`Transport::drive`]'s aftermath.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Transport-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Sending a datagram failed
    #[error("send failed: {0}")]
    Send(String),

    /// ICE negotiation input was rejected
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The transport cannot open further agents
    #[error("agent limit reached")]
    AgentLimit,
}

/// Connectivity lifecycle of a peer agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Created, nothing negotiated yet
    New,
    /// Gathering local candidates
    Gathering,
    /// A usable candidate pair exists
    Connected,
    /// Negotiation finished on both sides
    Completed,
    /// Negotiation or connectivity failed
    Failed,
}

impl AgentState {
    /// Whether datagrams can be sent in this state.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

/// Events an agent reports when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Lifecycle transition
    StateChanged(AgentState),
    /// A local candidate was gathered; forward it through signaling
    LocalCandidate(String),
    /// Local candidate gathering finished
    GatheringDone,
    /// A datagram arrived from the remote peer
    Datagram(Bytes),
}

/// One datagram channel to one remote peer.
pub trait PeerAgent {
    /// Current connectivity state.
    fn state(&self) -> AgentState;

    /// Send a datagram to the remote peer.
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Local SDP description to offer through signaling.
    fn local_description(&self) -> String;

    /// Apply the remote peer's SDP description.
    fn set_remote_description(&mut self, sdp: &str) -> Result<(), TransportError>;

    /// Add one remote candidate line.
    fn add_remote_candidate(&mut self, sdp: &str) -> Result<(), TransportError>;

    /// The remote peer finished gathering candidates.
    fn set_remote_gathering_done(&mut self);

    /// Start gathering local candidates (asynchronous; completion arrives
    /// as [`AgentEvent::GatheringDone`]).
    fn gather_candidates(&mut self);

    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<AgentEvent>;
}

/// Factory and progress driver for peer agents.
pub trait Transport {
    /// Agent type this transport produces.
    type Agent: PeerAgent;

    /// Open a fresh agent for a new remote peer.
    fn open(&mut self) -> Result<Self::Agent, TransportError>;

    /// Make progress on all of this transport's agents, blocking at most
    /// `timeout`. Inbound traffic and lifecycle changes surface afterwards
    /// through each agent's [`PeerAgent::poll_event`].
    fn drive(&mut self, timeout: Duration) -> Result<(), TransportError>;
}
