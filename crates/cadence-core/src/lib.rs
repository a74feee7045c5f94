//! Deterministic peer-to-peer lockstep session engine.
//!
//! A fixed-size group of peers advances a frame-stepped simulation in
//! lockstep by exchanging per-frame input over unreliable datagram channels.
//! The engine is fixed-delay (not rollback): a frame runs only once every
//! seated peer's inputs for it are locally buffered, which the [`Session`]
//! decides each poll through its tick gate.
//!
//! # Architecture
//!
//! The session is a single-threaded state machine behind capability seams,
//! in the same sans-IO style as the rest of this workspace:
//!
//! - [`SimulationCore`]: the wrapped simulation (run / serialize /
//!   unserialize), treated as a black box
//! - [`Transport`] / [`PeerAgent`]: one ICE-style agent per remote peer,
//!   polled synchronously for events
//! - [`SignalSink`]: outbound messages to the reliable signaling relay
//! - [`Clock`]: wall-clock pacing source
//!
//! Each call to [`Session::poll`] broadcasts the local state ring, drains
//! the transport, and ticks the simulation when the gate and frame pacing
//! allow. Membership travels as authority-serialized room XOR deltas inside
//! the same state packets, so every peer applies changes at the same frame
//! boundary.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod desync;
mod env;
mod error;
pub mod membership;
mod options;
mod ring;
pub mod session;
mod sim;
pub mod transfer;
pub mod transport;

pub use env::{Clock, SignalSink, SystemClock};
pub use error::SessionError;
pub use options::{CoreOptions, MAX_CORE_OPTIONS};
pub use ring::{HISTORY_SIZE, PacketHistory};
pub use session::{
    MAX_SPECTATORS, PollOutcome, Session, SessionConfig, TOTAL_SLOTS,
    WAITING_FOR_SAVE_STATE_SENTINEL,
};
pub use sim::{InputPlane, SimulationCore};
pub use transport::{AgentEvent, AgentState, PeerAgent, Transport, TransportError};
