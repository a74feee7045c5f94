//! Deterministic simulation harness for cadence session testing.
//!
//! Everything a scenario needs to run whole netplay sessions in-process
//! with no real time, sockets, or NAT traversal:
//!
//! - [`VirtualClock`]: a shared microsecond clock the test advances
//! - [`Network`] / [`LoopbackTransport`]: an in-memory datagram fabric with
//!   SDP-string pairing and seeded state-packet loss
//! - [`SignalingHub`]: the reliable relay, reduced to what the engine
//!   consumes (peer-id assignment, join routing, sender rewriting)
//! - [`ToyCore`]: a deterministic stand-in simulation with a configurable
//!   state-blob size
//! - [`Cluster`]: a multi-peer step driver (sample input, poll, pump
//!   signals, advance the clock)
//!
//! Scenario tests live in `tests/` and drive these pieces directly.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod clock;
pub mod cluster;
pub mod hub;
pub mod sim_core;
pub mod transport;

pub use clock::VirtualClock;
pub use cluster::{Cluster, TestPeer};
pub use hub::{HubSink, SignalingHub};
pub use sim_core::ToyCore;
pub use transport::{LoopbackAgent, LoopbackTransport, Network};
