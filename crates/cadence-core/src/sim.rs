//! The simulation seam.
//!
//! The engine treats the simulation (an emulator core or any frame-stepped
//! state machine) as a black box with four operations. Determinism is the
//! simulation's contract: identical state plus identical input planes must
//! produce identical successor states on every peer.

use cadence_proto::{INPUT_WORDS, PORT_COUNT};

/// One frame of input for every port: 64 signed 16-bit words each.
pub type InputPlane = [[i16; INPUT_WORDS]; PORT_COUNT];

/// The wrapped frame-stepped simulation.
pub trait SimulationCore {
    /// Advance the simulation by exactly one frame.
    fn run_one_frame(&mut self, inputs: &InputPlane);

    /// Size a serialized snapshot of the current state would need.
    fn serialize_size(&mut self) -> usize;

    /// Serialize the current state into `buffer`; returns false on failure.
    fn serialize(&mut self, buffer: &mut [u8]) -> bool;

    /// Replace the current state from a snapshot; returns false on failure.
    fn unserialize(&mut self, buffer: &[u8]) -> bool;
}
