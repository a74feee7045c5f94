//! Deterministic stand-in simulation.
//!
//! Holds a pseudo-random state blob and folds every frame's input plane
//! into it, so two cores that start identical and see identical inputs
//! stay byte-identical, and any divergence shows up in the digest (and in
//! the session's save hashes). The blob size is configurable to exercise
//! single- and multi-group save-state transfers.

use cadence_codec::hash64;
use cadence_core::{InputPlane, SimulationCore};

/// Frame-stepped hash-fold state machine.
#[derive(Debug, Clone)]
pub struct ToyCore {
    blob: Vec<u8>,
    frames_run: u64,
}

impl ToyCore {
    /// Core with a `size`-byte pseudo-random state blob.
    #[must_use]
    pub fn new(size: usize, seed: u64) -> Self {
        let mut state = seed | 1;
        let blob = (0..size)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        Self { blob, frames_run: 0 }
    }

    /// Content digest for cross-peer equality assertions.
    #[must_use]
    pub fn digest(&self) -> u64 {
        hash64(&self.blob).wrapping_add(self.frames_run)
    }

    /// Frames this core has run (or inherited through a save state).
    #[must_use]
    pub fn frames_run(&self) -> u64 {
        self.frames_run
    }
}

impl SimulationCore for ToyCore {
    fn run_one_frame(&mut self, inputs: &InputPlane) {
        let mut input_bytes = Vec::with_capacity(inputs.len() * inputs[0].len() * 2);
        for port in inputs {
            for word in port {
                input_bytes.extend_from_slice(&word.to_le_bytes());
            }
        }

        let mixed = hash64(&input_bytes) ^ hash64(&self.blob) ^ self.frames_run;
        if self.blob.len() >= 8 {
            let offset = (mixed as usize) % (self.blob.len() - 7);
            for (byte, mix) in self.blob[offset..offset + 8].iter_mut().zip(mixed.to_le_bytes())
            {
                *byte ^= mix;
            }
        }
        self.frames_run += 1;
    }

    fn serialize_size(&mut self) -> usize {
        self.blob.len() + 8
    }

    fn serialize(&mut self, buffer: &mut [u8]) -> bool {
        if buffer.len() != self.blob.len() + 8 {
            return false;
        }
        buffer[..self.blob.len()].copy_from_slice(&self.blob);
        buffer[self.blob.len()..].copy_from_slice(&self.frames_run.to_le_bytes());
        true
    }

    fn unserialize(&mut self, buffer: &[u8]) -> bool {
        if buffer.len() < 8 {
            return false;
        }
        let split = buffer.len() - 8;
        let Some(frames) = buffer[split..].first_chunk::<8>() else { return false };
        self.blob = buffer[..split].to_vec();
        self.frames_run = u64::from_le_bytes(*frames);
        true
    }
}
