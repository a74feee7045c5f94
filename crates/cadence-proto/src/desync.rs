//! The desync-debug packet.
//!
//! Emitted after every tick, carrying the rolling save-state and input
//! hashes for the last [`DELAY_BUFFER_SIZE`] frames. The channel is
//! fire-and-forget; receivers compare overlapping slots and log or record
//! mismatches, nothing more.

use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
    byteorder::little_endian::I64,
};

use crate::{Channel, DELAY_BUFFER_SIZE, ProtocolError};

/// Rolling hash comparison packet (144 bytes on the wire).
///
/// A save hash of 0 means "no save state was taken for that frame" and is
/// skipped by comparators; input hashes are always present.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DesyncPacket {
    channel_and_flags: u8,
    spacing: [u8; 7],
    frame: I64,
    save_state_hash: [I64; DELAY_BUFFER_SIZE],
    input_state_hash: [I64; DELAY_BUFFER_SIZE],
}

impl DesyncPacket {
    /// Wire size (144 bytes).
    pub const SIZE: usize = 16 + 2 * 8 * DELAY_BUFFER_SIZE;

    /// Fresh packet with the channel byte set and all hashes zero.
    #[must_use]
    pub fn new() -> Self {
        let mut packet = Self::new_zeroed();
        packet.channel_and_flags = Channel::DesyncDebug.to_byte();
        packet
    }

    /// Parse a packet from a datagram.
    pub fn read_from(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::read_from_bytes(bytes)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Latest frame the hashes cover.
    #[must_use]
    pub fn frame(&self) -> i64 {
        self.frame.get()
    }

    /// Set the latest covered frame.
    pub fn set_frame(&mut self, frame: i64) {
        self.frame = I64::new(frame);
    }

    /// Save-state hash in ring slot `slot` (0 = absent).
    #[must_use]
    pub fn save_hash(&self, slot: usize) -> i64 {
        self.save_state_hash[slot].get()
    }

    /// Record a save-state hash for `slot`.
    pub fn set_save_hash(&mut self, slot: usize, hash: i64) {
        self.save_state_hash[slot] = I64::new(hash);
    }

    /// Input hash in ring slot `slot`.
    #[must_use]
    pub fn input_hash(&self, slot: usize) -> i64 {
        self.input_state_hash[slot].get()
    }

    /// Record an input hash for `slot`.
    pub fn set_input_hash(&mut self, slot: usize, hash: i64) {
        self.input_state_hash[slot] = I64::new(hash);
    }
}

impl Default for DesyncPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DesyncPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesyncPacket").field("frame", &self.frame()).finish_non_exhaustive()
    }
}
