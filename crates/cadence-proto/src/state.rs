//! The per-port state ring carried by every state packet.
//!
//! Each peer broadcasts its whole ring every poll iteration, so any single
//! packet is enough to recover the last [`DELAY_BUFFER_SIZE`] frames of that
//! peer's inputs. `frame` is the *highest* future frame the sender has
//! committed; slot `frame % DELAY_BUFFER_SIZE` holds that frame's data.
//!
//! The ring also carries the authority's room XOR deltas and at most one
//! core-option mutation per frame; both take effect at the tick boundary of
//! the frame whose slot they occupy.

use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
    byteorder::little_endian::{I16, I64},
};

use crate::room::{PORT_COUNT, Room};

/// Slots in the state ring.
///
/// A ring of 2 is the minimum that supports zero delay: a peer that ticks
/// and immediately sends may deliver frame `f+1` before the receiver has
/// consumed frame `f`, so one committed-but-unconsumed frame must survive a
/// newly arriving one. 8 slots leave room for up to 3 frames of configured
/// delay plus the same send-during-tick headroom.
pub const DELAY_BUFFER_SIZE: usize = 8;

/// Largest configurable input delay.
pub const DELAY_FRAMES_MAX: i64 = (DELAY_BUFFER_SIZE / 2 - 1) as i64;

/// 16-bit input words per port per frame.
pub const INPUT_WORDS: usize = 64;

/// Wire size of a core-option key or value slot.
pub const OPTION_STRING_SIZE: usize = 128;

/// One frame of input for one port.
pub type InputState = [I16; INPUT_WORDS];

/// A keyed configuration mutation taking effect at a specific frame.
///
/// An all-zero key marks the slot empty.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CoreOption {
    key: [u8; OPTION_STRING_SIZE],
    value: [u8; OPTION_STRING_SIZE],
}

impl CoreOption {
    /// Wire size (256 bytes).
    pub const SIZE: usize = 2 * OPTION_STRING_SIZE;

    /// Build an option, truncating key and value to their wire slots.
    #[must_use]
    pub fn new(key: &str, value: &str) -> Self {
        let mut option = Self::new_zeroed();
        copy_bounded(&mut option.key, key);
        copy_bounded(&mut option.value, value);
        option
    }

    /// Whether this slot holds no option.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key[0] == 0
    }

    /// Option key up to the first NUL.
    #[must_use]
    pub fn key(&self) -> std::borrow::Cow<'_, str> {
        let end = self.key.iter().position(|&b| b == 0).unwrap_or(self.key.len());
        String::from_utf8_lossy(&self.key[..end])
    }

    /// Option value up to the first NUL.
    #[must_use]
    pub fn value(&self) -> std::borrow::Cow<'_, str> {
        let end = self.value.iter().position(|&b| b == 0).unwrap_or(self.value.len());
        String::from_utf8_lossy(&self.value[..end])
    }
}

impl Default for CoreOption {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl PartialEq for CoreOption {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for CoreOption {}

impl std::fmt::Debug for CoreOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreOption")
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}

fn copy_bounded(field: &mut [u8], value: &str) {
    let len = value.len().min(field.len() - 1);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

/// One peer's state ring: committed frame head, buffered input plane, room
/// deltas, and option mutations (11 848 bytes on the wire before RLE-8).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PortState {
    frame: I64,
    input_state: [[InputState; PORT_COUNT]; DELAY_BUFFER_SIZE],
    room_xor_delta: [Room; DELAY_BUFFER_SIZE],
    core_option: [CoreOption; DELAY_BUFFER_SIZE],
}

impl PortState {
    /// Wire size before RLE-8 encoding.
    pub const SIZE: usize = 8
        + DELAY_BUFFER_SIZE * PORT_COUNT * INPUT_WORDS * 2
        + DELAY_BUFFER_SIZE * Room::SIZE
        + DELAY_BUFFER_SIZE * CoreOption::SIZE;

    /// Ring slot for `frame`.
    #[must_use]
    pub fn slot(frame: i64) -> usize {
        (frame.rem_euclid(DELAY_BUFFER_SIZE as i64)) as usize
    }

    /// Highest future frame with committed inputs.
    #[must_use]
    pub fn frame(&self) -> i64 {
        self.frame.get()
    }

    /// Set the committed frame head.
    pub fn set_frame(&mut self, frame: i64) {
        self.frame = I64::new(frame);
    }

    /// Input words for `port` in ring slot `slot`.
    #[must_use]
    pub fn input(&self, slot: usize, port: usize) -> &InputState {
        &self.input_state[slot][port]
    }

    /// Mutable input words for `port` in ring slot `slot`.
    pub fn input_mut(&mut self, slot: usize, port: usize) -> &mut InputState {
        &mut self.input_state[slot][port]
    }

    /// Room XOR delta committed for the frame in `slot`.
    #[must_use]
    pub fn room_delta(&self, slot: usize) -> &Room {
        &self.room_xor_delta[slot]
    }

    /// Mutable room XOR delta for `slot`.
    pub fn room_delta_mut(&mut self, slot: usize) -> &mut Room {
        &mut self.room_xor_delta[slot]
    }

    /// Core-option mutation committed for the frame in `slot`.
    #[must_use]
    pub fn core_option(&self, slot: usize) -> &CoreOption {
        &self.core_option[slot]
    }

    /// Set the core-option mutation for `slot`.
    pub fn set_core_option(&mut self, slot: usize, option: CoreOption) {
        self.core_option[slot] = option;
    }
}

impl Default for PortState {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl std::fmt::Debug for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortState").field("frame", &self.frame()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size() {
        assert_eq!(std::mem::size_of::<PortState>(), PortState::SIZE);
        assert_eq!(PortState::SIZE, 11_848);
        assert_eq!(std::mem::size_of::<CoreOption>(), CoreOption::SIZE);
    }

    #[test]
    fn slot_wraps_by_frame() {
        assert_eq!(PortState::slot(0), 0);
        assert_eq!(PortState::slot(7), 7);
        assert_eq!(PortState::slot(8), 0);
        assert_eq!(PortState::slot(107), 3);
    }

    #[test]
    fn fresh_ring_is_all_zero() {
        let state = PortState::default();
        assert_eq!(state.frame(), 0);
        assert!(state.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn core_option_empty_and_round_trip() {
        assert!(CoreOption::default().is_empty());
        let option = CoreOption::new("netplay_delay_frames", "2");
        assert!(!option.is_empty());
        assert_eq!(option.key(), "netplay_delay_frames");
        assert_eq!(option.value(), "2");
    }

    #[test]
    fn input_slots_are_independent() {
        let mut state = PortState::default();
        state.input_mut(3, 1)[0] = I16::new(0x55);
        assert_eq!(state.input(3, 1)[0].get(), 0x55);
        assert_eq!(state.input(3, 0)[0].get(), 0);
        assert_eq!(state.input(2, 1)[0].get(), 0);
    }
}
