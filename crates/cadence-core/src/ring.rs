//! Raw state-packet history.
//!
//! Every state packet a peer receives (and every one it sends) is kept
//! verbatim in a per-port ring of the last [`HISTORY_SIZE`] packets, indexed
//! by the packet's frame. Spectators replay this history to rebuild port
//! state they consumed out of order, and the packet length never needs
//! storing: buffers are zero-filled past the packet, and trailing zero pairs
//! decode to nothing under RLE-8.

use cadence_codec::rle8;
use cadence_proto::PACKET_SIZE_MAX;

/// State packets retained per port.
pub const HISTORY_SIZE: usize = 256;

/// Fixed-size ring of raw state packets for one port.
pub struct PacketHistory {
    slots: Box<[u8]>,
}

impl PacketHistory {
    /// Fresh, zeroed history.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: vec![0u8; HISTORY_SIZE * PACKET_SIZE_MAX].into_boxed_slice() }
    }

    /// Store the raw datagram for `frame`, zero-filling the tail.
    pub fn record(&mut self, frame: i64, datagram: &[u8]) {
        let slot = self.slot_range(frame);
        let packet = &mut self.slots[slot];
        let len = datagram.len().min(PACKET_SIZE_MAX);
        packet[..len].copy_from_slice(&datagram[..len]);
        packet[len..].fill(0);
    }

    /// Raw packet buffer recorded for `frame` (possibly stale or empty).
    #[must_use]
    pub fn packet(&self, frame: i64) -> &[u8] {
        &self.slots[self.slot_range(frame)]
    }

    /// Zero out everything.
    pub fn reset(&mut self) {
        self.slots.fill(0);
    }

    fn slot_range(&self, frame: i64) -> std::ops::Range<usize> {
        let slot = (frame.rem_euclid(HISTORY_SIZE as i64)) as usize;
        slot * PACKET_SIZE_MAX..(slot + 1) * PACKET_SIZE_MAX
    }
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHistory").finish_non_exhaustive()
    }
}

/// Decode just the leading frame number out of an RLE-8 state packet body.
#[must_use]
pub fn peek_frame(coded_state: &[u8]) -> i64 {
    let mut frame_bytes = [0u8; 8];
    rle8::decode(coded_state, &mut frame_bytes);
    i64::from_le_bytes(frame_bytes)
}

#[cfg(test)]
mod tests {
    use cadence_proto::{Channel, PortState};
    use zerocopy::IntoBytes;

    use super::*;

    fn state_packet(frame: i64) -> Vec<u8> {
        let mut state = PortState::default();
        state.set_frame(frame);
        let mut packet = vec![Channel::Input.to_byte()];
        packet.extend(rle8::encode(state.as_bytes()));
        packet
    }

    #[test]
    fn record_and_peek() {
        let mut history = PacketHistory::new();
        let packet = state_packet(107);
        history.record(107, &packet);

        let stored = history.packet(107);
        assert_eq!(&stored[..packet.len()], &packet[..]);
        assert_eq!(peek_frame(&stored[1..]), 107);
    }

    #[test]
    fn ring_wraps_after_history_size() {
        let mut history = PacketHistory::new();
        history.record(5, &state_packet(5));
        history.record(5 + HISTORY_SIZE as i64, &state_packet(5 + HISTORY_SIZE as i64));

        // Same slot; newer packet wins
        assert_eq!(peek_frame(&history.packet(5)[1..]), 5 + HISTORY_SIZE as i64);
    }

    #[test]
    fn empty_slot_peeks_frame_zero() {
        let history = PacketHistory::new();
        assert_eq!(peek_frame(&history.packet(12)[1..]), 0);
    }

    #[test]
    fn shorter_rerecord_leaves_no_residue() {
        let mut history = PacketHistory::new();
        let mut long = state_packet(3);
        long.extend_from_slice(&[9u8; 64]);
        history.record(3, &long);

        let short = state_packet(3 + HISTORY_SIZE as i64);
        history.record(3 + HISTORY_SIZE as i64, &short);
        let stored = history.packet(3);
        assert!(stored[short.len()..].iter().all(|&b| b == 0));
    }
}
