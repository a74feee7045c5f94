//! Save-state transfer fragments and the transfer payload header.
//!
//! A transfer is `groups x n` datagrams, each 3 bytes of header plus one
//! erasure-code block. The header squeezes three fields into one byte: in
//! the common full-size case (`k == 239`, signaled by a flag) the byte
//! carries either the packet-group index or — once, flagged, on group 0 —
//! the total group count; otherwise it carries `k` itself and the transfer
//! is single-group by construction.

use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout,
    byteorder::little_endian::{I64, U64},
};

use crate::{Channel, PACKET_SIZE_MAX, ProtocolError, Room};

/// Parity redundancy per packet group: `k * 16 / 239` parity blocks.
pub const FEC_REDUNDANT_BLOCKS: usize = 16;

/// Most packet groups a single transfer may use.
pub const PACKET_GROUPS_MAX: usize = 16;

/// The `k` value signaled by [`SAVESTATE_FLAG_K_IS_239`].
pub const FULL_K: usize = 239;

/// Flag: the group's data block count is the full 239.
pub const SAVESTATE_FLAG_K_IS_239: u8 = 0b0001;

/// Flag: the overloaded byte carries the total packet-group count (only
/// ever set on group 0).
pub const SAVESTATE_FLAG_SEQUENCE_HI_IS_0: u8 = 0b0010;

/// Bytes of fragment header preceding the block payload.
pub const FRAGMENT_HEADER_SIZE: usize = 3;

/// Largest erasure-code block that fits a datagram.
pub const FRAGMENT_PAYLOAD_MAX: usize = PACKET_SIZE_MAX - FRAGMENT_HEADER_SIZE;

/// Decoded fragment header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentMeta {
    /// Data blocks per group
    pub k: usize,
    /// Packet group this block belongs to
    pub group: u8,
    /// Block index within the group (data `0..k`, parity `k..n`)
    pub block: u8,
    /// Total group count, present only on the announcing group-0 packets
    pub announced_groups: Option<u8>,
}

/// Build the 3-byte header for block `block` of group `group`.
#[must_use]
pub fn encode_fragment_header(k: usize, groups: usize, group: usize, block: usize) -> [u8; 3] {
    let mut channel_and_flags = Channel::SavestateTransfer.to_byte();
    let overloaded;
    if k == FULL_K {
        channel_and_flags |= SAVESTATE_FLAG_K_IS_239;
        if group == 0 {
            channel_and_flags |= SAVESTATE_FLAG_SEQUENCE_HI_IS_0;
            overloaded = groups as u8;
        } else {
            overloaded = group as u8;
        }
    } else {
        // k < 239 implies the partitioner kept a single group
        debug_assert_eq!(groups, 1);
        overloaded = k as u8;
    }
    [channel_and_flags, overloaded, block as u8]
}

/// Decode a fragment header (the first 3 bytes of a transfer datagram).
pub fn decode_fragment_header(bytes: &[u8]) -> Result<FragmentMeta, ProtocolError> {
    let [channel_and_flags, overloaded, block] = *bytes.first_chunk::<3>().ok_or(
        ProtocolError::Truncated { expected: FRAGMENT_HEADER_SIZE, actual: bytes.len() },
    )?;

    let meta = if channel_and_flags & SAVESTATE_FLAG_K_IS_239 != 0 {
        if channel_and_flags & SAVESTATE_FLAG_SEQUENCE_HI_IS_0 != 0 {
            FragmentMeta { k: FULL_K, group: 0, block, announced_groups: Some(overloaded) }
        } else {
            FragmentMeta { k: FULL_K, group: overloaded, block, announced_groups: None }
        }
    } else {
        // k encoded directly; single-group transfer
        FragmentMeta { k: overloaded as usize, group: 0, block, announced_groups: Some(1) }
    };

    if meta.group as usize >= PACKET_GROUPS_MAX {
        return Err(ProtocolError::PacketGroupOutOfRange(meta.group));
    }
    Ok(meta)
}

/// Fixed header at the front of the reassembled transfer payload
/// (248 bytes), followed by the two compressed blobs.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TransferHeader {
    total_size_bytes: I64,
    frame_counter: I64,
    room: Room,
    xxhash: U64,
    compressed_options_size: I64,
    compressed_savestate_size: I64,
    decompressed_savestate_size: I64,
}

impl TransferHeader {
    /// Wire size (248 bytes).
    pub const SIZE: usize = 8 + 8 + Room::SIZE + 8 + 8 + 8 + 8;

    /// Byte offset of the hash field, zeroed while hashing.
    pub const XXHASH_OFFSET: usize = 16 + Room::SIZE;

    /// Parse the header from the front of a reassembled payload.
    pub fn read_from(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::read_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Header plus both compressed blobs, in bytes.
    #[must_use]
    pub fn total_size_bytes(&self) -> i64 {
        self.total_size_bytes.get()
    }

    /// Set the payload's total size.
    pub fn set_total_size_bytes(&mut self, size: i64) {
        self.total_size_bytes = I64::new(size);
    }

    /// Frame the save state was taken at.
    #[must_use]
    pub fn frame_counter(&self) -> i64 {
        self.frame_counter.get()
    }

    /// Set the save-state frame.
    pub fn set_frame_counter(&mut self, frame: i64) {
        self.frame_counter = I64::new(frame);
    }

    /// Room record as of the save-state frame.
    #[must_use]
    pub fn room(&self) -> Room {
        self.room
    }

    /// Set the room record.
    pub fn set_room(&mut self, room: Room) {
        self.room = room;
    }

    /// Content hash over the payload with this field zeroed.
    #[must_use]
    pub fn xxhash(&self) -> u64 {
        self.xxhash.get()
    }

    /// Set the content hash.
    pub fn set_xxhash(&mut self, hash: u64) {
        self.xxhash = U64::new(hash);
    }

    /// Size of the compressed core-option blob.
    #[must_use]
    pub fn compressed_options_size(&self) -> i64 {
        self.compressed_options_size.get()
    }

    /// Set the compressed option blob size.
    pub fn set_compressed_options_size(&mut self, size: i64) {
        self.compressed_options_size = I64::new(size);
    }

    /// Size of the compressed save-state blob.
    #[must_use]
    pub fn compressed_savestate_size(&self) -> i64 {
        self.compressed_savestate_size.get()
    }

    /// Set the compressed save-state blob size.
    pub fn set_compressed_savestate_size(&mut self, size: i64) {
        self.compressed_savestate_size = I64::new(size);
    }

    /// Size the save state decompresses to.
    #[must_use]
    pub fn decompressed_savestate_size(&self) -> i64 {
        self.decompressed_savestate_size.get()
    }

    /// Set the decompressed save-state size.
    pub fn set_decompressed_savestate_size(&mut self, size: i64) {
        self.decompressed_savestate_size = I64::new(size);
    }
}

impl Default for TransferHeader {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl std::fmt::Debug for TransferHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHeader")
            .field("total_size_bytes", &self.total_size_bytes())
            .field("frame_counter", &self.frame_counter())
            .field("compressed_savestate_size", &self.compressed_savestate_size())
            .field("compressed_options_size", &self.compressed_options_size())
            .finish_non_exhaustive()
    }
}
