//! Save-state transfer: compressed state fanned out as an erasure-coded
//! fragment stream.
//!
//! Outbound, the authority builds `{header, zstd(state), zstd(options)}`,
//! stamps a content hash with the hash field zeroed, partitions the payload
//! into packet groups, computes parity per group, and emits one datagram
//! per block. Inbound, any peer reassembles from whichever `k` blocks of
//! each group arrive first, reconstructs, verifies the hash, and
//! decompresses. Every failure path resets the scratch state so the next
//! retransmission starts clean.

use cadence_codec::{compress, fec, hash64};
use zerocopy::IntoBytes;
use cadence_proto::{
    FEC_REDUNDANT_BLOCKS, FRAGMENT_HEADER_SIZE, PACKET_GROUPS_MAX, PACKET_SIZE_MAX, Room,
    TransferHeader,
    savestate::{FRAGMENT_PAYLOAD_MAX, decode_fragment_header, encode_fragment_header},
};

use crate::{CoreOptions, SessionError};

/// Ceiling on the decompressed save-state size a remote may claim.
pub const SAVE_STATE_SIZE_MAX: usize = 64 * 1024 * 1024;

/// A fully reassembled, verified, decompressed transfer.
#[derive(Debug)]
pub struct TransferPayload {
    /// Frame the save state was taken at
    pub frame_counter: i64,
    /// Room record as of that frame
    pub room: Room,
    /// Raw core-option table bytes
    pub options_table: Vec<u8>,
    /// Decompressed save state
    pub save_state: Vec<u8>,
}

/// Build the full fragment fan-out for one save-state transfer.
///
/// Returns every datagram to send, in emission order (block-major across
/// groups, matching the receiver's coalescing order).
pub fn build_fragments(
    save_state: &[u8],
    options_table: &[u8],
    room: &Room,
    save_state_frame: i64,
    zstd_level: i32,
) -> Result<Vec<Vec<u8>>, SessionError> {
    let compressed_state = compress::compress(save_state, zstd_level)?;
    let compressed_options = compress::compress(options_table, zstd_level)?;

    let total_size =
        TransferHeader::SIZE + compressed_state.len() + compressed_options.len();
    let part = fec::partition(total_size, FEC_REDUNDANT_BLOCKS, FRAGMENT_PAYLOAD_MAX);

    let mut header = TransferHeader::default();
    header.set_total_size_bytes(total_size as i64);
    header.set_frame_counter(save_state_frame);
    header.set_room(*room);
    header.set_compressed_savestate_size(compressed_state.len() as i64);
    header.set_compressed_options_size(compressed_options.len() as i64);
    header.set_decompressed_savestate_size(save_state.len() as i64);

    // Data region of all groups, zero-padded to a whole number of blocks
    let mut payload = vec![0u8; part.groups * part.k * part.block_size];
    payload[..TransferHeader::SIZE].copy_from_slice(header.as_bytes());
    payload[TransferHeader::SIZE..TransferHeader::SIZE + compressed_state.len()]
        .copy_from_slice(&compressed_state);
    payload[TransferHeader::SIZE + compressed_state.len()..total_size]
        .copy_from_slice(&compressed_options);

    // Hash with the hash field zeroed, then patch it in
    let hash = hash64(&payload[..total_size]);
    payload[TransferHeader::XXHASH_OFFSET..TransferHeader::XXHASH_OFFSET + 8]
        .copy_from_slice(&hash.to_le_bytes());

    let parity_count = part.n - part.k;
    let mut fragments = Vec::with_capacity(part.groups * part.n);
    let mut parity_per_group = Vec::with_capacity(part.groups);
    for group in 0..part.groups {
        let data_blocks: Vec<&[u8]> = (0..part.k)
            .map(|block| {
                let offset = fec::block_offset(group, block, part.block_size, part.groups);
                &payload[offset..offset + part.block_size]
            })
            .collect();
        parity_per_group.push(fec::encode_parity(&data_blocks, parity_count)?);
    }

    for block in 0..part.n {
        for group in 0..part.groups {
            let mut fragment = Vec::with_capacity(FRAGMENT_HEADER_SIZE + part.block_size);
            fragment
                .extend_from_slice(&encode_fragment_header(part.k, part.groups, group, block));
            if block < part.k {
                let offset = fec::block_offset(group, block, part.block_size, part.groups);
                fragment.extend_from_slice(&payload[offset..offset + part.block_size]);
            } else {
                fragment.extend_from_slice(&parity_per_group[group][block - part.k]);
            }
            debug_assert!(fragment.len() <= PACKET_SIZE_MAX);
            fragments.push(fragment);
        }
    }

    Ok(fragments)
}

/// Inbound reassembly scratch for one transfer at a time.
///
/// Exclusive to the receive side: while a transfer is in progress no other
/// work touches it, and any error resets it wholesale.
pub struct TransferAssembler {
    groups: usize,
    k: Option<usize>,
    block_size: Option<usize>,
    shards: Vec<Vec<Option<Vec<u8>>>>,
    received: [usize; PACKET_GROUPS_MAX],
}

impl TransferAssembler {
    /// Fresh scratch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: PACKET_GROUPS_MAX,
            k: None,
            block_size: None,
            shards: (0..PACKET_GROUPS_MAX).map(|_| Vec::new()).collect(),
            received: [0; PACKET_GROUPS_MAX],
        }
    }

    /// Whether any fragment of an unfinished transfer has been absorbed.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.received.iter().any(|&count| count > 0)
    }

    /// Absorb one `SAVESTATE` datagram.
    ///
    /// Returns the decoded transfer once the final needed fragment arrives.
    /// Duplicate blocks and fragments for already-complete groups are
    /// ignored. Any reassembly failure resets the scratch and propagates.
    pub fn accept(&mut self, datagram: &[u8]) -> Result<Option<TransferPayload>, SessionError> {
        let meta = decode_fragment_header(datagram)?;
        if datagram.len() <= FRAGMENT_HEADER_SIZE {
            return Err(SessionError::Protocol(cadence_proto::ProtocolError::Truncated {
                expected: FRAGMENT_HEADER_SIZE + 1,
                actual: datagram.len(),
            }));
        }
        if datagram.len() > PACKET_SIZE_MAX {
            tracing::warn!(size = datagram.len(), "save-state fragment larger than the MTU cap");
        }

        let k = *self.k.get_or_insert(meta.k);
        if meta.k != k {
            tracing::warn!(got = meta.k, expected = k, "fragment with inconsistent k; dropped");
            return Ok(None);
        }
        if let Some(announced) = meta.announced_groups {
            let announced = announced as usize;
            if announced == 0 || announced > PACKET_GROUPS_MAX {
                return Err(SessionError::Protocol(
                    cadence_proto::ProtocolError::PacketGroupOutOfRange(announced as u8),
                ));
            }
            self.groups = announced;
        }

        let group = meta.group as usize;
        if self.received[group] >= k {
            // Enough blocks to decode this group already
            return Ok(None);
        }

        let block_bytes = &datagram[FRAGMENT_HEADER_SIZE..];
        let block_size = *self.block_size.get_or_insert(block_bytes.len());
        if block_bytes.len() != block_size {
            tracing::warn!(
                got = block_bytes.len(),
                expected = block_size,
                "fragment with inconsistent block size; dropped"
            );
            return Ok(None);
        }

        let n = k + fec::parity_for(k, FEC_REDUNDANT_BLOCKS);
        if meta.block as usize >= n {
            tracing::warn!(block = meta.block, n, "fragment block index out of range; dropped");
            return Ok(None);
        }

        if self.shards[group].is_empty() {
            self.shards[group] = vec![None; n];
        }
        if self.shards[group][meta.block as usize].is_some() {
            return Ok(None);
        }
        self.shards[group][meta.block as usize] = Some(block_bytes.to_vec());
        self.received[group] += 1;

        if self.received[group] < k {
            return Ok(None);
        }
        tracing::debug!(group, "packet group complete");

        if (0..self.groups).any(|g| self.received[g] < k) {
            return Ok(None);
        }

        // Last group just completed; whatever happens next, start clean
        let result = self.assemble(k, n, block_size);
        self.reset();
        result.map(Some)
    }

    /// Drop any partial transfer and return to the initial state.
    pub fn reset(&mut self) {
        self.groups = PACKET_GROUPS_MAX;
        self.k = None;
        self.block_size = None;
        for group in &mut self.shards {
            group.clear();
        }
        self.received = [0; PACKET_GROUPS_MAX];
    }

    fn assemble(
        &mut self,
        k: usize,
        n: usize,
        block_size: usize,
    ) -> Result<TransferPayload, SessionError> {
        for group in 0..self.groups {
            fec::reconstruct_data(k, n - k, &mut self.shards[group])?;
        }

        let mut payload = Vec::with_capacity(self.groups * k * block_size);
        for block in 0..k {
            for group in 0..self.groups {
                let shard = self.shards[group][block].as_ref().ok_or_else(|| {
                    SessionError::Codec(cadence_codec::CodecError::ErasureDecode(
                        "data shard missing after reconstruction".to_string(),
                    ))
                })?;
                payload.extend_from_slice(shard);
            }
        }

        let header = TransferHeader::read_from(&payload)?;
        tracing::info!(frame = header.frame_counter(), "save-state payload reassembled");

        let total_size = header.total_size_bytes();
        if total_size < TransferHeader::SIZE as i64 || total_size as usize > payload.len() {
            return Err(SessionError::TransferSizeOutOfBounds {
                size: total_size,
                max: payload.len(),
            });
        }
        let total_size = total_size as usize;

        let claimed = header.xxhash();
        payload[TransferHeader::XXHASH_OFFSET..TransferHeader::XXHASH_OFFSET + 8].fill(0);
        let computed = hash64(&payload[..total_size]);
        if computed != claimed {
            return Err(SessionError::TransferHashMismatch { computed, claimed });
        }

        let state_size = header.compressed_savestate_size();
        let options_size = header.compressed_options_size();
        if state_size < 0
            || options_size < 0
            || TransferHeader::SIZE + (state_size + options_size) as usize > total_size
        {
            return Err(SessionError::TransferSizeOutOfBounds {
                size: state_size + options_size,
                max: total_size,
            });
        }
        let state_range = TransferHeader::SIZE..TransferHeader::SIZE + state_size as usize;
        let options_range = state_range.end..state_range.end + options_size as usize;

        let options_table =
            compress::decompress(&payload[options_range], CoreOptions::TABLE_BYTES)?;

        let decompressed_size = header.decompressed_savestate_size();
        if decompressed_size < 0 || decompressed_size as usize > SAVE_STATE_SIZE_MAX {
            return Err(SessionError::TransferSizeOutOfBounds {
                size: decompressed_size,
                max: SAVE_STATE_SIZE_MAX,
            });
        }
        let save_state =
            compress::decompress(&payload[state_range], decompressed_size as usize)?;

        Ok(TransferPayload {
            frame_counter: header.frame_counter(),
            room: header.room(),
            options_table,
            save_state,
        })
    }
}

impl Default for TransferAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransferAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferAssembler")
            .field("groups", &self.groups)
            .field("k", &self.k)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}
