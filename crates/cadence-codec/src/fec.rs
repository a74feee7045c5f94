//! Packet-group partitioning and GF(2^8) erasure coding.
//!
//! A save-state transfer can be far larger than the 255 blocks a single
//! GF(2^8) Reed-Solomon coding can address, so the payload is split into
//! `groups` independent codings ("packet groups"), each protecting `k` data
//! blocks with `n - k` parity blocks. Redundancy is proportional: a group
//! carries `k * r / (255 - r)` parity blocks, so small transfers may carry
//! none at all.
//!
//! Blocks are interleaved across groups: block `i` of group `j` starts at
//! byte `j * B + i * B * groups`, which keeps the data region of all groups
//! contiguous in block-major order.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::CodecError;

/// Number of addressable blocks in one GF(2^8) coding.
pub const GF_SIZE: usize = 255;

/// Shape of a partitioned transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Total blocks per group (data + parity), at most [`GF_SIZE`]
    pub n: usize,
    /// Data blocks per group
    pub k: usize,
    /// Bytes per block
    pub block_size: usize,
    /// Independent codings the payload is split into
    pub groups: usize,
}

/// Parity blocks carried for `k` data blocks at redundancy `redundant`.
#[must_use]
pub fn parity_for(k: usize, redundant: usize) -> usize {
    k * redundant / (GF_SIZE - redundant)
}

/// Partition `total_size` bytes into packet groups.
///
/// Starts from a single group at `initial_block_size` (the per-datagram
/// payload capacity) and only shrinks the block size once the data block
/// count would exceed `GF_SIZE - redundant`. The returned shape always
/// satisfies `groups * k * block_size >= total_size`.
#[must_use]
pub fn partition(total_size: usize, redundant: usize, initial_block_size: usize) -> Partition {
    let k_max = GF_SIZE - redundant;

    let mut groups = 1;
    let mut block_size = initial_block_size;
    let mut k = total_size.div_ceil(groups * block_size).max(1);

    if k > k_max {
        groups = k.div_ceil(k_max);
        block_size = total_size.div_ceil(k_max * groups);
        k = total_size.div_ceil(groups * block_size);
    }

    Partition { n: k + parity_for(k, redundant), k, block_size, groups }
}

/// Byte offset of block `block` in group `group`.
///
/// The lower sequence byte addresses the larger stride: consecutive blocks of
/// one group are `block_size * groups` apart, so the data blocks of all
/// groups tile `[0, groups * k * block_size)` without gaps.
#[must_use]
pub fn block_offset(group: usize, block: usize, block_size: usize, groups: usize) -> usize {
    group * block_size + block * block_size * groups
}

/// Compute the parity blocks for one packet group.
///
/// `data` must hold exactly the group's `k` data blocks, all of equal size.
/// Returns `parity` freshly allocated blocks; zero parity is valid and
/// yields an empty vec.
pub fn encode_parity(data: &[&[u8]], parity: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    if parity == 0 {
        return Ok(Vec::new());
    }
    let block_size = data.first().map_or(0, |b| b.len());
    let rs = ReedSolomon::new(data.len(), parity)
        .map_err(|_| CodecError::ErasureShape { k: data.len(), parity })?;

    let mut parity_blocks = vec![vec![0u8; block_size]; parity];
    rs.encode_sep(data, &mut parity_blocks)
        .map_err(|e| CodecError::ErasureDecode(e.to_string()))?;
    Ok(parity_blocks)
}

/// Reconstruct the missing data blocks of one packet group in place.
///
/// `shards` must have length `k + parity`, with received blocks present at
/// their sequence positions. On success every data shard (`0..k`) is
/// `Some`; parity shards are left untouched.
pub fn reconstruct_data(
    k: usize,
    parity: usize,
    shards: &mut [Option<Vec<u8>>],
) -> Result<(), CodecError> {
    if parity == 0 {
        // No coding to invert; every data block must have arrived verbatim
        if shards.iter().take(k).any(Option::is_none) {
            return Err(CodecError::ErasureDecode(
                "missing data block with no parity available".to_string(),
            ));
        }
        return Ok(());
    }

    let rs =
        ReedSolomon::new(k, parity).map_err(|_| CodecError::ErasureShape { k, parity })?;
    rs.reconstruct_data(shards).map_err(|e| CodecError::ErasureDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const REDUNDANT: usize = 16;
    const BLOCK: usize = 1405;

    #[test]
    fn small_payload_is_one_group() {
        let p = partition(10 * 1024, REDUNDANT, BLOCK);
        assert_eq!(p.groups, 1);
        assert_eq!(p.block_size, BLOCK);
        assert_eq!(p.k, (10 * 1024usize).div_ceil(BLOCK));
        assert!(p.k * p.block_size >= 10 * 1024);
    }

    #[test]
    fn full_single_group_is_k_239() {
        let k_max = GF_SIZE - REDUNDANT;
        assert_eq!(k_max, 239);
        let p = partition(k_max * BLOCK, REDUNDANT, BLOCK);
        assert_eq!((p.groups, p.k, p.n), (1, 239, 255));
    }

    #[test]
    fn oversized_payload_splits_into_groups() {
        let total = 600_000;
        let p = partition(total, REDUNDANT, BLOCK);
        assert!(p.groups > 1);
        assert_eq!(p.k, 239);
        assert!(p.block_size <= BLOCK);
        assert!(p.groups * p.k * p.block_size >= total);
        assert!(p.n <= GF_SIZE);
    }

    #[test]
    fn data_blocks_tile_contiguously() {
        let p = partition(500_000, REDUNDANT, BLOCK);
        let mut offsets: Vec<usize> = (0..p.k)
            .flat_map(|i| (0..p.groups).map(move |j| block_offset(j, i, p.block_size, p.groups)))
            .collect();
        offsets.sort_unstable();
        for (idx, off) in offsets.iter().enumerate() {
            assert_eq!(*off, idx * p.block_size);
        }
    }

    #[test]
    fn zero_parity_round_trip() {
        // 5 data blocks carry no parity at 16/239 redundancy
        assert_eq!(parity_for(5, REDUNDANT), 0);
        let mut shards: Vec<Option<Vec<u8>>> =
            (0..5u8).map(|i| Some(vec![i; 32])).collect();
        assert!(reconstruct_data(5, 0, &mut shards).is_ok());

        shards[2] = None;
        assert!(reconstruct_data(5, 0, &mut shards).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn partition_covers_payload(total in 1usize..4_000_000) {
            let p = partition(total, REDUNDANT, BLOCK);
            prop_assert!(p.k >= 1);
            prop_assert!(p.k <= GF_SIZE - REDUNDANT);
            prop_assert!(p.n <= GF_SIZE);
            prop_assert!(p.groups * p.k * p.block_size >= total);
            prop_assert_eq!(p.n, p.k + parity_for(p.k, REDUNDANT));
        }

        #[test]
        fn erasure_round_trip_with_drops(
            k in 30usize..120,
            seed in any::<u64>(),
        ) {
            let parity = parity_for(k, REDUNDANT);
            prop_assume!(parity > 0);
            let block_size = 64;

            // Deterministic pseudo-random payload
            let mut state = seed | 1;
            let mut next = move || {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state
            };
            let data: Vec<Vec<u8>> = (0..k)
                .map(|_| (0..block_size).map(|_| next() as u8).collect())
                .collect();

            let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
            let parity_blocks = encode_parity(&refs, parity).unwrap();

            let mut shards: Vec<Option<Vec<u8>>> = data
                .iter()
                .cloned()
                .map(Some)
                .chain(parity_blocks.into_iter().map(Some))
                .collect();

            // Erase up to `parity` blocks, spread across data and parity
            for victim in 0..parity {
                shards[(victim * 7) % (k + parity)] = None;
            }

            reconstruct_data(k, parity, &mut shards).unwrap();
            for (i, original) in data.iter().enumerate() {
                prop_assert_eq!(shards[i].as_ref(), Some(original));
            }
        }
    }
}
