//! zstd wrappers with bounded decode capacity.
//!
//! The compression level is a session tunable (`-22..=22`); the decompress
//! side always runs with an explicit capacity bound because the claimed
//! decompressed size arrives over the network.

use crate::CodecError;

/// Compress `data` at the given zstd level.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    Ok(zstd::bulk::compress(data, level)?)
}

/// Decompress `data`, refusing outputs larger than `capacity` bytes.
pub fn decompress(data: &[u8], capacity: usize) -> Result<Vec<u8>, CodecError> {
    let out = zstd::bulk::decompress(data, capacity)?;
    if out.len() > capacity {
        return Err(CodecError::DecompressBound { size: out.len(), bound: capacity });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_at_default_level() {
        let data: Vec<u8> = (0..10_000u32).flat_map(u32::to_le_bytes).collect();
        let packed = compress(&data, 0).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = decompress(&packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let data = vec![7u8; 4096];
        let packed = compress(&data, 3).unwrap();
        assert!(decompress(&packed, 16).is_err());
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(decompress(&[0xDE, 0xAD, 0xBE, 0xEF], 1024).is_err());
    }
}
