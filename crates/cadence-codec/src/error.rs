//! Error type shared by the codecs.

use thiserror::Error;

/// Errors produced while encoding or decoding payloads.
#[derive(Error, Debug)]
pub enum CodecError {
    /// zstd compression or decompression failed
    #[error("zstd: {0}")]
    Zstd(#[from] std::io::Error),

    /// Decompressed output would exceed the caller's capacity bound
    #[error("decompressed size {size} exceeds bound {bound}")]
    DecompressBound {
        /// Claimed or produced size
        size: usize,
        /// Capacity the caller allowed
        bound: usize,
    },

    /// Erasure-code parameters are unusable
    #[error("invalid erasure coding shape: k={k} parity={parity}")]
    ErasureShape {
        /// Data block count
        k: usize,
        /// Parity block count
        parity: usize,
    },

    /// Not enough blocks survived to reconstruct a packet group
    #[error("erasure reconstruction failed: {0}")]
    ErasureDecode(String),
}
