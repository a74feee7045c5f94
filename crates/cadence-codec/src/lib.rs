//! Byte-level codecs for the cadence netplay wire.
//!
//! Four small, independent tools live here:
//!
//! - [`rle8`]: the zero-run codec used to shrink state packets below the MTU
//! - [`fec`]: the `(n, k)` packet-group partitioner and the systematic
//!   GF(2^8) erasure code protecting save-state transfers
//! - [`compress`]: zstd wrappers with bounded decode capacity
//! - [`hash64`]: xxhash64 content hashing (seed 0)
//!
//! Everything in this crate is pure: no I/O, no time, no allocation beyond
//! the returned buffers. Higher layers decide what the bytes mean.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod compress;
mod error;
pub mod fec;
pub mod rle8;

pub use error::CodecError;

/// Content hash used for save-state integrity and desync detection.
///
/// Always seeded with 0 so every peer computes identical digests. This is a
/// checksum, not a MAC; the protocol assumes a trusted authority.
#[must_use]
pub fn hash64(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}
