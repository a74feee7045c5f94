//! Zero-run RLE codec for state packets.
//!
//! State rings are dominated by zero bytes (idle buttons, empty room deltas,
//! unset options), so the encoding only compresses zeros: a non-zero byte is
//! copied verbatim, a zero byte is emitted as the marker `0x00` followed by a
//! one-byte run length. The decoder additionally accepts a run length of 0,
//! which produces no output; the packet history ring relies on this so that a
//! zero-filled buffer tail decodes to nothing and the original packet length
//! never needs to be stored.

/// Maximum zeros representable by a single `(0x00, len)` pair.
const RUN_MAX: usize = 255;

/// Encode `src` into a fresh buffer.
///
/// Non-zero bytes pass through; each run of up to 255 zeros becomes two
/// bytes. The encoder never emits a run length of 0.
#[must_use]
pub fn encode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b != 0 {
            out.push(b);
            i += 1;
            continue;
        }

        let mut run = 1;
        while run < RUN_MAX && i + run < src.len() && src[i + run] == 0 {
            run += 1;
        }
        out.push(0);
        out.push(run as u8);
        i += run;
    }
    out
}

/// Decode into `out`, returning the number of bytes written.
///
/// Decoding stops when `out` is full or `src` is exhausted, whichever comes
/// first; a zero run crossing the capacity boundary is truncated. A marker
/// byte with no following length byte ends the stream.
pub fn decode(src: &[u8], out: &mut [u8]) -> usize {
    decode_extra(src, out).written
}

/// Outcome of [`decode_extra`]: bytes produced and input consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeExtra {
    /// Bytes written into the output buffer
    pub written: usize,
    /// Encoded bytes consumed from the input
    pub consumed: usize,
}

/// Decode into `out` and report how much input was consumed.
///
/// Used for chained decoding where several encoded streams share a buffer.
pub fn decode_extra(src: &[u8], out: &mut [u8]) -> DecodeExtra {
    let mut written = 0;
    let mut consumed = 0;
    while consumed < src.len() && written < out.len() {
        let b = src[consumed];
        if b != 0 {
            out[written] = b;
            written += 1;
            consumed += 1;
            continue;
        }

        let Some(&run) = src.get(consumed + 1) else {
            // Dangling marker; treat as end of stream
            consumed = src.len();
            break;
        };
        consumed += 2;

        let run = (run as usize).min(out.len() - written);
        out[written..written + run].fill(0);
        written += run;
    }
    DecodeExtra { written, consumed }
}

/// Size the encoded stream would decode to, without writing anything.
#[must_use]
pub fn decode_size(src: &[u8]) -> usize {
    let mut size = 0;
    let mut i = 0;
    while i < src.len() {
        if src[i] != 0 {
            size += 1;
            i += 1;
        } else {
            let Some(&run) = src.get(i + 1) else { break };
            size += run as usize;
            i += 2;
        }
    }
    size
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_input() {
        assert!(encode(&[]).is_empty());
        assert_eq!(decode_size(&[]), 0);
    }

    #[test]
    fn long_zero_run_splits() {
        let src = vec![0u8; 600];
        let coded = encode(&src);
        // 255 + 255 + 90 zeros: three marker pairs
        assert_eq!(coded, vec![0, 255, 0, 255, 0, 90]);
        assert_eq!(decode_size(&coded), 600);
    }

    #[test]
    fn zero_run_length_zero_decodes_to_nothing() {
        // A zeroed history tail looks like repeated (0x00, 0x00) pairs
        let coded = [1u8, 2, 0, 0, 0, 0];
        let mut out = [0xAAu8; 8];
        let n = decode(&coded, &mut out);
        assert_eq!(n, 2);
        assert_eq!(&out[..2], &[1, 2]);
        assert_eq!(decode_size(&coded), 2);
    }

    #[test]
    fn bounded_decode_stops_mid_run() {
        // 8-byte frame peek out of a longer stream
        let src = [5u8, 0, 0, 0, 0, 0, 0, 0, 9, 9, 9];
        let coded = encode(&src);
        let mut head = [0xFFu8; 8];
        let n = decode(&coded, &mut head);
        assert_eq!(n, 8);
        assert_eq!(head, [5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn decode_extra_reports_consumed() {
        let first = encode(&[0u8; 16]);
        let second = encode(&[7u8; 4]);
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut out = [0u8; 16];
        let extra = decode_extra(&stream, &mut out);
        assert_eq!(extra.written, 16);
        assert_eq!(extra.consumed, first.len());
        let mut rest = [0u8; 4];
        assert_eq!(decode(&stream[extra.consumed..], &mut rest), 4);
        assert_eq!(rest, [7u8; 4]);
    }

    proptest! {
        #[test]
        fn round_trip(src in prop::collection::vec(any::<u8>(), 0..4096)) {
            let coded = encode(&src);
            let mut out = vec![0xA5u8; src.len()];
            let written = decode(&coded, &mut out);
            prop_assert_eq!(written, src.len());
            prop_assert_eq!(out, src.clone());
            prop_assert_eq!(decode_size(&coded), src.len());
        }

        #[test]
        fn sparse_round_trip(
            runs in prop::collection::vec((0usize..512, any::<u8>()), 0..32),
        ) {
            // Zero-dominated input shaped like a real state ring
            let mut src = Vec::new();
            for (zeros, byte) in runs {
                src.resize(src.len() + zeros, 0);
                src.push(byte);
            }
            let coded = encode(&src);
            let mut out = vec![0xA5u8; src.len()];
            prop_assert_eq!(decode(&coded, &mut out), src.len());
            prop_assert_eq!(out, src);
        }

        #[test]
        fn decode_never_panics_on_garbage(src in prop::collection::vec(any::<u8>(), 0..1024)) {
            let mut out = [0u8; 256];
            let extra = decode_extra(&src, &mut out);
            prop_assert!(extra.written <= out.len());
            prop_assert!(extra.consumed <= src.len());
        }
    }
}
