//! Error types for wire parsing.

use thiserror::Error;

/// Errors produced while parsing or building wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than the fixed layout requires
    #[error("message too short: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the layout requires
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Signaling header tag is not one of the known message kinds
    #[error("unknown signaling header {0:?}")]
    UnknownHeader([u8; 8]),

    /// Channel nibble does not name a known channel
    #[error("unknown channel byte {0:#04x}")]
    UnknownChannel(u8),

    /// A bounded string field would not fit its wire slot
    #[error("{field} too long: {len} bytes exceeds {max}")]
    FieldTooLong {
        /// Field name
        field: &'static str,
        /// Actual length
        len: usize,
        /// Wire capacity (including the NUL terminator)
        max: usize,
    },

    /// Save-state fragment names a packet group beyond the protocol maximum
    #[error("packet group {0} out of range")]
    PacketGroupOutOfRange(u8),
}
