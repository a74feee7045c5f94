//! Error types for the session engine.
//!
//! Variants group into the failure kinds the poll loop distinguishes:
//! protocol violations (offending peer is reported and disconnected),
//! integrity failures (in-progress transfer is discarded, session waits for
//! a retry), transport failures (peer is dropped; an authority failure
//! resets the session), and local faults (logged and dropped in release).
//! Out-of-order or stale packets are not errors at all; handlers drop them
//! silently.

use cadence_codec::CodecError;
use cadence_proto::ProtocolError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Packet claimed a source port other than the one it arrived on
    #[error("source port mismatch: claimed {claimed}, arrived on slot {arrived}")]
    SourcePortMismatch {
        /// Port index encoded in the packet
        claimed: usize,
        /// Agent slot the datagram arrived on
        arrived: usize,
    },

    /// Peer signaled disconnect while still seated at a port
    #[error("peer {peer_id:#x} signaled disconnect while seated at port {port}")]
    DisconnectWhileSeated {
        /// Seated port
        port: usize,
        /// Offending peer
        peer_id: u64,
    },

    /// Datagram arrived on a channel that must never carry traffic
    #[error("datagram on reserved channel {0:#04x}")]
    ReservedChannel(u8),

    /// State packet body does not decode to a whole state ring
    #[error("state packet decodes to {decoded} bytes, expected {expected}")]
    MalformedStatePacket {
        /// Size the RLE stream decodes to
        decoded: usize,
        /// Wire size of a state ring
        expected: usize,
    },

    /// Signal addressed a peer this session has no business with
    #[error("signal for unknown peer {peer_id:#x} while not the authority")]
    UnknownSignalTarget {
        /// Peer the signal named
        peer_id: u64,
    },

    /// Join request described a different room than the authority hosts
    #[error("join request names a different room")]
    RoomMismatch,

    /// Operation requires a network-hosted room
    #[error("room is not network hosted")]
    RoomNotHosted,

    /// Reassembled transfer failed its content hash
    #[error("save-state hash mismatch: computed {computed:#018x}, claimed {claimed:#018x}")]
    TransferHashMismatch {
        /// Hash computed over the reassembled payload
        computed: u64,
        /// Hash the payload header claimed
        claimed: u64,
    },

    /// Transfer payload header claims an impossible size
    #[error("transfer size {size} outside valid range (max {max})")]
    TransferSizeOutOfBounds {
        /// Claimed size
        size: i64,
        /// Upper bound derived from the received blocks
        max: usize,
    },

    /// The simulation refused the reassembled save state
    #[error("simulation rejected the transferred save state")]
    StateLoadFailed,

    /// The simulation failed to serialize its state; surfaced through
    /// `Session::take_local_fault`
    #[error("simulation failed to serialize {size} bytes")]
    StateSaveFailed {
        /// Size the simulation reported
        size: usize,
    },

    /// Encoded state ring would exceed the datagram size limit; surfaced
    /// through `Session::take_local_fault`
    #[error("state packet of {size} bytes exceeds the {max}-byte datagram limit")]
    PacketTooLarge {
        /// Encoded size including the channel byte
        size: usize,
        /// Datagram limit
        max: usize,
    },

    /// No spectator slot is left for a connecting peer
    #[error("spectator region is full")]
    SpectatorsFull,

    /// Error relayed from a remote peer or the signaling server
    #[error("remote failure {code}: {description}")]
    Remote {
        /// Error code from the `fail` message
        code: i64,
        /// Human-readable description
        description: String,
    },

    /// Codec-level failure (zstd, erasure coding)
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Wire parsing failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}
