//! Wire formats for the cadence netplay protocol.
//!
//! Every datagram starts with a channel byte (upper nibble = channel, lower
//! nibble = channel-specific flags); the body is a packed little-endian
//! struct, parsed in place with `zerocopy`. Signaling messages travel over a
//! separate reliable relay and are tagged with a fixed 8-byte ASCII header.
//!
//! This crate is layout and validation only. What a packet *means* — ring
//! updates, tick gating, membership — lives in `cadence-core`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel;
pub mod desync;
mod errors;
pub mod room;
pub mod savestate;
pub mod signaling;
pub mod state;

pub use channel::{CHANNEL_MASK, Channel, FLAGS_MASK, PACKET_SIZE_MAX};
pub use desync::DesyncPacket;
pub use errors::ProtocolError;
pub use room::{
    AUTHORITY_INDEX, PEER_AVAILABLE, PEER_UNAVAILABLE, PORT_COUNT, PORT_MAX, PORT_SENTINELS_MAX,
    Room,
};
pub use savestate::{
    FEC_REDUNDANT_BLOCKS, FRAGMENT_HEADER_SIZE, FRAGMENT_PAYLOAD_MAX, FragmentMeta,
    PACKET_GROUPS_MAX, TransferHeader,
};
pub use signaling::Signal;
pub use state::{CoreOption, DELAY_BUFFER_SIZE, DELAY_FRAMES_MAX, INPUT_WORDS, InputState, PortState};
