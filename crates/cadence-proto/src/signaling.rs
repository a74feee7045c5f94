//! Signaling relay messages.
//!
//! The signaling server is a reliable relay identifying peers by 64-bit ids.
//! Every message starts with an 8-byte ASCII tag — four letters of kind plus
//! the protocol version string `SM10` — followed by a fixed-layout body.
//! SDP payloads ride in a NUL-terminated 4096-byte slot.
//!
//! On `SIGN`/`SIGX` messages the `peer_id` field is directional: a sender
//! addresses the target peer, and the relay rewrites it to the source before
//! forwarding, so a receiver always sees who the signal came from.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, byteorder::little_endian::{I64, U64}};

use crate::{ProtocolError, Room};

/// Size of the ASCII message tag.
pub const SIGNAL_HEADER_SIZE: usize = 8;

/// Wire capacity of an SDP slot (terminator included).
pub const SDP_SIZE: usize = 4096;

/// Wire capacity of an error description (terminator included).
pub const ERROR_DESCRIPTION_SIZE: usize = 128;

/// `Fail` code: the authority rejected a request without a finer code.
pub const FAIL_CODE_AUTHORITY_ERROR: i64 = 2;

/// `Fail` code: no player or spectator capacity is left.
pub const FAIL_CODE_ROOM_FULL: i64 = 6;

const MAKE_HEADER: [u8; 8] = *b"MAKESM10";
const CONN_HEADER: [u8; 8] = *b"CONNSM10";
const JOIN_HEADER: [u8; 8] = *b"JOINSM10";
const SIGN_HEADER: [u8; 8] = *b"SIGNSM10";
const SIGX_HEADER: [u8; 8] = *b"SIGXSM10";
const FAIL_HEADER: [u8; 8] = *b"FAILSM10";

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ConnectMessage {
    header: [u8; 8],
    peer_id: U64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct MakeMessage {
    header: [u8; 8],
    room: Room,
}

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct JoinMessage {
    header: [u8; 8],
    peer_id: U64,
    room: Room,
}

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct SdpMessage {
    header: [u8; 8],
    peer_id: U64,
    ice_sdp: [u8; SDP_SIZE],
}

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ErrorMessage {
    header: [u8; 8],
    code: I64,
    description: [u8; ERROR_DESCRIPTION_SIZE],
    peer_id: U64,
}

/// A parsed signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Server assigns our peer id (`CONN`)
    Connect {
        /// The id the server bound to this connection
        peer_id: u64,
    },

    /// Full room record: creation request, or the server/authority's
    /// authoritative echo (`MAKE`)
    Make {
        /// Room record
        room: Room,
    },

    /// Membership change request, resolved by the room's authority (`JOIN`)
    Join {
        /// Peer whose seating the request is about
        peer_id: u64,
        /// The whole room as the requester wants it
        room: Room,
    },

    /// ICE SDP or candidate line; empty string means gathering finished
    /// (`SIGN`)
    Sdp {
        /// Target on send, source on receive
        peer_id: u64,
        /// SDP payload (at most [`SDP_SIZE`] − 1 bytes)
        sdp: String,
    },

    /// Peer signals it is disconnecting (`SIGX`); only valid from
    /// spectators
    Disconnect {
        /// Target on send, source on receive
        peer_id: u64,
    },

    /// Typed error surfaced to the application (`FAIL`)
    Fail {
        /// Peer the error concerns
        peer_id: u64,
        /// Error code
        code: i64,
        /// Human-readable description
        description: String,
    },
}

impl Signal {
    /// Serialize to the relay wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Connect { peer_id } => {
                let msg = ConnectMessage { header: CONN_HEADER, peer_id: U64::new(*peer_id) };
                Ok(msg.as_bytes().to_vec())
            }
            Self::Make { room } => {
                let msg = MakeMessage { header: MAKE_HEADER, room: *room };
                Ok(msg.as_bytes().to_vec())
            }
            Self::Join { peer_id, room } => {
                let msg =
                    JoinMessage { header: JOIN_HEADER, peer_id: U64::new(*peer_id), room: *room };
                Ok(msg.as_bytes().to_vec())
            }
            Self::Sdp { peer_id, sdp } => {
                if sdp.len() >= SDP_SIZE {
                    return Err(ProtocolError::FieldTooLong {
                        field: "ice_sdp",
                        len: sdp.len(),
                        max: SDP_SIZE,
                    });
                }
                let mut msg = SdpMessage::new_zeroed();
                msg.header = SIGN_HEADER;
                msg.peer_id = U64::new(*peer_id);
                msg.ice_sdp[..sdp.len()].copy_from_slice(sdp.as_bytes());
                Ok(msg.as_bytes().to_vec())
            }
            Self::Disconnect { peer_id } => {
                let mut msg = SdpMessage::new_zeroed();
                msg.header = SIGX_HEADER;
                msg.peer_id = U64::new(*peer_id);
                Ok(msg.as_bytes().to_vec())
            }
            Self::Fail { peer_id, code, description } => {
                if description.len() >= ERROR_DESCRIPTION_SIZE {
                    return Err(ProtocolError::FieldTooLong {
                        field: "description",
                        len: description.len(),
                        max: ERROR_DESCRIPTION_SIZE,
                    });
                }
                let mut msg = ErrorMessage::new_zeroed();
                msg.header = FAIL_HEADER;
                msg.code = I64::new(*code);
                msg.description[..description.len()].copy_from_slice(description.as_bytes());
                msg.peer_id = U64::new(*peer_id);
                Ok(msg.as_bytes().to_vec())
            }
        }
    }

    /// Parse a message from the relay.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = *bytes.first_chunk::<SIGNAL_HEADER_SIZE>().ok_or(
            ProtocolError::Truncated { expected: SIGNAL_HEADER_SIZE, actual: bytes.len() },
        )?;

        match header {
            CONN_HEADER => {
                let (msg, _) = ConnectMessage::read_from_prefix(bytes).map_err(|_| truncated::<ConnectMessage>(bytes))?;
                Ok(Self::Connect { peer_id: msg.peer_id.get() })
            }
            MAKE_HEADER => {
                let (msg, _) = MakeMessage::read_from_prefix(bytes).map_err(|_| truncated::<MakeMessage>(bytes))?;
                Ok(Self::Make { room: msg.room })
            }
            JOIN_HEADER => {
                let (msg, _) = JoinMessage::read_from_prefix(bytes).map_err(|_| truncated::<JoinMessage>(bytes))?;
                Ok(Self::Join { peer_id: msg.peer_id.get(), room: msg.room })
            }
            SIGN_HEADER => {
                let (msg, _) = SdpMessage::read_from_prefix(bytes).map_err(|_| truncated::<SdpMessage>(bytes))?;
                Ok(Self::Sdp { peer_id: msg.peer_id.get(), sdp: bounded_string(&msg.ice_sdp) })
            }
            SIGX_HEADER => {
                let (msg, _) = SdpMessage::read_from_prefix(bytes).map_err(|_| truncated::<SdpMessage>(bytes))?;
                Ok(Self::Disconnect { peer_id: msg.peer_id.get() })
            }
            FAIL_HEADER => {
                let (msg, _) = ErrorMessage::read_from_prefix(bytes).map_err(|_| truncated::<ErrorMessage>(bytes))?;
                Ok(Self::Fail {
                    peer_id: msg.peer_id.get(),
                    code: msg.code.get(),
                    description: bounded_string(&msg.description),
                })
            }
            other => Err(ProtocolError::UnknownHeader(other)),
        }
    }

    /// The peer id this message addresses or concerns, if it carries one.
    #[must_use]
    pub fn peer_id(&self) -> Option<u64> {
        match self {
            Self::Connect { peer_id }
            | Self::Join { peer_id, .. }
            | Self::Sdp { peer_id, .. }
            | Self::Disconnect { peer_id }
            | Self::Fail { peer_id, .. } => Some(*peer_id),
            Self::Make { .. } => None,
        }
    }

    /// Rewrite the directional peer id (used by relays forwarding
    /// `SIGN`/`SIGX` with the sender's id).
    pub fn set_peer_id(&mut self, id: u64) {
        match self {
            Self::Connect { peer_id }
            | Self::Join { peer_id, .. }
            | Self::Sdp { peer_id, .. }
            | Self::Disconnect { peer_id }
            | Self::Fail { peer_id, .. } => *peer_id = id,
            Self::Make { .. } => {}
        }
    }
}

fn truncated<T>(bytes: &[u8]) -> ProtocolError {
    ProtocolError::Truncated { expected: std::mem::size_of::<T>(), actual: bytes.len() }
}

fn bounded_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::AUTHORITY_INDEX;

    #[test]
    fn connect_round_trip() {
        let msg = Signal::Connect { peer_id: 0xDEAD_BEEF };
        let wire = msg.encode().unwrap();
        assert_eq!(&wire[..8], b"CONNSM10");
        assert_eq!(Signal::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn join_round_trip() {
        let mut room = Room::open("arena");
        room.set_peer_id(AUTHORITY_INDEX, 0xA11CE);
        let msg = Signal::Join { peer_id: 0xB0B, room };
        let wire = msg.encode().unwrap();
        assert_eq!(Signal::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn sdp_round_trip_and_empty_means_gathering_done() {
        let msg = Signal::Sdp { peer_id: 7, sdp: "a=candidate:1 1 UDP 2122 10.0.0.2 4444".into() };
        let wire = msg.encode().unwrap();
        assert_eq!(Signal::decode(&wire).unwrap(), msg);

        let done = Signal::Sdp { peer_id: 7, sdp: String::new() };
        let wire = done.encode().unwrap();
        assert_eq!(Signal::decode(&wire).unwrap(), done);
    }

    #[test]
    fn disconnect_round_trip() {
        let msg = Signal::Disconnect { peer_id: 9 };
        let wire = msg.encode().unwrap();
        assert_eq!(&wire[..8], b"SIGXSM10");
        assert_eq!(Signal::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn fail_round_trip() {
        let msg = Signal::Fail { peer_id: 3, code: 2, description: "port unavailable".into() };
        let wire = msg.encode().unwrap();
        assert_eq!(Signal::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn oversized_sdp_rejected() {
        let msg = Signal::Sdp { peer_id: 1, sdp: "x".repeat(SDP_SIZE) };
        assert!(msg.encode().is_err());
    }

    #[test]
    fn unknown_header_rejected() {
        assert!(matches!(
            Signal::decode(b"NOPESM10........"),
            Err(ProtocolError::UnknownHeader(_))
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let wire = Signal::Connect { peer_id: 1 }.encode().unwrap();
        assert!(Signal::decode(&wire[..10]).is_err());
    }
}
