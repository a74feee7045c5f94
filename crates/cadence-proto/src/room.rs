//! The replicated room record.
//!
//! A room maps eight logical ports to peer ids (the last port is the
//! authority's) and carries a flag bitfield. Only the authority mutates the
//! room; every other peer converges by XORing the deltas the authority
//! commits into its state ring. The XOR representation is what makes
//! membership changes frame-precise: a delta is applied by every peer at the
//! same tick boundary, so all replicas move through identical states.

use std::borrow::Cow;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, byteorder::little_endian::U64};

use crate::ProtocolError;

/// Highest port index; also the authority's port.
pub const PORT_MAX: usize = 7;

/// Total ports, authority included.
pub const PORT_COUNT: usize = PORT_MAX + 1;

/// The distinguished port owned by the room's authority.
pub const AUTHORITY_INDEX: usize = PORT_MAX;

/// Sentinel: port cannot be joined.
pub const PEER_UNAVAILABLE: u64 = 0;

/// Sentinel: port is open for a joiner.
pub const PEER_AVAILABLE: u64 = 1;

/// Peer-id values at or below this are sentinels, not peers.
pub const PORT_SENTINELS_MAX: u64 = 1;

/// Wire size of the bounded name fields.
pub const ROOM_STRING_SIZE: usize = 64;

/// Flag: the peer asks to sit out of the port map and spectate.
pub const FLAG_SPECTATOR: u64 = 1 << 0;

/// Flag: the peer requests relayed (TURN) connectivity.
pub const FLAG_FORCE_TURN: u64 = 1 << 1;

/// Flag: clients are not limited to setting input on their bound port.
pub const FLAG_NO_FIXED_PORT: u64 = 1 << 2;

/// Flag: peers may surface each other's addresses in a frontend.
pub const FLAG_ALLOW_SHOW_IP: u64 = 1 << 3;

/// Flag: the authority is reachable over IPv6.
pub const FLAG_AUTHORITY_IPV6: u64 = 1 << 4;

/// Flag: the room is live on the network (set while a session runs).
pub const FLAG_ROOM_IS_NETWORK_HOSTED: u64 = 1 << 5;

/// Flag for port 0 sitting out of input; shift left by the port index for
/// the other ports (bits 8..16).
pub const FLAG_PORT0_PEER_IS_INACTIVE: u64 = 1 << 8;

/// Flag bits only the signaling server may change.
pub const SERVER_PERMISSION_MASK: u64 = FLAG_AUTHORITY_IPV6 | FLAG_ROOM_IS_NETWORK_HOSTED;

/// Flag bits only the authority may change.
pub const AUTHORITY_PERMISSION_MASK: u64 = FLAG_NO_FIXED_PORT | FLAG_ALLOW_SHOW_IP;

/// Flag bits a client may change about its own record.
pub const CLIENT_PERMISSION_MASK: u64 = FLAG_SPECTATOR | FLAG_FORCE_TURN;

/// Replicated membership record (200 bytes on the wire, little-endian).
///
/// # Invariants
///
/// - Every non-sentinel entry of `peer_ids` is unique.
/// - `peer_ids[AUTHORITY_INDEX]` is a real peer whenever
///   [`FLAG_ROOM_IS_NETWORK_HOSTED`] is set.
/// - Strings are UTF-8, NUL-terminated inside their fixed slots.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Room {
    name: [u8; ROOM_STRING_SIZE],
    turn_hostname: [u8; ROOM_STRING_SIZE],
    peer_ids: [U64; PORT_COUNT],
    flags: U64,
}

impl Room {
    /// Wire size (200 bytes).
    pub const SIZE: usize = 2 * ROOM_STRING_SIZE + 8 * PORT_COUNT + 8;

    /// A named room with every port open and no authority seated yet.
    #[must_use]
    pub fn open(name: &str) -> Self {
        let mut room = Self::new_zeroed();
        room.set_name(name);
        for port in 0..PORT_COUNT {
            room.set_peer_id(port, PEER_AVAILABLE);
        }
        room
    }

    /// Parse a room from the front of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::read_from_prefix(bytes)
            .map(|(room, _)| room)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })
    }

    /// Room name up to the first NUL.
    #[must_use]
    pub fn name(&self) -> Cow<'_, str> {
        string_field(&self.name)
    }

    /// Set the room name, truncated to fit the wire slot with its NUL.
    pub fn set_name(&mut self, name: &str) {
        set_string_field(&mut self.name, name);
    }

    /// Optional TURN relay hostname.
    #[must_use]
    pub fn turn_hostname(&self) -> Cow<'_, str> {
        string_field(&self.turn_hostname)
    }

    /// Set the TURN relay hostname.
    pub fn set_turn_hostname(&mut self, hostname: &str) {
        set_string_field(&mut self.turn_hostname, hostname);
    }

    /// Peer id (or sentinel) seated at `port`.
    #[must_use]
    pub fn peer_id(&self, port: usize) -> u64 {
        self.peer_ids[port].get()
    }

    /// Seat `peer_id` at `port`.
    pub fn set_peer_id(&mut self, port: usize, peer_id: u64) {
        self.peer_ids[port] = U64::new(peer_id);
    }

    /// Flag bitfield.
    #[must_use]
    pub fn flags(&self) -> u64 {
        self.flags.get()
    }

    /// Replace the flag bitfield.
    pub fn set_flags(&mut self, flags: u64) {
        self.flags = U64::new(flags);
    }

    /// Whether the room is live on the network.
    #[must_use]
    pub fn is_hosted(&self) -> bool {
        self.flags() & FLAG_ROOM_IS_NETWORK_HOSTED != 0
    }

    /// Whether `port` is bound to a real peer (not a sentinel).
    #[must_use]
    pub fn port_occupied(&self, port: usize) -> bool {
        self.peer_id(port) > PORT_SENTINELS_MAX
    }

    /// Whether the peer on `port` asked to sit out of input.
    #[must_use]
    pub fn port_inactive(&self, port: usize) -> bool {
        self.flags() & (FLAG_PORT0_PEER_IS_INACTIVE << port) != 0
    }

    /// Port currently bound to `peer_id`, if any.
    #[must_use]
    pub fn port_of_peer(&self, peer_id: u64) -> Option<usize> {
        if peer_id <= PORT_SENTINELS_MAX {
            return None;
        }
        (0..PORT_COUNT).find(|&p| self.peer_id(p) == peer_id)
    }

    /// Whether two records describe the same room: same authority, same name.
    #[must_use]
    pub fn same_room(&self, other: &Self) -> bool {
        self.peer_id(AUTHORITY_INDEX) == other.peer_id(AUTHORITY_INDEX) && self.name == other.name
    }

    /// XOR `delta` into this record byte-wise.
    pub fn xor(&mut self, delta: &Self) {
        let delta = delta.as_bytes().to_owned();
        for (dst, src) in self.as_mut_bytes().iter_mut().zip(delta) {
            *dst ^= src;
        }
    }

    /// This record XORed with `delta`, as a new value.
    #[must_use]
    pub fn xored(&self, delta: &Self) -> Self {
        let mut out = *self;
        out.xor(delta);
        out
    }

    /// Whether every byte is zero (the identity delta).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

// Manual implementations: derives would take references into the packed repr
impl PartialEq for Room {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Room {}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers: Vec<u64> = (0..PORT_COUNT).map(|p| self.peer_id(p)).collect();
        f.debug_struct("Room")
            .field("name", &self.name())
            .field("peer_ids", &peers)
            .field("flags", &format_args!("{:#x}", self.flags()))
            .finish_non_exhaustive()
    }
}

fn string_field(field: &[u8]) -> Cow<'_, str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end])
}

fn set_string_field(field: &mut [u8], value: &str) {
    field.fill(0);
    let len = value.len().min(field.len() - 1);
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size() {
        assert_eq!(std::mem::size_of::<Room>(), Room::SIZE);
        assert_eq!(Room::SIZE, 200);
    }

    #[test]
    fn open_room_has_open_ports() {
        let room = Room::open("arena");
        assert_eq!(room.name(), "arena");
        for p in 0..PORT_COUNT {
            assert_eq!(room.peer_id(p), PEER_AVAILABLE);
            assert!(!room.port_occupied(p));
        }
    }

    #[test]
    fn xor_delta_round_trips() {
        let mut room = Room::open("arena");
        room.set_peer_id(AUTHORITY_INDEX, 0xA11CE);
        room.set_flags(FLAG_ROOM_IS_NETWORK_HOSTED);

        let mut target = room;
        target.set_peer_id(0, 0xB0B);

        let mut delta = room;
        delta.xor(&target);
        assert!(!delta.is_zero());

        let converged = room.xored(&delta);
        assert_eq!(converged, target);
        // Applying the same delta again undoes it
        assert_eq!(converged.xored(&delta), room);
    }

    #[test]
    fn port_lookup_ignores_sentinels() {
        let room = Room::open("arena");
        assert_eq!(room.port_of_peer(PEER_AVAILABLE), None);
        assert_eq!(room.port_of_peer(PEER_UNAVAILABLE), None);

        let mut room = room;
        room.set_peer_id(3, 0xC0FFEE);
        assert_eq!(room.port_of_peer(0xC0FFEE), Some(3));
    }

    #[test]
    fn same_room_compares_authority_and_name() {
        let mut a = Room::open("arena");
        a.set_peer_id(AUTHORITY_INDEX, 0xA11CE);
        let mut b = a;
        b.set_peer_id(0, 0xB0B);
        assert!(a.same_room(&b));

        let mut c = a;
        c.set_name("other");
        assert!(!a.same_room(&c));
    }

    #[test]
    fn long_name_is_truncated_with_nul() {
        let mut room = Room::default();
        room.set_name(&"x".repeat(200));
        assert_eq!(room.name().len(), ROOM_STRING_SIZE - 1);
    }
}
