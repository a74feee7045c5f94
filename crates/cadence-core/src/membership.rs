//! Membership resolution over the room-delta stream.
//!
//! Only the authority mutates the room. Requests arrive as `join` signaling
//! messages carrying the whole room as the requester wants it; the resolver
//! turns each request into an XOR delta against the authority's *future*
//! room — the current room with every already-committed delta and the
//! pending accumulator applied — so that back-to-back requests compose
//! instead of clobbering each other.
//!
//! Every peer (authority included) then applies the committed delta for
//! frame `f` at `f`'s tick boundary, which makes membership changes land on
//! the same frame everywhere. [`diff_rooms`] turns the before/after pair
//! into the transition actions the session executes.

use cadence_proto::{
    PEER_AVAILABLE, PORT_COUNT, Room,
    room::CLIENT_PERMISSION_MASK,
};

/// Outcome of resolving one `join` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResolution {
    /// Request is valid; XOR this delta into the pending accumulator and
    /// announce the resulting room
    Commit {
        /// Delta against the future room
        delta: Room,
        /// The future room with the delta applied (for the `make` announce)
        target: Room,
    },

    /// Request changed nothing worth committing
    NoChange,

    /// Requester's room record does not match the room we host
    RejectRoomMismatch,

    /// Request is neither a join, a move, nor a leave
    RejectUnsupported,

    /// Requested port is not open
    RejectPortUnavailable {
        /// The port that was asked for
        port: usize,
    },
}

/// Resolve a `join` request from `peer_id` against the authority's
/// projected `future_room`.
#[must_use]
pub fn resolve_join(future_room: &Room, requested: &Room, peer_id: u64) -> JoinResolution {
    if !future_room.same_room(requested) {
        return JoinResolution::RejectRoomMismatch;
    }

    let current_port = future_room.port_of_peer(peer_id);
    let desired_port = requested.port_of_peer(peer_id);

    let mut delta = Room::default();

    match (current_port, desired_port) {
        (Some(port), None) => {
            tracing::info!(peer_id = format_args!("{peer_id:#x}"), port, "peer leaving");
            delta.set_peer_id(port, future_room.peer_id(port) ^ PEER_AVAILABLE);
        }
        (None, None) => return JoinResolution::RejectUnsupported,
        (current, Some(desired)) if current != Some(desired) => {
            if future_room.peer_id(desired) != PEER_AVAILABLE {
                return JoinResolution::RejectPortUnavailable { port: desired };
            }
            delta.set_peer_id(desired, future_room.peer_id(desired) ^ peer_id);
            if let Some(vacated) = current {
                delta.set_peer_id(vacated, future_room.peer_id(vacated) ^ PEER_AVAILABLE);
            }
        }
        _ => {}
    }

    // A peer may flip its own client-permission flags in the same request
    delta.set_flags((future_room.flags() ^ requested.flags()) & CLIENT_PERMISSION_MASK);

    if delta.is_zero() {
        return JoinResolution::NoChange;
    }

    let target = future_room.xored(&delta);
    JoinResolution::Commit { delta, target }
}

/// One observable difference between two room states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomChange {
    /// Our own id appeared at a port (we were admitted)
    WeJoined {
        /// Port we now occupy
        port: usize,
    },

    /// Our own id was removed from its port
    WeWereRemoved,

    /// Another peer's port became a sentinel
    PeerLeft {
        /// Vacated port
        port: usize,
        /// The peer that held it
        peer_id: u64,
    },

    /// A real peer id appeared at a port (fresh join or promotion)
    PeerSeated {
        /// Newly occupied port
        port: usize,
        /// The peer now seated there
        peer_id: u64,
    },
}

/// Diff two room states into the transitions the session must execute.
///
/// Being admitted ourselves subsumes the per-port changes: the session
/// reacts by seeding its ring and dialing every seated peer, so only
/// [`RoomChange::WeJoined`] is reported in that case.
#[must_use]
pub fn diff_rooms(old: &Room, new: &Room, our_peer_id: u64) -> Vec<RoomChange> {
    let mut changes = Vec::new();

    if old.port_of_peer(our_peer_id).is_none() {
        if let Some(port) = new.port_of_peer(our_peer_id) {
            return vec![RoomChange::WeJoined { port }];
        }
    }

    for port in 0..PORT_COUNT {
        let before = old.peer_id(port);
        let after = new.peer_id(port);
        if before == after {
            continue;
        }

        if old.port_occupied(port) && !new.port_occupied(port) {
            if before == our_peer_id {
                changes.push(RoomChange::WeWereRemoved);
            } else {
                changes.push(RoomChange::PeerLeft { port, peer_id: before });
            }
        } else if new.port_occupied(port) && after != our_peer_id {
            changes.push(RoomChange::PeerSeated { port, peer_id: after });
        }
    }

    changes
}
