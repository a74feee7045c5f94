//! In-memory signaling relay.
//!
//! Stands in for the signaling server: assigns peer ids, keeps the room
//! registry, routes `join` requests to the room's authority, and rewrites
//! the directional peer id on forwarded `sign`/`sigx` messages so receivers
//! see who a signal came from. Reliable and ordered, like the real relay.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use cadence_core::SignalSink;
use cadence_proto::{Room, Signal, room::{AUTHORITY_INDEX, FLAG_ROOM_IS_NETWORK_HOSTED}};

/// The relay: peer registry, room registry, per-peer delivery queues.
#[derive(Debug, Default)]
pub struct SignalingHub {
    next_peer_id: u64,
    rooms: HashMap<String, Room>,
    queues: HashMap<u64, VecDeque<Signal>>,
}

impl SignalingHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self { next_peer_id: 0x100, rooms: HashMap::new(), queues: HashMap::new() }
    }

    /// Register a connection: assigns a peer id and queues the `conn`
    /// message for it.
    pub fn register(&mut self) -> u64 {
        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;
        let queue = self.queues.entry(peer_id).or_default();
        queue.push_back(Signal::Connect { peer_id });
        peer_id
    }

    /// Current registry record for a room.
    #[must_use]
    pub fn room(&self, name: &str) -> Option<Room> {
        self.rooms.get(name).copied()
    }

    /// Accept one message from `from` and route it.
    pub fn send_from(&mut self, from: u64, message: &Signal) {
        match message {
            Signal::Make { room } => {
                let mut room = *room;
                room.set_flags(room.flags() | FLAG_ROOM_IS_NETWORK_HOSTED);
                let name = room.name().into_owned();
                let created = !self.rooms.contains_key(&name);
                self.rooms.insert(name, room);
                if created {
                    self.queue_to(from, Signal::Make { room });
                }
            }

            Signal::Join { peer_id, room } => {
                let authority = self
                    .rooms
                    .get(room.name().as_ref())
                    .map_or(room.peer_id(AUTHORITY_INDEX), |known| {
                        known.peer_id(AUTHORITY_INDEX)
                    });
                self.queue_to(authority, Signal::Join { peer_id: *peer_id, room: *room });
            }

            Signal::Sdp { peer_id, sdp } => {
                self.queue_to(*peer_id, Signal::Sdp { peer_id: from, sdp: sdp.clone() });
            }

            Signal::Disconnect { peer_id } => {
                self.queue_to(*peer_id, Signal::Disconnect { peer_id: from });
            }

            Signal::Fail { peer_id, code, description } => {
                self.queue_to(
                    *peer_id,
                    Signal::Fail {
                        peer_id: *peer_id,
                        code: *code,
                        description: description.clone(),
                    },
                );
            }

            Signal::Connect { .. } => {
                tracing::warn!(from, "client sent a conn message; ignored");
            }
        }
    }

    /// Take everything queued for `peer_id`.
    pub fn drain(&mut self, peer_id: u64) -> Vec<Signal> {
        self.queues.get_mut(&peer_id).map(|queue| queue.drain(..).collect()).unwrap_or_default()
    }

    fn queue_to(&mut self, peer_id: u64, message: Signal) {
        self.queues.entry(peer_id).or_default().push_back(message);
    }
}

/// A session's outbound handle onto the hub.
#[derive(Debug, Clone)]
pub struct HubSink {
    hub: Rc<RefCell<SignalingHub>>,
    from: u64,
}

impl HubSink {
    /// Sink sending as `from`.
    #[must_use]
    pub fn new(hub: Rc<RefCell<SignalingHub>>, from: u64) -> Self {
        Self { hub, from }
    }
}

impl SignalSink for HubSink {
    fn signal_send(&mut self, message: &Signal) {
        self.hub.borrow_mut().send_from(self.from, message);
    }
}
