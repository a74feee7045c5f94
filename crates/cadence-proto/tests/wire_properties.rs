//! Property tests for the wire formats.

use cadence_proto::{
    DELAY_BUFFER_SIZE, DesyncPacket, PORT_COUNT, PortState, Room, Signal,
    room::AUTHORITY_INDEX,
    savestate::{decode_fragment_header, encode_fragment_header, FULL_K},
};
use proptest::prelude::*;
use zerocopy::{FromBytes, IntoBytes};

fn arbitrary_room() -> impl Strategy<Value = Room> {
    (
        "[a-z]{0,16}",
        prop::collection::vec(any::<u64>(), PORT_COUNT),
        any::<u64>(),
    )
        .prop_map(|(name, peers, flags)| {
            let mut room = Room::default();
            room.set_name(&name);
            for (port, id) in peers.into_iter().enumerate() {
                room.set_peer_id(port, id);
            }
            room.set_flags(flags);
            room
        })
}

proptest! {
    #[test]
    fn room_bytes_round_trip(room in arbitrary_room()) {
        let parsed = Room::read_from(room.as_bytes()).unwrap();
        prop_assert_eq!(parsed, room);
    }

    #[test]
    fn room_xor_is_an_involution(a in arbitrary_room(), b in arbitrary_room()) {
        let mut delta = a;
        delta.xor(&b);
        prop_assert_eq!(a.xored(&delta), b);
        prop_assert_eq!(b.xored(&delta), a);
    }

    #[test]
    fn signal_round_trip(msg in arbitrary_signal()) {
        let wire = msg.encode().unwrap();
        prop_assert_eq!(Signal::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn fragment_header_round_trip(
        k in 1usize..=FULL_K,
        groups in 1usize..=16,
        block in 0usize..255,
    ) {
        // k below full implies a single group by construction
        let groups = if k == FULL_K { groups } else { 1 };
        let group = groups - 1;
        let header = encode_fragment_header(k, groups, group, block);
        let meta = decode_fragment_header(&header).unwrap();
        prop_assert_eq!(meta.k, k);
        prop_assert_eq!(meta.block as usize, block);
        if group == 0 {
            prop_assert_eq!(meta.announced_groups, Some(groups as u8));
        } else {
            prop_assert_eq!(meta.group as usize, group);
        }
    }

    #[test]
    fn port_state_survives_byte_copy(
        frame in 0i64..1_000_000,
        port in 0usize..PORT_COUNT,
        word in 0usize..8,
        value in any::<i16>(),
    ) {
        let mut state = PortState::default();
        state.set_frame(frame);
        let slot = PortState::slot(frame);
        state.input_mut(slot, port)[word] = value.into();

        let copy = PortState::read_from_bytes(state.as_bytes()).unwrap();
        prop_assert_eq!(copy.frame(), frame);
        prop_assert_eq!(copy.input(slot, port)[word].get(), value);
    }

    #[test]
    fn desync_packet_round_trip(
        frame in 0i64..1_000_000,
        hashes in prop::collection::vec(any::<i64>(), DELAY_BUFFER_SIZE),
    ) {
        let mut packet = DesyncPacket::new();
        packet.set_frame(frame);
        for (slot, hash) in hashes.iter().enumerate() {
            packet.set_save_hash(slot, *hash);
            packet.set_input_hash(slot, hash.wrapping_mul(31));
        }
        let parsed = DesyncPacket::read_from(packet.as_bytes()).unwrap();
        prop_assert_eq!(parsed.frame(), frame);
        for (slot, hash) in hashes.iter().enumerate() {
            prop_assert_eq!(parsed.save_hash(slot), *hash);
            prop_assert_eq!(parsed.input_hash(slot), hash.wrapping_mul(31));
        }
    }
}

fn arbitrary_signal() -> impl Strategy<Value = Signal> {
    let peer = 2u64..u64::MAX;
    prop_oneof![
        peer.clone().prop_map(|peer_id| Signal::Connect { peer_id }),
        arbitrary_room().prop_map(|room| Signal::Make { room }),
        (peer.clone(), arbitrary_room()).prop_map(|(peer_id, room)| Signal::Join { peer_id, room }),
        (peer.clone(), "[ -~]{0,64}").prop_map(|(peer_id, sdp)| Signal::Sdp { peer_id, sdp }),
        peer.clone().prop_map(|peer_id| Signal::Disconnect { peer_id }),
        (peer, any::<i64>(), "[ -~]{0,32}").prop_map(|(peer_id, code, description)| {
            Signal::Fail { peer_id, code, description }
        }),
    ]
}

#[test]
fn authority_is_the_last_port() {
    assert_eq!(AUTHORITY_INDEX, PORT_COUNT - 1);
}
