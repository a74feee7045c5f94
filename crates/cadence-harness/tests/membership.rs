//! Membership churn: kicking a silent peer, voluntary leave, promotion.

mod common;

use cadence_harness::Cluster;
use cadence_proto::{PEER_AVAILABLE, room::AUTHORITY_INDEX};

#[test]
fn authority_demotes_a_silent_peer_and_resumes() {
    let mut cluster = Cluster::new(0xD00D);
    let (a, b) = common::bring_up_pair(&mut cluster, 32 * 1024);
    cluster.run(20);

    // B falls silent; the authority's gate runs out of buffered inputs
    cluster.peers[b].muted = true;
    cluster.run(10);
    let stalled_at = cluster.peers[a].session.frame_counter();
    cluster.run(3);
    assert_eq!(cluster.peers[a].session.frame_counter(), stalled_at, "gate should be stalled");

    // The authority unseats B; the delta rides its ring and unstalls the
    // gate
    let b_id = cluster.peers[b].peer_id;
    {
        let peer = &mut cluster.peers[a];
        peer.session.request_remove_peer(b_id, &mut peer.sink);
    }
    cluster.pump_signals();
    cluster.run(15);

    let room = *cluster.peers[a].session.room();
    assert_eq!(room.peer_id(0), PEER_AVAILABLE);
    assert_eq!(cluster.peers[a].session.spectator_count(), 1, "B's connection is kept parked");
    assert!(
        cluster.peers[a].session.frame_counter() >= stalled_at + 10,
        "authority never resumed"
    );
}

#[test]
fn leave_demotes_and_rejoin_promotes() {
    let mut cluster = Cluster::new(0xFEED);
    let (a, b) = common::bring_up_pair(&mut cluster, 32 * 1024);
    cluster.run(10);

    // B gives up its seat voluntarily
    let b_id = cluster.peers[b].peer_id;
    {
        let peer = &mut cluster.peers[b];
        peer.session.request_remove_peer(b_id, &mut peer.sink);
    }
    cluster.pump_signals();

    for _ in 0..30 {
        if cluster.peers[a].session.room().peer_id(0) == PEER_AVAILABLE {
            break;
        }
        cluster.step();
    }
    assert_eq!(cluster.peers[a].session.room().peer_id(0), PEER_AVAILABLE);
    assert_eq!(cluster.peers[a].session.spectator_count(), 1);
    assert!(cluster.peers[b].session.is_spectator(b_id));

    // Both keep ticking: A plays on alone, B spectates
    let frame_a = cluster.peers[a].session.frame_counter();
    cluster.run(10);
    assert!(cluster.peers[a].session.frame_counter() >= frame_a + 8);

    // B asks for a different port and is promoted from the spectator
    // region
    common::take_port(&mut cluster, b, 2, 60);
    assert_eq!(cluster.peers[a].session.room().peer_id(2), b_id);
    assert_eq!(cluster.peers[a].session.spectator_count(), 0);
    assert_eq!(cluster.peers[b].session.room().peer_id(2), b_id);

    cluster.run(20);
    let target = cluster.peers[a]
        .session
        .frame_counter()
        .max(cluster.peers[b].session.frame_counter())
        + 4;
    common::converge_at(&mut cluster, &[a, b], target, 60);
    assert_eq!(cluster.peers[a].digest(), cluster.peers[b].digest());

    // The authority slot never moved
    assert_eq!(
        cluster.peers[b].session.room().peer_id(AUTHORITY_INDEX),
        cluster.peers[a].peer_id
    );
}
