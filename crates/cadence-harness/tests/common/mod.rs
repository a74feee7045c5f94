//! Shared bring-up helpers for the scenario tests.

use cadence_core::WAITING_FOR_SAVE_STATE_SENTINEL;
use cadence_harness::Cluster;

/// Create a room through the hub and adopt the hosted reply.
pub fn create_room(cluster: &mut Cluster, index: usize, name: &str) {
    let peer = &mut cluster.peers[index];
    peer.session.request_create_room(name, &mut peer.sink);
    cluster.pump_signals();
    assert!(cluster.peers[index].session.room().is_hosted());
}

/// Start spectating `name` (dials the authority).
pub fn spectate(cluster: &mut Cluster, index: usize, name: &str) {
    let room = cluster.hub.borrow().room(name).unwrap();
    let peer = &mut cluster.peers[index];
    peer.session.connect_to_room(room, &mut peer.sink).unwrap();
    cluster.pump_signals();
}

/// Step until the peer has loaded a save state.
pub fn wait_for_sync(cluster: &mut Cluster, index: usize, max_steps: usize) {
    for _ in 0..max_steps {
        if cluster.peers[index].session.frame_counter() != WAITING_FOR_SAVE_STATE_SENTINEL {
            return;
        }
        cluster.step();
    }
    panic!("peer {index} never received a save state");
}

/// Request `port` and step until the seat is granted on both ends.
pub fn take_port(cluster: &mut Cluster, index: usize, port: usize, max_steps: usize) {
    {
        let peer = &mut cluster.peers[index];
        peer.session.request_port(port, &mut peer.sink);
    }
    cluster.pump_signals();

    let peer_id = cluster.peers[index].peer_id;
    for _ in 0..max_steps {
        if cluster.peers[index].session.room().peer_id(port) == peer_id {
            return;
        }
        cluster.step();
    }
    panic!("peer {index} never got port {port}");
}

/// Bring a two-peer room up: peer 0 hosts, peer 1 syncs and takes port 0.
pub fn bring_up_pair(cluster: &mut Cluster, blob_size: usize) -> (usize, usize) {
    let authority = cluster.add_peer(blob_size, 0xA);
    create_room(cluster, authority, "arena");
    cluster.run(5);

    let client = cluster.add_peer(blob_size, 0xB);
    spectate(cluster, client, "arena");
    wait_for_sync(cluster, client, 60);
    take_port(cluster, client, 0, 60);

    (authority, client)
}

/// Park every listed peer exactly at `target` (muting each one as it
/// arrives) so their simulations can be compared at the same frame.
pub fn converge_at(cluster: &mut Cluster, indices: &[usize], target: i64, max_steps: usize) {
    for _ in 0..max_steps {
        let mut all_parked = true;
        for &index in indices {
            let peer = &mut cluster.peers[index];
            if peer.session.frame_counter() >= target {
                peer.muted = true;
            } else {
                all_parked = false;
            }
        }
        if all_parked {
            return;
        }
        cluster.step();
    }
    let frames: Vec<i64> =
        indices.iter().map(|&i| cluster.peers[i].session.frame_counter()).collect();
    panic!("peers never converged at {target}: {frames:?}");
}
