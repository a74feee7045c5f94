//! Multi-session step driver.
//!
//! A [`Cluster`] owns the shared clock, network, and hub plus any number of
//! peers, and advances everything in deterministic rounds. Each
//! [`Cluster::step`] models one frame interval: the clock moves one frame
//! time, then every session polls twice (the first poll can tick, the
//! second lets rings fill toward the delay target between ticks) with
//! signaling pumped in between.

use std::{cell::RefCell, rc::Rc};

use cadence_core::{
    InputPlane, PollOutcome, Session, SessionConfig, SessionError,
};
use cadence_proto::INPUT_WORDS;

use crate::{
    HubSink, SignalingHub, ToyCore, VirtualClock,
    transport::{LoopbackTransport, Network},
};

/// Polls per step; keeps rings filled to the configured delay between
/// ticks.
const POLLS_PER_STEP: usize = 2;

/// One harness-driven peer.
pub struct TestPeer {
    /// The session under test
    pub session: Session<LoopbackTransport, VirtualClock>,
    /// Its deterministic simulation
    pub core: ToyCore,
    /// Outbound signaling handle
    pub sink: HubSink,
    /// Hub-assigned peer id
    pub peer_id: u64,
    /// Input sampled for the next committed frame
    pub input: [i16; INPUT_WORDS],
    /// Serialize on every tick (keeps save hashes flowing)
    pub force_save_state: bool,
    /// Skip polling entirely (a silent peer)
    pub muted: bool,
    /// Outcome of the most recent poll
    pub last_outcome: PollOutcome,
    /// Errors surfaced by poll or signal processing
    pub errors: Vec<SessionError>,
}

impl TestPeer {
    /// Digest of the peer's simulation state.
    #[must_use]
    pub fn digest(&self) -> u64 {
        self.core.digest()
    }
}

/// Shared fixtures plus the peers they connect.
pub struct Cluster {
    /// Shared datagram fabric
    pub network: Rc<RefCell<Network>>,
    /// Shared signaling relay
    pub hub: Rc<RefCell<SignalingHub>>,
    /// Shared virtual clock
    pub clock: VirtualClock,
    /// Peers in creation order
    pub peers: Vec<TestPeer>,
    frame_time_usec: i64,
}

impl Cluster {
    /// Cluster at 60 fps with a seeded network.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            network: Rc::new(RefCell::new(Network::new(seed))),
            hub: Rc::new(RefCell::new(SignalingHub::new())),
            clock: VirtualClock::new(),
            peers: Vec::new(),
            frame_time_usec: 1_000_000 / 60,
        }
    }

    /// Create a peer with a `blob_size`-byte simulation, register it with
    /// the hub, and deliver its `conn` assignment. Returns its index.
    pub fn add_peer(&mut self, blob_size: usize, core_seed: u64) -> usize {
        let transport = LoopbackTransport::new(self.network.clone());
        let session = Session::new(transport, self.clock.clone(), SessionConfig::default());
        let peer_id = self.hub.borrow_mut().register();
        let sink = HubSink::new(self.hub.clone(), peer_id);

        self.peers.push(TestPeer {
            session,
            core: ToyCore::new(blob_size, core_seed),
            sink,
            peer_id,
            input: [0; INPUT_WORDS],
            force_save_state: true,
            muted: false,
            last_outcome: PollOutcome::default(),
            errors: Vec::new(),
        });
        self.pump_signals();
        self.peers.len() - 1
    }

    /// Route queued signaling until every queue is quiet.
    pub fn pump_signals(&mut self) {
        for _ in 0..8 {
            let mut delivered = false;
            for peer in &mut self.peers {
                // Hold the hub borrow only while draining; processing may
                // send right back into it
                let messages = self.hub.borrow_mut().drain(peer.peer_id);
                for message in messages {
                    delivered = true;
                    if let Err(error) = peer.session.process_signal(&message, &mut peer.sink) {
                        peer.errors.push(error);
                    }
                }
            }
            if !delivered {
                break;
            }
        }
    }

    /// One frame interval for the whole cluster.
    pub fn step(&mut self) {
        self.clock.advance(self.frame_time_usec);
        for _ in 0..POLLS_PER_STEP {
            for peer in &mut self.peers {
                if peer.muted {
                    continue;
                }
                let input = peer.input;
                match peer.session.poll(
                    &mut peer.core,
                    &mut peer.sink,
                    &input,
                    peer.force_save_state,
                ) {
                    Ok(outcome) => peer.last_outcome = outcome,
                    Err(error) => peer.errors.push(error),
                }
            }
            self.pump_signals();
        }
    }

    /// Run `frames` whole steps.
    pub fn run(&mut self, frames: usize) {
        for _ in 0..frames {
            self.step();
        }
    }

    /// The merged idle input plane, for tests driving cores directly.
    #[must_use]
    pub fn idle_plane() -> InputPlane {
        [[0; INPUT_WORDS]; 8]
    }
}
