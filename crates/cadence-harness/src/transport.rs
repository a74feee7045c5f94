//! In-memory datagram fabric with ICE-shaped pairing.
//!
//! Agents exchange fake SDP lines (`a=ice:<endpoint>` descriptions and
//! `a=candidate:<endpoint>` candidates) through the signaling path exactly
//! like real agents would; once two endpoints point at each other the link
//! comes up and datagrams flow, delivered on the next [`Transport::drive`].
//! A seeded RNG can drop state packets (channel `0x10`) at a configured
//! rate to model lossy links without breaking transfers.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc, time::Duration};

use bytes::Bytes;
use cadence_core::{AgentEvent, AgentState, PeerAgent, Transport, TransportError};
use cadence_proto::CHANNEL_MASK;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INPUT_CHANNEL: u8 = 0x10;

#[derive(Debug)]
struct Endpoint {
    remote: Option<u64>,
    state: AgentState,
    events: std::collections::VecDeque<AgentEvent>,
    gathered: bool,
    remote_gathering_done: bool,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            remote: None,
            state: AgentState::New,
            events: std::collections::VecDeque::new(),
            gathered: false,
            remote_gathering_done: false,
        }
    }
}

/// Endpoints a fabric carries before `open` starts failing; plenty for any
/// scenario while keeping the cap reachable in tests.
const DEFAULT_ENDPOINT_LIMIT: usize = 256;

/// The shared fabric connecting every loopback agent in a test.
#[derive(Debug)]
pub struct Network {
    endpoints: BTreeMap<u64, Endpoint>,
    in_flight: Vec<(u64, Vec<u8>)>,
    next_endpoint_id: u64,
    endpoint_limit: usize,
    rng: ChaCha8Rng,
    input_loss_rate: f64,
}

impl Network {
    /// Fresh fabric with a seeded RNG for reproducible loss.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            endpoints: BTreeMap::new(),
            in_flight: Vec::new(),
            next_endpoint_id: 1,
            endpoint_limit: DEFAULT_ENDPOINT_LIMIT,
            rng: ChaCha8Rng::seed_from_u64(seed),
            input_loss_rate: 0.0,
        }
    }

    /// Drop this fraction of state packets (channel `0x10`) network-wide.
    pub fn set_input_loss_rate(&mut self, rate: f64) {
        self.input_loss_rate = rate.clamp(0.0, 1.0);
    }

    /// Cap the number of live endpoints; further `open`s fail with
    /// [`TransportError::AgentLimit`].
    pub fn set_endpoint_limit(&mut self, limit: usize) {
        self.endpoint_limit = limit;
    }

    /// Force an endpoint into the failed state, as a broken path would.
    pub fn fail_endpoint(&mut self, endpoint: u64) {
        if let Some(ep) = self.endpoints.get_mut(&endpoint) {
            ep.state = AgentState::Failed;
            ep.events.push_back(AgentEvent::StateChanged(AgentState::Failed));
        }
    }

    fn open_endpoint(&mut self) -> Result<u64, TransportError> {
        if self.endpoints.len() >= self.endpoint_limit {
            return Err(TransportError::AgentLimit);
        }
        let id = self.next_endpoint_id;
        self.next_endpoint_id += 1;
        self.endpoints.insert(id, Endpoint::new());
        Ok(id)
    }

    fn close_endpoint(&mut self, endpoint: u64) {
        self.endpoints.remove(&endpoint);
        for ep in self.endpoints.values_mut() {
            if ep.remote == Some(endpoint) && ep.state != AgentState::Failed {
                ep.state = AgentState::Failed;
                ep.events.push_back(AgentEvent::StateChanged(AgentState::Failed));
            }
        }
    }

    fn send_from(&mut self, from: u64, datagram: &[u8]) -> Result<(), TransportError> {
        let endpoint = self
            .endpoints
            .get(&from)
            .ok_or_else(|| TransportError::Send("endpoint closed".to_string()))?;
        let Some(to) = endpoint.remote else {
            return Err(TransportError::Send("no remote endpoint".to_string()));
        };

        let is_input = datagram.first().is_some_and(|&b| b & CHANNEL_MASK == INPUT_CHANNEL);
        if is_input
            && self.input_loss_rate > 0.0
            && self.rng.gen_range(0.0..1.0) < self.input_loss_rate
        {
            return Ok(());
        }

        self.in_flight.push((to, datagram.to_vec()));
        Ok(())
    }

    /// Advance link states and deliver queued datagrams.
    pub fn deliver(&mut self) {
        let ids: Vec<u64> = self.endpoints.keys().copied().collect();
        for id in ids {
            let Some(endpoint) = self.endpoints.get(&id) else { continue };
            let Some(remote) = endpoint.remote else { continue };
            let mutual =
                self.endpoints.get(&remote).is_some_and(|other| other.remote == Some(id));
            if !mutual {
                continue;
            }

            let Some(endpoint) = self.endpoints.get_mut(&id) else { continue };
            match endpoint.state {
                AgentState::New | AgentState::Gathering => {
                    endpoint.state = AgentState::Connected;
                    endpoint.events.push_back(AgentEvent::StateChanged(AgentState::Connected));
                }
                AgentState::Connected if endpoint.remote_gathering_done && endpoint.gathered => {
                    endpoint.state = AgentState::Completed;
                    endpoint.events.push_back(AgentEvent::StateChanged(AgentState::Completed));
                }
                _ => {}
            }
        }

        for (to, datagram) in std::mem::take(&mut self.in_flight) {
            if let Some(endpoint) = self.endpoints.get_mut(&to) {
                endpoint.events.push_back(AgentEvent::Datagram(Bytes::from(datagram)));
            }
        }
    }
}

fn parse_endpoint(sdp: &str, prefix: &str) -> Result<u64, TransportError> {
    sdp.strip_prefix(prefix)
        .and_then(|rest| rest.parse::<u64>().ok())
        .ok_or_else(|| TransportError::Negotiation(format!("unparseable sdp {sdp:?}")))
}

/// One side of an in-memory link.
#[derive(Debug)]
pub struct LoopbackAgent {
    id: u64,
    network: Rc<RefCell<Network>>,
}

impl PeerAgent for LoopbackAgent {
    fn state(&self) -> AgentState {
        self.network.borrow().endpoints.get(&self.id).map_or(AgentState::Failed, |ep| ep.state)
    }

    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        self.network.borrow_mut().send_from(self.id, datagram)
    }

    fn local_description(&self) -> String {
        format!("a=ice:{}", self.id)
    }

    fn set_remote_description(&mut self, sdp: &str) -> Result<(), TransportError> {
        let remote = parse_endpoint(sdp, "a=ice:")?;
        let mut network = self.network.borrow_mut();
        if let Some(endpoint) = network.endpoints.get_mut(&self.id) {
            endpoint.remote = Some(remote);
        }
        Ok(())
    }

    fn add_remote_candidate(&mut self, sdp: &str) -> Result<(), TransportError> {
        let remote = parse_endpoint(sdp, "a=candidate:")?;
        let mut network = self.network.borrow_mut();
        if let Some(endpoint) = network.endpoints.get_mut(&self.id) {
            if endpoint.remote.is_none() {
                endpoint.remote = Some(remote);
            }
        }
        Ok(())
    }

    fn set_remote_gathering_done(&mut self) {
        if let Some(endpoint) = self.network.borrow_mut().endpoints.get_mut(&self.id) {
            endpoint.remote_gathering_done = true;
        }
    }

    fn gather_candidates(&mut self) {
        let id = self.id;
        if let Some(endpoint) = self.network.borrow_mut().endpoints.get_mut(&self.id) {
            if endpoint.state == AgentState::New {
                endpoint.state = AgentState::Gathering;
            }
            endpoint.gathered = true;
            endpoint.events.push_back(AgentEvent::LocalCandidate(format!("a=candidate:{id}")));
            endpoint.events.push_back(AgentEvent::GatheringDone);
        }
    }

    fn poll_event(&mut self) -> Option<AgentEvent> {
        self.network.borrow_mut().endpoints.get_mut(&self.id)?.events.pop_front()
    }
}

impl Drop for LoopbackAgent {
    fn drop(&mut self) {
        self.network.borrow_mut().close_endpoint(self.id);
    }
}

/// Per-session handle onto the shared [`Network`].
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    network: Rc<RefCell<Network>>,
}

impl LoopbackTransport {
    /// Handle sharing `network` with every other transport in the test.
    #[must_use]
    pub fn new(network: Rc<RefCell<Network>>) -> Self {
        Self { network }
    }
}

impl Transport for LoopbackTransport {
    type Agent = LoopbackAgent;

    fn open(&mut self) -> Result<Self::Agent, TransportError> {
        let id = self.network.borrow_mut().open_endpoint()?;
        Ok(LoopbackAgent { id, network: self.network.clone() })
    }

    fn drive(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        self.network.borrow_mut().deliver();
        Ok(())
    }
}
