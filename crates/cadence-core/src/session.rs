//! The session orchestrator.
//!
//! One [`Session`] owns everything a peer needs to take part in a room: the
//! per-port state rings and packet histories, one transport agent per
//! remote peer (ports first, then a compacted spectator region), the
//! pending room delta, the save-state scratch, and the desync bookkeeping.
//!
//! [`Session::poll`] is the whole engine, run from a single thread:
//!
//! 1. commit the locally sampled input for a future frame and broadcast the
//!    local state ring to every connected peer,
//! 2. drive the transport and dispatch whatever arrived,
//! 3. if this peer spectates, rebuild port state from packet history,
//! 4. evaluate the tick gate; when it passes and wall-clock pacing agrees,
//!    apply the authority's frame-bound option and room delta, run one
//!    simulation frame, and emit the desync packet.

use cadence_codec::{hash64, rle8};
use cadence_proto::{
    CHANNEL_MASK, Channel, CoreOption, DELAY_BUFFER_SIZE, DELAY_FRAMES_MAX, DesyncPacket,
    FLAGS_MASK, INPUT_WORDS, PACKET_SIZE_MAX, PORT_COUNT, PORT_SENTINELS_MAX, PortState, Room,
    Signal,
    room::AUTHORITY_INDEX,
    signaling::{FAIL_CODE_AUTHORITY_ERROR, FAIL_CODE_ROOM_FULL},
};
use zerocopy::IntoBytes;

use crate::{
    Clock, CoreOptions, InputPlane, PacketHistory, SessionError, SignalSink, SimulationCore,
    desync,
    membership::{self, JoinResolution, RoomChange},
    ring,
    transfer::{self, TransferAssembler},
    transport::{AgentEvent, AgentState, PeerAgent, Transport},
};

/// Spectator slots beyond the eight ports.
pub const MAX_SPECTATORS: usize = 55;

/// Agent slots: ports first, then the contiguous spectator region.
pub const TOTAL_SLOTS: usize = PORT_COUNT + MAX_SPECTATORS;

/// `frame_counter` value of a peer still waiting for a save state.
pub const WAITING_FOR_SAVE_STATE_SENTINEL: i64 = i64::MAX;

/// The option key that retunes the input delay at a tick boundary.
const DELAY_FRAMES_OPTION: &str = "netplay_delay_frames";

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Input delay in frames, clamped to `0..=DELAY_FRAMES_MAX`
    pub delay_frames: i64,
    /// zstd level for save-state transfers (`-22..=22`)
    pub zstd_compress_level: i32,
    /// Simulation frame rate used for wall-clock pacing
    pub frame_rate: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { delay_frames: 2, zstd_compress_level: 0, frame_rate: 60.0 }
    }
}

/// What one [`Session::poll`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// The simulation advanced one frame
    pub ticked: bool,
    /// A save state was serialized this poll
    pub saved_state: bool,
}

/// A peer's entire netplay state machine.
pub struct Session<T: Transport, C: Clock> {
    config: SessionConfig,
    clock: C,
    transport: T,

    frame_counter: i64,
    delay_frames: i64,
    core_wants_tick_at_usec: i64,
    our_peer_id: u64,

    room_we_are_in: Room,
    next_room_xor_delta: Room,
    spectator_peer_ids: [u64; MAX_SPECTATORS],
    spectator_count: usize,

    core_options: CoreOptions,
    core_options_dirty: bool,
    pending_option: Option<CoreOption>,

    agents: Vec<Option<T::Agent>>,
    peer_desynced_frame: [i64; TOTAL_SLOTS],
    state: Box<[PortState; PORT_COUNT]>,
    history: [PacketHistory; PORT_COUNT],
    peer_needs_sync: u64,

    desync_packet: DesyncPacket,
    assembler: TransferAssembler,
    last_local_fault: Option<SessionError>,
}

impl<T: Transport, C: Clock> Session<T, C> {
    /// Create an idle session. `our_peer_id` arrives later through the
    /// signaling `conn` message.
    pub fn new(transport: T, clock: C, config: SessionConfig) -> Self {
        let mut config = config;
        config.delay_frames = config.delay_frames.clamp(0, DELAY_FRAMES_MAX);

        let mut agents = Vec::new();
        agents.resize_with(TOTAL_SLOTS, || None);

        let delay_frames = config.delay_frames;
        Self {
            config,
            clock,
            transport,
            frame_counter: 0,
            delay_frames,
            core_wants_tick_at_usec: 0,
            our_peer_id: 0,
            room_we_are_in: Room::default(),
            next_room_xor_delta: Room::default(),
            spectator_peer_ids: [0; MAX_SPECTATORS],
            spectator_count: 0,
            core_options: CoreOptions::new(),
            core_options_dirty: false,
            pending_option: None,
            agents,
            peer_desynced_frame: [0; TOTAL_SLOTS],
            state: Box::new([PortState::default(); PORT_COUNT]),
            history: std::array::from_fn(|_| PacketHistory::new()),
            peer_needs_sync: 0,
            desync_packet: DesyncPacket::new(),
            assembler: TransferAssembler::new(),
            last_local_fault: None,
        }
    }

    /// Current simulation frame.
    #[must_use]
    pub fn frame_counter(&self) -> i64 {
        self.frame_counter
    }

    /// The room this session replicates.
    #[must_use]
    pub fn room(&self) -> &Room {
        &self.room_we_are_in
    }

    /// Our signaling-assigned peer id (0 before `conn`).
    #[must_use]
    pub fn our_peer_id(&self) -> u64 {
        self.our_peer_id
    }

    /// Configured input delay currently in effect.
    #[must_use]
    pub fn delay_frames(&self) -> i64 {
        self.delay_frames
    }

    /// Committed frame head of `port`'s state ring.
    #[must_use]
    pub fn port_frame(&self, port: usize) -> i64 {
        self.state[port].frame()
    }

    /// Whether we are the room's authority (also true for an unhosted,
    /// ownerless room).
    #[must_use]
    pub fn is_authority(&self) -> bool {
        let authority = self.room_we_are_in.peer_id(AUTHORITY_INDEX);
        authority == self.our_peer_id || authority <= PORT_SENTINELS_MAX
    }

    /// Whether `peer_id` is connected but holds no port.
    #[must_use]
    pub fn is_spectator(&self, peer_id: u64) -> bool {
        self.room_we_are_in.is_hosted() && self.room_we_are_in.port_of_peer(peer_id).is_none()
    }

    /// First frame on which `slot`'s save hashes diverged from ours, 0 for
    /// none.
    #[must_use]
    pub fn peer_desynced_frame(&self, slot: usize) -> i64 {
        self.peer_desynced_frame[slot]
    }

    /// The replicated core-option table.
    #[must_use]
    pub fn core_options(&self) -> &CoreOptions {
        &self.core_options
    }

    /// Seed the option table from the application.
    pub fn populate_core_options(&mut self, options: &[CoreOption]) {
        self.core_options.populate(options);
    }

    /// Whether the option table changed since the flag was last cleared.
    #[must_use]
    pub fn core_options_dirty(&self) -> bool {
        self.core_options_dirty
    }

    /// Acknowledge the dirty option table.
    pub fn clear_core_options_dirty(&mut self) {
        self.core_options_dirty = false;
    }

    /// Queue a single option mutation to ride on our next committed frame.
    pub fn queue_core_option(&mut self, key: &str, value: &str) {
        self.pending_option = Some(CoreOption::new(key, value));
    }

    /// Number of connected spectators (meaningful on the authority).
    #[must_use]
    pub fn spectator_count(&self) -> usize {
        self.spectator_count
    }

    /// Take the most recent local fault (failed serialize, oversized state
    /// packet). Faults never abort the poll loop; the offending work is
    /// dropped, logged, and recorded here for the application.
    pub fn take_local_fault(&mut self) -> Option<SessionError> {
        self.last_local_fault.take()
    }

    /// Ask the signaling server to create a room with us as its authority.
    pub fn request_create_room(&self, name: &str, signals: &mut impl SignalSink) {
        let mut room = Room::open(name);
        room.set_peer_id(AUTHORITY_INDEX, self.our_peer_id);
        signals.signal_send(&Signal::Make { room });
    }

    /// Adopt `room` and start connecting to its authority as a spectator.
    ///
    /// The local frame counter parks on the waiting sentinel until the
    /// authority's save state arrives.
    pub fn connect_to_room(
        &mut self,
        room: Room,
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        let authority = room.peer_id(AUTHORITY_INDEX);
        if !room.is_hosted() || authority <= PORT_SENTINELS_MAX {
            return Err(SessionError::RoomNotHosted);
        }

        self.room_we_are_in = room;
        self.frame_counter = WAITING_FOR_SAVE_STATE_SENTINEL;
        self.startup_ice(authority, None, signals)?;
        Ok(())
    }

    /// Request a membership change by shipping the whole room as we want
    /// it. Routed to the authority by the signaling relay (the authority's
    /// own requests come back to it the same way).
    pub fn request_room_change(&self, desired: Room, signals: &mut impl SignalSink) {
        signals.signal_send(&Signal::Join { peer_id: self.our_peer_id, room: desired });
    }

    /// Request the open port `port` for ourselves.
    pub fn request_port(&self, port: usize, signals: &mut impl SignalSink) {
        let mut desired = self.room_we_are_in;
        desired.set_peer_id(port, self.our_peer_id);
        self.request_room_change(desired, signals);
    }

    /// Ask the authority to unseat `peer_id` (authority kicking a silent
    /// peer routes through here too; the request loops back through the
    /// relay like any other).
    pub fn request_remove_peer(&self, peer_id: u64, signals: &mut impl SignalSink) {
        let Some(port) = self.room_we_are_in.port_of_peer(peer_id) else { return };
        let mut desired = self.room_we_are_in;
        desired.set_peer_id(port, cadence_proto::PEER_AVAILABLE);
        signals.signal_send(&Signal::Join { peer_id, room: desired });
    }

    /// One iteration of the poll loop.
    ///
    /// `local_input` is this frame's sampled input for our own port;
    /// `force_save_state` additionally serializes the simulation on a tick
    /// (feeding the save-hash side of desync detection).
    pub fn poll(
        &mut self,
        core: &mut impl SimulationCore,
        signals: &mut impl SignalSink,
        local_input: &[i16; INPUT_WORDS],
        force_save_state: bool,
    ) -> Result<PollOutcome, SessionError> {
        let mut outcome = PollOutcome::default();

        self.advance_local_input(local_input);

        if self.room_we_are_in.is_hosted() && !self.is_spectator(self.our_peer_id) {
            self.broadcast_own_state();
        }

        let now = self.clock.now_unix_usec();
        let timeout_usec = (self.core_wants_tick_at_usec - now).max(0);
        self.transport.drive(std::time::Duration::from_micros(timeout_usec as u64))?;

        for (slot, event) in self.drain_agent_events() {
            if let Err(error) = self.handle_agent_event(slot, event, core, signals) {
                tracing::warn!(slot, %error, "agent event dropped");
            }
        }

        if self.is_spectator(self.our_peer_id) {
            self.reconstruct_from_history();
        }

        if self.tick_gate_open() && self.pacing_allows_tick() {
            outcome.ticked = true;
            outcome.saved_state = self.tick(core, signals, force_save_state);
        }

        Ok(outcome)
    }

    /// Feed one inbound signaling message into the session.
    pub fn process_signal(
        &mut self,
        message: &Signal,
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        match message {
            Signal::Connect { peer_id } => {
                tracing::info!(peer_id = format_args!("{peer_id:#x}"), "peer id assigned");
                self.our_peer_id = *peer_id;
                if !self.room_we_are_in.is_hosted() {
                    self.room_we_are_in.set_peer_id(AUTHORITY_INDEX, *peer_id);
                }
                Ok(())
            }

            Signal::Make { room } => {
                if self.room_we_are_in.is_hosted() {
                    tracing::warn!("make reply while already in a hosted room; ignored");
                    return Ok(());
                }
                if room.peer_id(AUTHORITY_INDEX) != self.our_peer_id {
                    tracing::warn!("make reply for a room we do not own; ignored");
                    return Ok(());
                }
                tracing::info!(name = %room.name(), "room adopted");
                self.room_we_are_in = *room;
                Ok(())
            }

            Signal::Join { peer_id, room } => self.authority_resolve_join(*peer_id, room, signals),

            Signal::Sdp { peer_id, sdp } => self.handle_peer_signal(*peer_id, Some(sdp), signals),

            Signal::Disconnect { peer_id } => self.handle_peer_signal(*peer_id, None, signals),

            Signal::Fail { peer_id, code, description } => {
                tracing::error!(
                    peer_id = format_args!("{peer_id:#x}"),
                    code,
                    description = %description,
                    "signaling failure"
                );
                Err(SessionError::Remote { code: *code, description: description.clone() })
            }
        }
    }

    // MARK: input generation and outbound state

    fn advance_local_input(&mut self, local_input: &[i16; INPUT_WORDS]) {
        if self.frame_counter == WAITING_FOR_SAVE_STATE_SENTINEL
            || self.is_spectator(self.our_peer_id)
        {
            return;
        }

        let port = self.our_port();
        // A pending room delta may use the whole ring headroom: the gate can
        // be stalled on the very peer the delta removes, and the delta has
        // to reach the wire for anyone to unstall
        let cap = if self.next_room_xor_delta.is_zero() {
            self.delay_frames
        } else {
            DELAY_BUFFER_SIZE as i64 - 1
        };
        if self.state[port].frame() >= self.frame_counter + cap {
            return;
        }

        let next_frame = self.state[port].frame() + 1;
        self.state[port].set_frame(next_frame);
        let slot = PortState::slot(next_frame);

        for (word, value) in
            self.state[port].input_mut(slot, port).iter_mut().zip(local_input)
        {
            *word = (*value).into();
        }

        let option = self.pending_option.take().unwrap_or_default();
        self.state[port].set_core_option(slot, option);

        // Non-authorities never accumulate a delta, so this stays zero for
        // them
        *self.state[port].room_delta_mut(slot) = self.next_room_xor_delta;
        self.next_room_xor_delta = Room::default();
    }

    fn broadcast_own_state(&mut self) {
        let port = self.our_port();
        let body = rle8::encode(self.state[port].as_bytes());

        if 1 + body.len() > PACKET_SIZE_MAX {
            tracing::error!(size = 1 + body.len(), "state packet exceeds datagram limit; dropped");
            self.last_local_fault = Some(SessionError::PacketTooLarge {
                size: 1 + body.len(),
                max: PACKET_SIZE_MAX,
            });
            return;
        }

        let mut packet = Vec::with_capacity(1 + body.len());
        packet.push(Channel::Input.to_byte() | port as u8);
        packet.extend_from_slice(&body);

        self.history[port].record(self.state[port].frame(), &packet);
        self.broadcast_datagram(&packet);
    }

    fn broadcast_datagram(&mut self, datagram: &[u8]) {
        let mut failed = Vec::new();
        for (slot, agent) in self.agents.iter_mut().enumerate() {
            let Some(agent) = agent else { continue };
            if !agent.state().is_ready() {
                continue;
            }
            if let Err(error) = agent.send(datagram) {
                tracing::warn!(slot, %error, "send failed; disconnecting peer");
                failed.push(slot);
            }
        }
        for slot in failed {
            self.disconnect_slot(slot);
        }
    }

    fn drain_agent_events(&mut self) -> Vec<(usize, AgentEvent)> {
        let mut events = Vec::new();
        for (slot, agent) in self.agents.iter_mut().enumerate() {
            if let Some(agent) = agent {
                while let Some(event) = agent.poll_event() {
                    events.push((slot, event));
                }
            }
        }
        events
    }

    // MARK: spectator catch-up

    fn reconstruct_from_history(&mut self) {
        if self.frame_counter == WAITING_FOR_SAVE_STATE_SENTINEL {
            return;
        }
        for port in 0..PORT_COUNT {
            if !self.room_we_are_in.port_occupied(port) {
                continue;
            }
            for offset in (0..DELAY_BUFFER_SIZE as i64).rev() {
                let packet = self.history[port].packet(self.frame_counter + offset);
                let frame = ring::peek_frame(&packet[1..]);
                if (frame - self.frame_counter).abs() < DELAY_BUFFER_SIZE as i64 {
                    rle8::decode(&packet[1..], self.state[port].as_mut_bytes());
                    break;
                }
            }
        }
    }

    fn authority_frame_seen(&self) -> i64 {
        let mut latest = -1;
        for offset in 0..DELAY_BUFFER_SIZE as i64 {
            let packet = self.history[AUTHORITY_INDEX].packet(self.frame_counter + offset);
            latest = latest.max(ring::peek_frame(&packet[1..]));
        }
        latest
    }

    // MARK: tick gate and pacing

    fn tick_gate_open(&self) -> bool {
        if self.frame_counter == WAITING_FOR_SAVE_STATE_SENTINEL {
            return false;
        }

        let mut ready = true;
        if self.room_we_are_in.is_hosted() {
            for port in 0..PORT_COUNT {
                if !self.room_we_are_in.port_occupied(port) {
                    continue;
                }
                // A port whose peer is being removed by a delta already in
                // the authority's ring stops gating; its inputs will never
                // arrive
                if self.port_being_vacated(port) {
                    continue;
                }
                ready &= self.state[port].frame() >= self.frame_counter;
                // Spectators can fall behind the whole ring; seated peers
                // can't get here by protocol
                ready &=
                    self.state[port].frame() < self.frame_counter + DELAY_BUFFER_SIZE as i64;
            }
        }

        if !self.is_spectator(self.our_peer_id) {
            let buffered = self.state[self.our_port()].frame() - self.frame_counter + 1;
            debug_assert!(buffered >= 0);
            debug_assert!(buffered <= DELAY_BUFFER_SIZE as i64);
            ready &= buffered >= self.delay_frames;
        }

        ready
    }

    /// Whether a delta committed in the authority's visible ring window
    /// unseats the peer currently on `port`.
    fn port_being_vacated(&self, port: usize) -> bool {
        let seated = self.room_we_are_in.peer_id(port);
        let head = self.state[AUTHORITY_INDEX].frame();
        let mut projected = self.room_we_are_in;
        let mut frame = self.frame_counter + 1;
        while frame <= head {
            projected.xor(self.state[AUTHORITY_INDEX].room_delta(PortState::slot(frame)));
            if projected.peer_id(port) != seated {
                return true;
            }
            frame += 1;
        }
        false
    }

    fn pacing_allows_tick(&self) -> bool {
        if self.core_wants_tick_at_usec <= self.clock.now_unix_usec() {
            return true;
        }

        // A spectator far enough behind the authority ignores pacing to
        // catch up
        if self.is_spectator(self.our_peer_id) {
            let tolerance = 2 * self.delay_frames - 1;
            return self.authority_frame_seen() > self.frame_counter + tolerance;
        }

        false
    }

    fn tick(
        &mut self,
        core: &mut impl SimulationCore,
        signals: &mut impl SignalSink,
        force_save_state: bool,
    ) -> bool {
        let frame_time_usec = (1_000_000.0 / self.config.frame_rate) as i64;
        let target_usec = frame_time_usec - 1000;
        let now = self.clock.now_unix_usec();
        self.core_wants_tick_at_usec =
            self.core_wants_tick_at_usec.max(now - target_usec).min(now + target_usec);

        let slot = PortState::slot(self.frame_counter);
        let option = *self.state[AUTHORITY_INDEX].core_option(slot);
        if !option.is_empty() {
            if option.key() == DELAY_FRAMES_OPTION {
                let parsed = option.value().parse::<i64>().unwrap_or(self.delay_frames);
                self.delay_frames = parsed.clamp(0, DELAY_FRAMES_MAX);
                tracing::info!(delay_frames = self.delay_frames, "input delay retuned");
            }
            if self.core_options.apply(&option) {
                self.core_options_dirty = true;
            }
        }

        let save_state_frame = self.frame_counter;
        let mut saved_state = None;
        if force_save_state || self.peer_needs_sync != 0 {
            let size = core.serialize_size();
            let mut buffer = vec![0u8; size];
            if core.serialize(&mut buffer) {
                saved_state = Some(buffer);
            } else {
                tracing::error!(size, "simulation failed to serialize");
                self.last_local_fault = Some(SessionError::StateSaveFailed { size });
            }
        }

        if self.peer_needs_sync != 0 {
            if let Some(ref blob) = saved_state {
                self.send_save_state(blob, save_state_frame);
            }
            self.peer_needs_sync = 0;
        }

        let inputs = self.merge_input_plane();
        core.run_one_frame(&inputs);
        self.core_wants_tick_at_usec += frame_time_usec;

        let delta = *self.state[AUTHORITY_INDEX].room_delta(slot);
        let new_room = self.room_we_are_in.xored(&delta);
        if new_room != self.room_we_are_in {
            tracing::info!("room changed by the authority");
            self.apply_room_transition(new_room, signals);
        }

        if self.room_we_are_in.is_hosted() {
            let hash_slot = PortState::slot(save_state_frame);
            self.desync_packet.set_frame(save_state_frame);
            self.desync_packet.set_save_hash(
                hash_slot,
                saved_state.as_deref().map_or(0, |blob| hash64(blob) as i64),
            );
            self.desync_packet.set_input_hash(hash_slot, hash_plane(&inputs) as i64);

            if !self.is_spectator(self.our_peer_id) {
                let packet = self.desync_packet;
                self.broadcast_datagram(packet.as_bytes());
            }
        }

        self.frame_counter += 1;
        saved_state.is_some()
    }

    fn merge_input_plane(&self) -> InputPlane {
        let slot = PortState::slot(self.frame_counter);
        let mut plane: InputPlane = [[0; INPUT_WORDS]; PORT_COUNT];
        for port in 0..PORT_COUNT {
            let contributes = self.room_we_are_in.port_occupied(port)
                || (port == AUTHORITY_INDEX && !self.room_we_are_in.port_inactive(port));
            if !contributes {
                continue;
            }
            // A vacating peer's ring can be stale; its slot would replay
            // inputs from a ring cycle ago
            if self.state[port].frame() < self.frame_counter {
                continue;
            }
            for (word, value) in plane[port].iter_mut().zip(self.state[port].input(slot, port))
            {
                *word |= value.get();
            }
        }
        plane
    }

    fn send_save_state(&mut self, save_state: &[u8], save_state_frame: i64) {
        let fragments = match transfer::build_fragments(
            save_state,
            self.core_options.as_bytes(),
            &self.room_we_are_in,
            save_state_frame,
            self.config.zstd_compress_level,
        ) {
            Ok(fragments) => fragments,
            Err(error) => {
                tracing::error!(%error, "failed to build save-state transfer");
                return;
            }
        };

        tracing::info!(
            frame = save_state_frame,
            fragments = fragments.len(),
            targets = self.peer_needs_sync.count_ones(),
            "sending save state"
        );

        for slot in 0..TOTAL_SLOTS {
            if self.peer_needs_sync & (1 << slot) == 0 {
                continue;
            }
            let Some(agent) = self.agents[slot].as_mut() else { continue };
            for fragment in &fragments {
                if let Err(error) = agent.send(fragment) {
                    tracing::warn!(slot, %error, "save-state fragment send failed");
                    break;
                }
            }
        }
    }

    // MARK: inbound datagrams

    fn handle_agent_event(
        &mut self,
        slot: usize,
        event: AgentEvent,
        core: &mut impl SimulationCore,
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        match event {
            AgentEvent::StateChanged(state) => self.handle_agent_state(slot, state),
            AgentEvent::LocalCandidate(sdp) => {
                let peer_id = self.slot_peer_id(slot);
                if peer_id > PORT_SENTINELS_MAX {
                    signals.signal_send(&Signal::Sdp { peer_id, sdp });
                }
                Ok(())
            }
            AgentEvent::GatheringDone => {
                let peer_id = self.slot_peer_id(slot);
                if peer_id > PORT_SENTINELS_MAX {
                    signals.signal_send(&Signal::Sdp { peer_id, sdp: String::new() });
                }
                Ok(())
            }
            AgentEvent::Datagram(bytes) => self.handle_datagram(slot, &bytes, core, signals),
        }
    }

    fn handle_agent_state(&mut self, slot: usize, state: AgentState) -> Result<(), SessionError> {
        match state {
            AgentState::Connected
                if self.our_peer_id == self.room_we_are_in.peer_id(AUTHORITY_INDEX) =>
            {
                tracing::info!(slot, "peer connected; scheduling save-state sync");
                self.peer_needs_sync |= 1 << slot;
                Ok(())
            }
            AgentState::Failed => {
                if slot == AUTHORITY_INDEX && !self.is_authority() {
                    tracing::error!("authority connection failed; resetting session");
                    self.disconnect_all();
                    self.reset_to_unhosted();
                } else {
                    tracing::info!(slot, "peer connection failed; disconnecting");
                    self.disconnect_slot(slot);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_datagram(
        &mut self,
        slot: usize,
        data: &[u8],
        core: &mut impl SimulationCore,
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        let Some(&channel_and_flags) = data.first() else {
            tracing::warn!(slot, "empty datagram");
            return Ok(());
        };

        if slot >= PORT_COUNT {
            tracing::warn!(
                slot,
                channel = channel_and_flags & CHANNEL_MASK,
                "datagram from a spectator; ignored"
            );
            return Ok(());
        }

        match Channel::from_byte(channel_and_flags)? {
            Channel::Input => self.handle_input_packet(slot, data, signals),
            Channel::DesyncDebug => {
                let theirs = DesyncPacket::read_from(data)?;
                self.peer_desynced_frame[slot] =
                    desync::compare(&self.desync_packet, &theirs, self.peer_desynced_frame[slot]);
                Ok(())
            }
            Channel::SavestateTransfer => self.handle_savestate_fragment(slot, data, core),
            Channel::Extra | Channel::InputAudit => {
                let peer_id = self.slot_peer_id(slot);
                self.report_violation(peer_id, "datagram on a reserved channel", signals);
                self.disconnect_slot(slot);
                Err(SessionError::ReservedChannel(channel_and_flags))
            }
        }
    }

    fn handle_input_packet(
        &mut self,
        slot: usize,
        data: &[u8],
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        let source_port = (data[0] & FLAGS_MASK) as usize;
        if source_port >= PORT_COUNT {
            tracing::warn!(source_port, "input packet for an out-of-range port");
            return Ok(());
        }

        // The authority legitimately relays other ports' packets to
        // spectators; anyone else must speak only for their own port
        if slot != source_port && slot != AUTHORITY_INDEX {
            let peer_id = self.slot_peer_id(slot);
            self.report_violation(peer_id, "input packet for a port the sender does not hold", signals);
            self.disconnect_slot(slot);
            return Err(SessionError::SourcePortMismatch { claimed: source_port, arrived: slot });
        }

        let body = &data[1..];
        let decoded = rle8::decode_size(body);
        if decoded != PortState::SIZE {
            let peer_id = self.slot_peer_id(slot);
            self.report_violation(peer_id, "state packet with a malformed size", signals);
            self.disconnect_slot(slot);
            return Err(SessionError::MalformedStatePacket {
                decoded,
                expected: PortState::SIZE,
            });
        }

        let frame = ring::peek_frame(body);
        if frame < self.state[source_port].frame() {
            // Reordered datagram; the ring already moved on
            tracing::debug!(frame, head = self.state[source_port].frame(), "stale input packet");
            return Ok(());
        }

        rle8::decode(body, self.state[source_port].as_mut_bytes());
        self.history[source_port].record(frame, data);

        if self.is_authority() {
            let mut failed = Vec::new();
            for slot in PORT_COUNT..TOTAL_SLOTS {
                let Some(agent) = self.agents[slot].as_mut() else { continue };
                if !agent.state().is_ready() {
                    continue;
                }
                if let Err(error) = agent.send(data) {
                    tracing::warn!(slot, %error, "spectator forward failed");
                    failed.push(slot);
                }
            }
            for slot in failed {
                self.disconnect_slot(slot);
            }
        }

        Ok(())
    }

    fn handle_savestate_fragment(
        &mut self,
        slot: usize,
        data: &[u8],
        core: &mut impl SimulationCore,
    ) -> Result<(), SessionError> {
        if slot != AUTHORITY_INDEX {
            tracing::warn!(slot, "save-state fragment from a non-authority agent; ignored");
            return Ok(());
        }

        let Some(payload) = self.assembler.accept(data)? else {
            return Ok(());
        };

        match CoreOptions::from_bytes(&payload.options_table) {
            Ok(options) => {
                self.core_options = options;
                self.core_options_dirty = true;
            }
            Err(error) => {
                tracing::error!(%error, "transferred option table rejected");
                return Err(error);
            }
        }

        if !core.unserialize(&payload.save_state) {
            tracing::error!("simulation rejected the transferred save state");
            return Err(SessionError::StateLoadFailed);
        }

        tracing::info!(frame = payload.frame_counter, "save state loaded");
        self.frame_counter = payload.frame_counter;
        self.room_we_are_in = payload.room;
        Ok(())
    }

    // MARK: signaling bridge

    fn authority_resolve_join(
        &mut self,
        peer_id: u64,
        requested: &Room,
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        if !self.is_authority() {
            tracing::warn!("join request received while not the authority");
            return Err(SessionError::UnknownSignalTarget { peer_id });
        }

        // Project the room to where the already-committed deltas will take
        // it, so this request composes with everything in flight
        let mut future_room = self.room_we_are_in;
        let head = self.state[AUTHORITY_INDEX].frame();
        let mut frame = self.frame_counter + 1;
        while frame <= head {
            future_room.xor(self.state[AUTHORITY_INDEX].room_delta(PortState::slot(frame)));
            frame += 1;
        }
        future_room.xor(&self.next_room_xor_delta);

        tracing::info!(peer_id = format_args!("{peer_id:#x}"), "membership change requested");

        match membership::resolve_join(&future_room, requested, peer_id) {
            JoinResolution::Commit { delta, target } => {
                self.next_room_xor_delta.xor(&delta);
                signals.signal_send(&Signal::Make { room: target });
                Ok(())
            }
            JoinResolution::NoChange => {
                tracing::warn!(
                    peer_id = format_args!("{peer_id:#x}"),
                    "join request changed nothing"
                );
                Ok(())
            }
            JoinResolution::RejectRoomMismatch => {
                self.report_violation(peer_id, "join request for a different room", signals);
                Err(SessionError::RoomMismatch)
            }
            JoinResolution::RejectUnsupported => {
                self.report_violation(peer_id, "unsupported join request", signals);
                Ok(())
            }
            JoinResolution::RejectPortUnavailable { port } => {
                tracing::info!(peer_id = format_args!("{peer_id:#x}"), port, "port unavailable");
                signals.signal_send(&Signal::Fail {
                    peer_id,
                    code: FAIL_CODE_AUTHORITY_ERROR,
                    description: "peer tried to join on unavailable port".to_string(),
                });
                Ok(())
            }
        }
    }

    fn handle_peer_signal(
        &mut self,
        peer_id: u64,
        sdp: Option<&str>,
        signals: &mut impl SignalSink,
    ) -> Result<(), SessionError> {
        if !self.room_we_are_in.is_hosted() {
            tracing::warn!(
                peer_id = format_args!("{peer_id:#x}"),
                "signal while not in a netplay session; ignored"
            );
            return Ok(());
        }

        let mut slot = self.locate_slot(peer_id);

        if slot.is_none() {
            if self.our_peer_id != self.room_we_are_in.peer_id(AUTHORITY_INDEX) {
                tracing::warn!(
                    peer_id = format_args!("{peer_id:#x}"),
                    "signal from unknown peer while not the authority"
                );
                self.report_violation(peer_id, "unknown signal when we weren't the authority", signals);
                return Err(SessionError::UnknownSignalTarget { peer_id });
            }
            if self.spectator_count == MAX_SPECTATORS {
                tracing::warn!("spectator region full; rejecting connection");
                signals.signal_send(&Signal::Fail {
                    peer_id,
                    code: FAIL_CODE_ROOM_FULL,
                    description: "authority has reached the maximum number of spectators"
                        .to_string(),
                });
                return Err(SessionError::SpectatorsFull);
            }
            tracing::info!(
                peer_id = format_args!("{peer_id:#x}"),
                "unknown peer admitted as a spectator"
            );
        }

        let needs_agent = slot.is_none_or(|slot| self.agents[slot].is_none());
        if needs_agent {
            slot = Some(self.startup_ice(peer_id, None, signals)?);
        }

        let Some(slot) = slot else { return Ok(()) };

        match sdp {
            None => {
                // Disconnect announcement; only spectators may leave this
                // way
                if slot > AUTHORITY_INDEX {
                    self.disconnect_slot(slot);
                    Ok(())
                } else {
                    self.report_violation(
                        peer_id,
                        "signaled disconnect before detaching port",
                        signals,
                    );
                    self.disconnect_slot(slot);
                    Err(SessionError::DisconnectWhileSeated { port: slot, peer_id })
                }
            }
            Some("") => {
                tracing::info!(peer_id = format_args!("{peer_id:#x}"), "remote gathering done");
                if let Some(agent) = self.agents[slot].as_mut() {
                    agent.set_remote_gathering_done();
                }
                Ok(())
            }
            Some(sdp) if sdp.starts_with("a=ice") => {
                if let Some(agent) = self.agents[slot].as_mut() {
                    agent.set_remote_description(sdp)?;
                }
                Ok(())
            }
            Some(sdp) if sdp.starts_with("a=candidate") => {
                if let Some(agent) = self.agents[slot].as_mut() {
                    agent.add_remote_candidate(sdp)?;
                }
                Ok(())
            }
            Some(other) => {
                tracing::error!(sdp = %other, "unparseable signal payload");
                Ok(())
            }
        }
    }

    fn startup_ice(
        &mut self,
        peer_id: u64,
        remote_description: Option<&str>,
        signals: &mut impl SignalSink,
    ) -> Result<usize, SessionError> {
        let slot = match self.room_we_are_in.port_of_peer(peer_id) {
            Some(port) => port,
            None => {
                if self.spectator_count == MAX_SPECTATORS {
                    return Err(SessionError::SpectatorsFull);
                }
                self.spectator_peer_ids[self.spectator_count] = peer_id;
                let slot = PORT_COUNT + self.spectator_count;
                self.spectator_count += 1;
                slot
            }
        };
        debug_assert!(self.agents[slot].is_none());

        tracing::info!(
            peer_id = format_args!("{peer_id:#x}"),
            slot,
            "starting interactive connectivity establishment"
        );

        let mut agent = self.transport.open()?;
        if let Some(description) = remote_description {
            agent.set_remote_description(description)?;
        }
        signals.signal_send(&Signal::Sdp { peer_id, sdp: agent.local_description() });
        agent.gather_candidates();
        self.agents[slot] = Some(agent);
        Ok(slot)
    }

    // MARK: peer slots

    fn our_port(&self) -> usize {
        if self.room_we_are_in.is_hosted() {
            self.room_we_are_in.port_of_peer(self.our_peer_id).unwrap_or(AUTHORITY_INDEX)
        } else {
            AUTHORITY_INDEX
        }
    }

    fn slot_peer_id(&self, slot: usize) -> u64 {
        if slot < PORT_COUNT {
            self.room_we_are_in.peer_id(slot)
        } else {
            self.spectator_peer_ids[slot - PORT_COUNT]
        }
    }

    fn locate_slot(&self, peer_id: u64) -> Option<usize> {
        if peer_id <= PORT_SENTINELS_MAX {
            return None;
        }
        if let Some(index) =
            self.spectator_peer_ids[..self.spectator_count].iter().position(|&id| id == peer_id)
        {
            return Some(PORT_COUNT + index);
        }
        self.room_we_are_in.port_of_peer(peer_id)
    }

    /// Drop `slot`'s agent, compacting the spectator region if needed.
    fn disconnect_slot(&mut self, slot: usize) {
        let peer_id = self.slot_peer_id(slot);
        tracing::info!(peer_id = format_args!("{peer_id:#x}"), slot, "disconnecting peer");

        self.agents[slot] = None;
        self.peer_desynced_frame[slot] = 0;
        if slot >= PORT_COUNT {
            self.compact_spectators(slot - PORT_COUNT);
        }
    }

    /// Authority-side: keep the connection of a peer who left its port,
    /// parked in the spectator region.
    fn demote_port_to_spectator(&mut self, port: usize) {
        if self.spectator_count == MAX_SPECTATORS {
            self.disconnect_slot(port);
            return;
        }
        let peer_id = self.room_we_are_in.peer_id(port);
        let target = PORT_COUNT + self.spectator_count;
        self.spectator_peer_ids[self.spectator_count] = peer_id;
        self.spectator_count += 1;

        self.agents[target] = self.agents[port].take();
        self.peer_desynced_frame[target] = std::mem::take(&mut self.peer_desynced_frame[port]);
        tracing::info!(
            peer_id = format_args!("{peer_id:#x}"),
            port,
            "peer demoted to spectator"
        );
    }

    /// Move a connected peer (usually a spectator) onto the port the
    /// authority granted it.
    fn promote_to_port(&mut self, from_slot: usize, port: usize) {
        debug_assert!(self.agents[port].is_none());
        self.agents[port] = self.agents[from_slot].take();
        self.peer_desynced_frame[port] = std::mem::take(&mut self.peer_desynced_frame[from_slot]);
        if from_slot >= PORT_COUNT {
            self.compact_spectators(from_slot - PORT_COUNT);
        }
        tracing::info!(from_slot, port, "spectator promoted to port");
    }

    fn compact_spectators(&mut self, index: usize) {
        debug_assert!(index < self.spectator_count);
        self.spectator_count -= 1;
        let last = self.spectator_count;
        if index != last {
            self.spectator_peer_ids[index] = self.spectator_peer_ids[last];
            self.agents[PORT_COUNT + index] = self.agents[PORT_COUNT + last].take();
            self.peer_desynced_frame[PORT_COUNT + index] =
                std::mem::take(&mut self.peer_desynced_frame[PORT_COUNT + last]);
        }
        self.spectator_peer_ids[last] = 0;
    }

    fn disconnect_all(&mut self) {
        for slot in (0..TOTAL_SLOTS).rev() {
            if self.agents[slot].is_some() {
                self.disconnect_slot(slot);
            }
        }
    }

    // MARK: room transitions

    fn apply_room_transition(&mut self, new_room: Room, signals: &mut impl SignalSink) {
        let old_room = self.room_we_are_in;

        for change in membership::diff_rooms(&old_room, &new_room, self.our_peer_id) {
            match change {
                RoomChange::WeJoined { port } => {
                    tracing::info!(port, "the authority let us in");
                    debug_assert!(self.state[port].frame() <= self.frame_counter);
                    self.state[port].set_frame(self.frame_counter);

                    for peer_port in 0..PORT_COUNT {
                        if !new_room.port_occupied(peer_port) || peer_port == port {
                            continue;
                        }
                        let peer_id = new_room.peer_id(peer_port);
                        if peer_id == self.our_peer_id || self.agents[peer_port].is_some() {
                            continue;
                        }
                        if let Err(error) = self.startup_ice(peer_id, None, signals) {
                            tracing::warn!(peer_port, %error, "could not dial seated peer");
                        }
                    }
                }
                RoomChange::WeWereRemoved => {
                    tracing::info!("we were removed from our port");
                    for port in 0..AUTHORITY_INDEX {
                        if self.agents[port].is_some() {
                            self.disconnect_slot(port);
                        }
                    }
                }
                RoomChange::PeerLeft { port, peer_id } => {
                    tracing::info!(peer_id = format_args!("{peer_id:#x}"), port, "peer left");
                    if self.agents[port].is_none() {
                        continue;
                    }
                    if self.is_authority() {
                        self.demote_port_to_spectator(port);
                    } else {
                        self.disconnect_slot(port);
                    }
                }
                RoomChange::PeerSeated { port, peer_id } => {
                    if let Some(existing) = self.locate_slot(peer_id) {
                        if existing != port && self.agents[existing].is_some() {
                            self.promote_to_port(existing, port);
                        }
                    }
                }
            }
        }

        self.room_we_are_in = new_room;

        if !new_room.is_hosted() {
            tracing::info!(name = %new_room.name(), "room was abandoned");
            self.disconnect_all();
            self.reset_to_unhosted();
        }
    }

    fn reset_to_unhosted(&mut self) {
        debug_assert_eq!(self.spectator_count, 0);

        let name = self.room_we_are_in.name().into_owned();
        let mut room = Room::open(&name);
        room.set_peer_id(AUTHORITY_INDEX, self.our_peer_id);
        self.room_we_are_in = room;

        self.next_room_xor_delta = Room::default();
        self.state = Box::new([PortState::default(); PORT_COUNT]);
        for history in &mut self.history {
            history.reset();
        }
        self.frame_counter = 0;
        self.peer_needs_sync = 0;
        self.peer_desynced_frame = [0; TOTAL_SLOTS];
        self.desync_packet = DesyncPacket::new();
        self.assembler.reset();
    }

    fn report_violation(
        &self,
        peer_id: u64,
        description: &str,
        signals: &mut impl SignalSink,
    ) {
        tracing::warn!(
            peer_id = format_args!("{peer_id:#x}"),
            description,
            "protocol violation"
        );
        signals.signal_send(&Signal::Fail {
            peer_id,
            code: FAIL_CODE_AUTHORITY_ERROR,
            description: description.to_string(),
        });
    }
}

impl<T: Transport, C: Clock> std::fmt::Debug for Session<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("our_peer_id", &format_args!("{:#x}", self.our_peer_id))
            .field("frame_counter", &self.frame_counter)
            .field("delay_frames", &self.delay_frames)
            .field("room", &self.room_we_are_in)
            .field("spectator_count", &self.spectator_count)
            .finish_non_exhaustive()
    }
}

/// Hash an input plane in its little-endian wire order.
fn hash_plane(plane: &InputPlane) -> u64 {
    let mut bytes = Vec::with_capacity(PORT_COUNT * INPUT_WORDS * 2);
    for port in plane {
        for word in port {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
    }
    hash64(&bytes)
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use cadence_proto::room::FLAG_ROOM_IS_NETWORK_HOSTED;

    use super::*;
    use crate::transport::TransportError;

    const OUR_ID: u64 = 0xA11CE;
    const PEER_B: u64 = 0xB0B;

    struct NullAgent;

    impl PeerAgent for NullAgent {
        fn state(&self) -> AgentState {
            AgentState::New
        }
        fn send(&mut self, _datagram: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn local_description(&self) -> String {
            "a=ice:0".to_string()
        }
        fn set_remote_description(&mut self, _sdp: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn add_remote_candidate(&mut self, _sdp: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn set_remote_gathering_done(&mut self) {}
        fn gather_candidates(&mut self) {}
        fn poll_event(&mut self) -> Option<AgentEvent> {
            None
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        type Agent = NullAgent;
        fn open(&mut self) -> Result<Self::Agent, TransportError> {
            Ok(NullAgent)
        }
        fn drive(&mut self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Clone)]
    struct ManualClock(Rc<Cell<i64>>);

    impl Clock for ManualClock {
        fn now_unix_usec(&self) -> i64 {
            self.0.get()
        }
    }

    struct CountingCore {
        frames: u64,
    }

    impl SimulationCore for CountingCore {
        fn run_one_frame(&mut self, _inputs: &InputPlane) {
            self.frames += 1;
        }
        fn serialize_size(&mut self) -> usize {
            16
        }
        fn serialize(&mut self, buffer: &mut [u8]) -> bool {
            buffer.fill(0x5A);
            true
        }
        fn unserialize(&mut self, _buffer: &[u8]) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Signal>,
    }

    impl SignalSink for RecordingSink {
        fn signal_send(&mut self, message: &Signal) {
            self.sent.push(message.clone());
        }
    }

    fn hosted_session() -> (Session<NullTransport, ManualClock>, ManualClock, RecordingSink) {
        let clock = ManualClock(Rc::new(Cell::new(1_000_000)));
        let mut session =
            Session::new(NullTransport, clock.clone(), SessionConfig::default());
        let mut sink = RecordingSink::default();

        session
            .process_signal(&Signal::Connect { peer_id: OUR_ID }, &mut sink)
            .unwrap();

        let mut room = Room::open("unit");
        room.set_peer_id(AUTHORITY_INDEX, OUR_ID);
        room.set_peer_id(0, PEER_B);
        room.set_flags(FLAG_ROOM_IS_NETWORK_HOSTED);
        session.process_signal(&Signal::Make { room }, &mut sink).unwrap();

        (session, clock, sink)
    }

    fn input_packet(source_port: usize, frame: i64, first_word: i16) -> Vec<u8> {
        let mut state = PortState::default();
        state.set_frame(frame);
        state.input_mut(PortState::slot(frame), source_port)[0] = first_word.into();
        let mut packet = vec![Channel::Input.to_byte() | source_port as u8];
        packet.extend(rle8::encode(state.as_bytes()));
        packet
    }

    #[test]
    fn stale_input_packet_does_not_regress_the_ring() {
        let (mut session, _clock, mut sink) = hosted_session();
        let mut core = CountingCore { frames: 0 };

        let fresh = input_packet(0, 5, 77);
        session.handle_datagram(0, &fresh, &mut core, &mut sink).unwrap();
        assert_eq!(session.state[0].frame(), 5);
        assert_eq!(session.state[0].input(PortState::slot(5), 0)[0].get(), 77);

        let stale = input_packet(0, 3, 12);
        session.handle_datagram(0, &stale, &mut core, &mut sink).unwrap();
        assert_eq!(session.state[0].frame(), 5);
        assert_eq!(session.state[0].input(PortState::slot(5), 0)[0].get(), 77);
    }

    #[test]
    fn foreign_source_port_is_a_violation_unless_authority() {
        let (mut session, _clock, mut sink) = hosted_session();
        let mut core = CountingCore { frames: 0 };

        // Slot 0 claiming port 2
        let packet = input_packet(2, 4, 9);
        let result = session.handle_datagram(0, &packet, &mut core, &mut sink);
        assert!(matches!(result, Err(SessionError::SourcePortMismatch { claimed: 2, arrived: 0 })));
        assert!(sink.sent.iter().any(|m| matches!(m, Signal::Fail { peer_id, .. } if *peer_id == PEER_B)));

        // The authority may relay any port
        let relayed = input_packet(2, 4, 9);
        session.handle_datagram(AUTHORITY_INDEX, &relayed, &mut core, &mut sink).unwrap();
        assert_eq!(session.state[2].frame(), 4);
    }

    #[test]
    fn malformed_state_packet_is_rejected() {
        let (mut session, _clock, mut sink) = hosted_session();
        let mut core = CountingCore { frames: 0 };

        let packet = vec![Channel::Input.to_byte(), 1, 2, 3];
        let result = session.handle_datagram(0, &packet, &mut core, &mut sink);
        assert!(matches!(result, Err(SessionError::MalformedStatePacket { .. })));
    }

    #[test]
    fn reserved_channel_errors() {
        let (mut session, _clock, mut sink) = hosted_session();
        let mut core = CountingCore { frames: 0 };
        let result = session.handle_datagram(0, &[0x00, 1], &mut core, &mut sink);
        assert!(matches!(result, Err(SessionError::ReservedChannel(_))));
    }

    #[test]
    fn gate_honors_the_ring_window() {
        let (mut session, _clock, _sink) = hosted_session();

        // Our own ring buffered to the delay target
        session.state[AUTHORITY_INDEX].set_frame(session.delay_frames - 1);

        // Seated peer exactly at the far edge of the window: accepted
        session.state[0].set_frame(DELAY_BUFFER_SIZE as i64 - 1);
        assert!(session.tick_gate_open());

        // One frame beyond the ring: rejected
        session.state[0].set_frame(DELAY_BUFFER_SIZE as i64);
        assert!(!session.tick_gate_open());

        // Behind the current frame: rejected
        session.frame_counter = 3;
        session.state[AUTHORITY_INDEX].set_frame(3 + session.delay_frames - 1);
        session.state[0].set_frame(2);
        assert!(!session.tick_gate_open());
    }

    #[test]
    fn waiting_sentinel_blocks_the_gate() {
        let (mut session, _clock, _sink) = hosted_session();
        session.frame_counter = WAITING_FOR_SAVE_STATE_SENTINEL;
        assert!(!session.tick_gate_open());
    }

    #[test]
    fn unhosted_session_ticks_alone() {
        let clock = ManualClock(Rc::new(Cell::new(1_000_000)));
        let mut session =
            Session::new(NullTransport, clock.clone(), SessionConfig::default());
        let mut sink = RecordingSink::default();
        session.process_signal(&Signal::Connect { peer_id: OUR_ID }, &mut sink).unwrap();

        let mut core = CountingCore { frames: 0 };
        let idle = [0i16; INPUT_WORDS];
        for _ in 0..10 {
            clock.0.set(clock.0.get() + 16_667);
            session.poll(&mut core, &mut sink, &idle, false).unwrap();
        }
        assert!(core.frames >= 8);
        assert_eq!(session.frame_counter(), core.frames as i64);
    }

    #[test]
    fn serialize_failure_is_recorded_as_a_local_fault() {
        struct BrokenSaveCore;

        impl SimulationCore for BrokenSaveCore {
            fn run_one_frame(&mut self, _inputs: &InputPlane) {}
            fn serialize_size(&mut self) -> usize {
                16
            }
            fn serialize(&mut self, _buffer: &mut [u8]) -> bool {
                false
            }
            fn unserialize(&mut self, _buffer: &[u8]) -> bool {
                true
            }
        }

        let clock = ManualClock(Rc::new(Cell::new(1_000_000)));
        let mut session =
            Session::new(NullTransport, clock.clone(), SessionConfig::default());
        let mut sink = RecordingSink::default();
        session.process_signal(&Signal::Connect { peer_id: OUR_ID }, &mut sink).unwrap();

        let mut core = BrokenSaveCore;
        let idle = [0i16; INPUT_WORDS];
        let outcome = session.poll(&mut core, &mut sink, &idle, true).unwrap();
        assert!(outcome.ticked);
        assert!(!outcome.saved_state);

        assert!(matches!(
            session.take_local_fault(),
            Some(SessionError::StateSaveFailed { size: 16 })
        ));
        assert!(session.take_local_fault().is_none());
    }

    #[test]
    fn oversized_state_packet_is_dropped_and_recorded() {
        let (mut session, _clock, _sink) = hosted_session();

        // An incompressible input plane blows the ring past one datagram
        for slot in 0..DELAY_BUFFER_SIZE {
            for port in 0..PORT_COUNT {
                for word in session.state[AUTHORITY_INDEX].input_mut(slot, port).iter_mut() {
                    *word = 0x0101_i16.into();
                }
            }
        }

        session.broadcast_own_state();
        assert!(matches!(
            session.take_local_fault(),
            Some(SessionError::PacketTooLarge { size, max: PACKET_SIZE_MAX }) if size > PACKET_SIZE_MAX
        ));
    }

    #[test]
    fn pending_delta_lifts_the_input_cap() {
        let (mut session, _clock, mut sink) = hosted_session();

        // Stalled: head already at the delay target
        session.frame_counter = 10;
        session.state[AUTHORITY_INDEX].set_frame(10 + session.delay_frames);

        let idle = [0i16; INPUT_WORDS];
        session.advance_local_input(&idle);
        assert_eq!(session.state[AUTHORITY_INDEX].frame(), 10 + session.delay_frames);

        // A kick is resolved; the delta must still reach the ring
        session
            .process_signal(
                &Signal::Join { peer_id: PEER_B, room: kicked_room(&session) },
                &mut sink,
            )
            .unwrap();
        assert!(!session.next_room_xor_delta.is_zero());

        session.advance_local_input(&idle);
        let head = session.state[AUTHORITY_INDEX].frame();
        assert_eq!(head, 11 + session.delay_frames);
        assert!(!session.state[AUTHORITY_INDEX].room_delta(PortState::slot(head)).is_zero());

        // With the removal committed in the ring, the stale port no longer
        // gates
        session.state[0].set_frame(0);
        assert!(session.tick_gate_open());
    }

    fn kicked_room(session: &Session<NullTransport, ManualClock>) -> Room {
        let mut desired = session.room_we_are_in;
        desired.set_peer_id(0, cadence_proto::PEER_AVAILABLE);
        desired
    }
}
