//! Deterministic in-memory peer connections.
//!
//! Peers created from one [`MockNetwork`] find each other through the sdp of
//! the descriptions they exchange. The signaling state machine follows the
//! offer/answer rules of a real peer connection closely enough to reproduce
//! glare: applying a remote offer while holding a local one fails unless the
//! network was built with `auto_rollback`. Two peers connect once both have
//! committed an offer/answer exchange; channels are then linked so that what
//! one side sends arrives on the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelEvent, ChannelPrimitive, ChannelState, ConnectionPrimitive, ConnectionState,
    EventSink, GatheringState, LocalDescription, Payload, PrimitiveEvent, SignalingState,
};
use crate::config::ChannelOptions;
use crate::diagnostics::{CandidatePairStats, CandidateStats, StatsSnapshot};
use crate::error::NegotiationError;
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

const SDP_PREFIX: &str = "mock-sdp";

#[derive(Clone, Copy, Debug, Default)]
pub struct MockOptions {
    /// Applying a remote offer over a local one rolls back implicitly.
    pub auto_rollback: bool,
}

pub struct MockNetwork {
    peers: Mutex<HashMap<u64, Weak<MockPrimitive>>>,
    next_peer: AtomicU64,
    options: MockOptions,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_options(MockOptions::default())
    }

    pub fn with_options(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            options,
        })
    }

    pub fn create(self: &Arc<Self>, label: &str) -> Arc<MockPrimitive> {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(MockPrimitive {
            id,
            label: label.to_string(),
            network: Arc::clone(self),
            state: Mutex::new(MockState::default()),
            events: EventSink::new(),
        });
        self.peers.lock().insert(id, Arc::downgrade(&peer));
        peer
    }

    fn peer(&self, id: u64) -> Option<Arc<MockPrimitive>> {
        self.peers.lock().get(&id).and_then(Weak::upgrade)
    }

    fn on_commit(&self, peer: &Arc<MockPrimitive>) {
        let Some(remote_id) = peer.state.lock().remote_peer else {
            return;
        };
        let Some(remote) = self.peer(remote_id) else {
            return;
        };
        let remote_ready = {
            let state = remote.state.lock();
            state.committed && state.remote_peer == Some(peer.id) && !state.closed
        };
        if !remote_ready {
            return;
        }
        let local_changed = peer.mark_connected();
        let remote_changed = remote.mark_connected();
        if local_changed || remote_changed {
            self.sync_channels(peer);
        }
    }

    fn sync_channels(&self, peer: &Arc<MockPrimitive>) {
        let Some(remote_id) = peer.state.lock().remote_peer else {
            return;
        };
        let Some(remote) = self.peer(remote_id) else {
            return;
        };
        if peer.connection_state() != ConnectionState::Connected
            || remote.connection_state() != ConnectionState::Connected
        {
            return;
        }
        link_channels(peer, &remote);
        link_channels(&remote, peer);
    }
}

/// Pairs every unlinked channel `local` created with a counterpart on
/// `remote`, announcing in-band channels and matching pre-negotiated ones by
/// id.
fn link_channels(local: &Arc<MockPrimitive>, remote: &Arc<MockPrimitive>) {
    let unlinked: Vec<Arc<MockChannel>> = local
        .state
        .lock()
        .channels
        .iter()
        .filter(|channel| !channel.announced && !channel.is_linked())
        .cloned()
        .collect();

    for channel in unlinked {
        if channel.negotiated {
            let counterpart = remote
                .state
                .lock()
                .channels
                .iter()
                .find(|candidate| {
                    candidate.negotiated && !candidate.is_linked() && candidate.id() == channel.id()
                })
                .cloned();
            if let Some(counterpart) = counterpart {
                MockChannel::pair(&channel, &counterpart);
                channel.open();
                counterpart.open();
            }
            continue;
        }

        let local_id = local.allocate_stream_id();
        channel.assign_id(local_id);
        let remote_id = remote.allocate_stream_id();
        let mirror = MockChannel::new(&channel.label, false, Some(remote_id), true);
        MockChannel::pair(&channel, &mirror);
        mirror.set_state(ChannelState::Open);
        remote.state.lock().channels.push(Arc::clone(&mirror));
        let announced: Arc<dyn ChannelPrimitive> = mirror.clone();
        remote.events.emit(PrimitiveEvent::DataChannel(announced));
        // A real transport raises open after the announcement as well.
        mirror.events.emit(ChannelEvent::Open);
        channel.open();
    }
}

#[derive(Default)]
struct MockState {
    signaling: Option<SignalingState>,
    connection: Option<ConnectionState>,
    gathering: Option<GatheringState>,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_peer: Option<u64>,
    committed: bool,
    sctp_negotiated: bool,
    needs_negotiation: bool,
    offers: u32,
    next_stream_id: u16,
    channels: Vec<Arc<MockChannel>>,
    operations: Vec<String>,
    closed: bool,
}

impl MockState {
    fn signaling(&self) -> SignalingState {
        self.signaling.unwrap_or(SignalingState::Stable)
    }

    fn connection(&self) -> ConnectionState {
        self.connection.unwrap_or(ConnectionState::New)
    }

    fn record(&mut self, operation: String) {
        self.operations.push(operation);
    }
}

pub struct MockPrimitive {
    id: u64,
    label: String,
    network: Arc<MockNetwork>,
    state: Mutex<MockState>,
    events: Arc<EventSink<PrimitiveEvent>>,
}

impl MockPrimitive {
    pub fn peer_id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Every signaling operation applied so far, in order.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Raises a connection state change as if the transport reported it.
    pub fn emit_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = Some(state);
        self.events.emit(PrimitiveEvent::ConnectionState(state));
    }

    pub fn emit_negotiation_needed(&self) {
        self.events.emit(PrimitiveEvent::NegotiationNeeded);
    }

    fn allocate_stream_id(&self) -> u16 {
        let mut state = self.state.lock();
        let id = state.next_stream_id;
        state.next_stream_id += 1;
        id
    }

    fn mark_connected(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || state.connection() == ConnectionState::Connected {
                return false;
            }
            state.connection = Some(ConnectionState::Connected);
        }
        self.events
            .emit(PrimitiveEvent::ConnectionState(ConnectionState::Connecting));
        self.events
            .emit(PrimitiveEvent::ConnectionState(ConnectionState::Connected));
        true
    }

    fn commit(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.committed = true;
            state.sctp_negotiated = true;
            state.needs_negotiation = false;
        }
        self.network.on_commit(self);
    }

    fn start_gathering(&self) {
        self.state.lock().gathering = Some(GatheringState::Gathering);
        self.events
            .emit(PrimitiveEvent::GatheringState(GatheringState::Gathering));
        self.events.emit(PrimitiveEvent::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 10.1.0.{} 9 typ host",
                self.id, self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        self.state.lock().gathering = Some(GatheringState::Complete);
        self.events
            .emit(PrimitiveEvent::GatheringState(GatheringState::Complete));
    }

    fn remote_hangup(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.connection() != ConnectionState::Connected {
                return;
            }
            state.connection = Some(ConnectionState::Disconnected);
        }
        self.events
            .emit(PrimitiveEvent::ConnectionState(ConnectionState::Disconnected));
    }

    fn self_arc(&self) -> Option<Arc<MockPrimitive>> {
        self.network.peer(self.id)
    }
}

fn parse_peer(desc: &SessionDescription) -> Result<u64, NegotiationError> {
    let mut parts = desc.sdp.split_whitespace();
    match (parts.next(), parts.next().and_then(|id| id.parse().ok())) {
        (Some(SDP_PREFIX), Some(id)) => Ok(id),
        _ => Err(NegotiationError::InvalidSignal(format!(
            "unrecognized sdp: {}",
            desc.sdp
        ))),
    }
}

fn closed_error() -> NegotiationError {
    NegotiationError::Primitive("peer connection is closed".into())
}

#[async_trait]
impl ConnectionPrimitive for MockPrimitive {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrimitiveEvent>> {
        self.events.take()
    }

    fn detach(&self) {
        self.events.close();
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error());
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "{SDP_PREFIX} {} offer-{}",
            self.id, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        if state.closed {
            return Err(closed_error());
        }
        if state.signaling() != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::Primitive(format!(
                "cannot answer in {:?}",
                state.signaling()
            )));
        }
        Ok(SessionDescription::answer(format!(
            "{SDP_PREFIX} {} answer",
            self.id
        )))
    }

    async fn set_local_description(
        &self,
        desc: LocalDescription,
    ) -> Result<(), NegotiationError> {
        tokio::task::yield_now().await;
        let (gather, commit) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(closed_error());
            }
            let current = state.signaling();
            match desc {
                LocalDescription::Rollback => {
                    state.record("rollback".into());
                    if current != SignalingState::HaveLocalOffer {
                        return Err(NegotiationError::Primitive(format!(
                            "cannot roll back in {current:?}"
                        )));
                    }
                    state.pending_local = None;
                    state.signaling = Some(SignalingState::Stable);
                    (false, false)
                }
                LocalDescription::Description(desc) => {
                    state.record(format!("set_local:{}", kind_name(desc.kind)));
                    match desc.kind {
                        SdpKind::Offer => {
                            if current != SignalingState::Stable {
                                return Err(NegotiationError::Primitive(format!(
                                    "cannot set local offer in {current:?}"
                                )));
                            }
                            state.pending_local = Some(desc);
                            state.signaling = Some(SignalingState::HaveLocalOffer);
                            (state.gathering.is_none(), false)
                        }
                        SdpKind::Answer => {
                            if current != SignalingState::HaveRemoteOffer {
                                return Err(NegotiationError::Primitive(format!(
                                    "cannot set local answer in {current:?}"
                                )));
                            }
                            state.current_local = Some(desc);
                            state.signaling = Some(SignalingState::Stable);
                            (state.gathering.is_none(), true)
                        }
                        _ => {
                            return Err(NegotiationError::Primitive(
                                "unsupported local description".into(),
                            ));
                        }
                    }
                }
            }
        };
        if gather {
            self.start_gathering();
        }
        if commit {
            if let Some(this) = self.self_arc() {
                this.commit();
            }
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        tokio::task::yield_now().await;
        let auto_rollback = self.network.options.auto_rollback;
        let commit = {
            let mut state = self.state.lock();
            state.record(format!("set_remote:{}", kind_name(desc.kind)));
            if state.closed {
                return Err(closed_error());
            }
            let peer = parse_peer(&desc)?;
            let current = state.signaling();
            match desc.kind {
                SdpKind::Offer => {
                    if current == SignalingState::HaveLocalOffer {
                        if !auto_rollback {
                            return Err(NegotiationError::Primitive(
                                "remote offer while in have-local-offer".into(),
                            ));
                        }
                        state.pending_local = None;
                    }
                    state.remote = Some(desc);
                    state.remote_peer = Some(peer);
                    state.signaling = Some(SignalingState::HaveRemoteOffer);
                    false
                }
                SdpKind::Answer => {
                    if current != SignalingState::HaveLocalOffer {
                        return Err(NegotiationError::Primitive(format!(
                            "cannot set remote answer in {current:?}"
                        )));
                    }
                    state.current_local = state.pending_local.take();
                    state.remote = Some(desc);
                    state.remote_peer = Some(peer);
                    state.signaling = Some(SignalingState::Stable);
                    true
                }
                _ => {
                    return Err(NegotiationError::Primitive(
                        "unsupported remote description".into(),
                    ));
                }
            }
        };
        if commit {
            if let Some(this) = self.self_arc() {
                this.commit();
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.record(format!("add_candidate:{}", candidate.candidate));
        if state.closed {
            return Err(closed_error());
        }
        if state.remote.is_none() {
            return Err(NegotiationError::Primitive(
                "candidate without remote description".into(),
            ));
        }
        if candidate.candidate.contains("invalid") {
            return Err(NegotiationError::Primitive("malformed candidate".into()));
        }
        Ok(())
    }

    async fn create_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn ChannelPrimitive>, NegotiationError> {
        let id = if options.pre_negotiated {
            options.id
        } else {
            None
        };
        let channel = MockChannel::new(label, options.pre_negotiated, id, false);
        let (fire, connected) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(closed_error());
            }
            state.channels.push(Arc::clone(&channel));
            let fire = !state.sctp_negotiated && !state.needs_negotiation;
            if fire {
                state.needs_negotiation = true;
            }
            (fire, state.connection() == ConnectionState::Connected)
        };
        if fire {
            self.events.emit(PrimitiveEvent::NegotiationNeeded);
        }
        if connected {
            if let Some(this) = self.self_arc() {
                self.network.sync_channels(&this);
            }
        }
        Ok(channel as Arc<dyn ChannelPrimitive>)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection()
    }

    fn gathering_state(&self) -> GatheringState {
        self.state.lock().gathering.unwrap_or(GatheringState::New)
    }

    async fn stats(&self) -> StatsSnapshot {
        let state = self.state.lock();
        if state.connection() != ConnectionState::Connected {
            return StatsSnapshot::default();
        }
        let remote = state.remote_peer.unwrap_or_default();
        let pair_id = format!("pair-{}-{}", self.id, remote);
        let local_id = format!("local-{}", self.id);
        let remote_id = format!("remote-{remote}");
        StatsSnapshot {
            selected_pair_id: Some(pair_id.clone()),
            candidate_pairs: vec![CandidatePairStats {
                id: pair_id,
                local_candidate_id: local_id.clone(),
                remote_candidate_id: remote_id.clone(),
                selected: true,
                nominated: true,
            }],
            candidates: HashMap::from([
                (
                    local_id.clone(),
                    CandidateStats {
                        id: local_id,
                        protocol: "udp".into(),
                        candidate_type: "host".into(),
                        address: Some(format!("10.1.0.{}", self.id)),
                        port: Some(9),
                    },
                ),
                (
                    remote_id.clone(),
                    CandidateStats {
                        id: remote_id,
                        protocol: "udp".into(),
                        candidate_type: "host".into(),
                        address: Some(format!("10.1.0.{remote}")),
                        port: Some(9),
                    },
                ),
            ]),
        }
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let (channels, remote) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.signaling = Some(SignalingState::Closed);
            state.connection = Some(ConnectionState::Closed);
            (std::mem::take(&mut state.channels), state.remote_peer)
        };
        for channel in channels {
            channel.hang_up();
        }
        let remote = remote.and_then(|id| self.network.peer(id));
        if let Some(remote) = remote {
            remote.remote_hangup();
        }
        Ok(())
    }
}

fn kind_name(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
        SdpKind::Pranswer => "pranswer",
        SdpKind::Rollback => "rollback",
    }
}

pub struct MockChannel {
    label: String,
    negotiated: bool,
    /// Created by the far side and delivered through an announcement.
    announced: bool,
    id: Mutex<Option<u16>>,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<MockChannel>>,
    events: Arc<EventSink<ChannelEvent>>,
}

impl MockChannel {
    fn new(label: &str, negotiated: bool, id: Option<u16>, announced: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            negotiated,
            announced,
            id: Mutex::new(id),
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            events: EventSink::new(),
        })
    }

    fn pair(a: &Arc<MockChannel>, b: &Arc<MockChannel>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    fn is_linked(&self) -> bool {
        self.peer.lock().upgrade().is_some()
    }

    fn assign_id(&self, id: u16) {
        self.id.lock().get_or_insert(id);
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    fn open(&self) {
        self.set_state(ChannelState::Open);
        self.events.emit(ChannelEvent::Open);
    }

    /// Closes this end without touching the peer.
    fn shut(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.events.emit(ChannelEvent::Closed);
        self.events.close();
    }

    fn hang_up(&self) {
        self.shut();
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.shut();
        }
    }
}

#[async_trait]
impl ChannelPrimitive for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> Option<u16> {
        *self.id.lock()
    }

    fn negotiated(&self) -> bool {
        self.negotiated
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    async fn send(&self, payload: Payload) -> Result<usize, NegotiationError> {
        if self.ready_state() != ChannelState::Open {
            return Err(NegotiationError::Primitive("channel is not open".into()));
        }
        let len = payload.len();
        if let Some(peer) = self.peer.lock().upgrade() {
            peer.events.emit(ChannelEvent::Message(payload));
        }
        Ok(len)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.hang_up();
        Ok(())
    }
}
