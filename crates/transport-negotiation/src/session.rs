//! One peer connection session.
//!
//! A [`PeerSession`] owns the negotiation state machine, the channel
//! coordinator and the outbound signal batch for a single remote endpoint.
//! Primitive notifications arrive on one dispatcher task and are handled in
//! the order they were raised. Inbound batches are applied one signal at a
//! time, never reordered, and outbound round trips are serialized so at most
//! one is in flight.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::binding::SignalTransfer;
use crate::channel::{ChannelCoordinator, DataChannel, Restriction};
use crate::config::{ChannelOptions, SessionConfig};
use crate::diagnostics::{ConnectionReport, extract_report};
use crate::error::NegotiationError;
use crate::negotiation::{NegotiationFlags, Negotiator, chatter};
use crate::primitive::rtc::{RtcPrimitive, VirtualNetwork};
use crate::primitive::{
    ConnectionPrimitive, ConnectionState, GatheringState, PrimitiveEvent, SignalingState,
};
use crate::signal::{Signal, SignalBatch};

/// Where locally generated signals go.
enum SignalRoute {
    /// Accumulate until someone pulls them.
    Pull,
    /// Accumulate and push through the transfer whenever nothing is in
    /// flight.
    Transfer(Arc<dyn SignalTransfer>),
    /// Hand each signal to an in-process peer as it is generated.
    Direct(mpsc::UnboundedSender<Signal>),
}

struct Outbound {
    pending: SignalBatch,
    route: SignalRoute,
}

pub struct PeerSession {
    config: SessionConfig,
    primitive: Arc<dyn ConnectionPrimitive>,
    negotiator: Negotiator,
    channels: ChannelCoordinator,
    outbound: Mutex<Outbound>,
    /// Held while an inbound signal is applied, and by the dispatcher while it
    /// emits a candidate, so no local candidate overtakes the answer it
    /// belongs to.
    inbound: AsyncMutex<()>,
    respond_serial: AsyncMutex<()>,
    transfer_serial: AsyncMutex<()>,
    activity: watch::Sender<u64>,
    state: watch::Sender<ConnectionState>,
    closed: watch::Sender<Option<ConnectionState>>,
    started_at: Instant,
    last_report: Mutex<Option<ConnectionReport>>,
    this: Weak<PeerSession>,
}

impl PeerSession {
    /// Wraps `primitive` and starts dispatching its events. Must be called
    /// inside a tokio runtime.
    pub fn new(config: SessionConfig, primitive: Arc<dyn ConnectionPrimitive>) -> Arc<Self> {
        let events = primitive.take_events();
        let session = Arc::new_cyclic(|this| Self {
            negotiator: Negotiator::new(
                config.label.clone(),
                config.polite,
                config.explicit_rollback,
                config.debug,
                Arc::clone(&primitive),
            ),
            channels: ChannelCoordinator::new(
                config.label.clone(),
                config.debug,
                Arc::clone(&primitive),
            ),
            outbound: Mutex::new(Outbound {
                pending: Vec::new(),
                route: SignalRoute::Pull,
            }),
            inbound: AsyncMutex::new(()),
            respond_serial: AsyncMutex::new(()),
            transfer_serial: AsyncMutex::new(()),
            activity: watch::channel(0).0,
            state: watch::channel(primitive.connection_state()).0,
            closed: watch::channel(None).0,
            started_at: Instant::now(),
            last_report: Mutex::new(None),
            this: this.clone(),
            primitive,
            config,
        });

        match events {
            Some(events) => {
                tokio::spawn(dispatch(Arc::downgrade(&session), events));
            }
            None => {
                tracing::warn!(
                    target: "webrtc",
                    session = %session.label(),
                    "primitive events already taken; session will not react to them"
                );
            }
        }
        session
    }

    /// Session over a real peer connection.
    pub async fn connect(config: SessionConfig) -> Result<Arc<Self>, NegotiationError> {
        let primitive = RtcPrimitive::connect(&config).await?;
        Ok(Self::new(config, primitive))
    }

    /// Session over a real peer connection attached to an in-process network.
    pub async fn on_virtual_network(
        config: SessionConfig,
        network: &VirtualNetwork,
    ) -> Result<Arc<Self>, NegotiationError> {
        let primitive = RtcPrimitive::on_virtual_network(&config, network).await?;
        Ok(Self::new(config, primitive))
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn polite(&self) -> bool {
        self.negotiator.polite()
    }

    pub fn flags(&self) -> NegotiationFlags {
        self.negotiator.flags()
    }

    pub fn rolled_back(&self) -> bool {
        self.flags().rolled_back
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.primitive.signaling_state()
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.primitive.gathering_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// True until anything has been negotiated or the transport moved.
    pub fn never_attempted(&self) -> bool {
        self.connection_state() == ConnectionState::New
            && self.signaling_state() == SignalingState::Stable
            && !self.flags().attempted
    }

    pub fn primitive(&self) -> &Arc<dyn ConnectionPrimitive> {
        &self.primitive
    }

    pub fn channels(&self) -> &ChannelCoordinator {
        &self.channels
    }

    async fn handle_event(&self, event: PrimitiveEvent) {
        if self.is_closed() && !matches!(event, PrimitiveEvent::ConnectionState(_)) {
            chatter!(self.config.debug, target: "webrtc", session = %self.label(), event = ?event, "dropping event after close");
            return;
        }
        match event {
            PrimitiveEvent::IceCandidate(candidate) => {
                let _ordered = self.inbound.lock().await;
                self.signal(Signal::Candidate(candidate));
            }
            PrimitiveEvent::DataChannel(channel) => {
                self.channels.adopt(channel);
            }
            PrimitiveEvent::NegotiationNeeded => {
                if let Some(offer) = self.negotiator.on_negotiation_needed().await {
                    self.signal(offer);
                }
            }
            PrimitiveEvent::ConnectionState(state) => {
                chatter!(self.config.debug, target: "webrtc", session = %self.label(), state = ?state, "connection state");
                if !self.is_closed() {
                    self.state.send_replace(state);
                }
                if state.is_terminal() {
                    self.finish(state);
                }
                self.bump();
            }
            PrimitiveEvent::GatheringState(state) => {
                chatter!(self.config.debug, target: "webrtc", session = %self.label(), state = ?state, "gathering state");
                self.bump();
            }
        }
    }

    fn bump(&self) {
        self.activity.send_modify(|count| *count = count.wrapping_add(1));
    }

    fn finish(&self, state: ConnectionState) {
        let first = self.closed.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(state);
            true
        });
        if !first {
            return;
        }
        self.state.send_replace(state);
        tracing::debug!(target: "webrtc", session = %self.label(), state = ?state, "session closed");
        self.primitive.detach();
        self.channels.shutdown();
        self.bump();
    }

    /// Queues or forwards one locally generated signal according to the
    /// current route.
    pub(crate) fn signal(&self, signal: Signal) {
        chatter!(self.config.debug, target: "webrtc", session = %self.label(), kind = signal.kind(), "outbound signal");
        let push = {
            let mut guard = self.outbound.lock();
            let outbound = &mut *guard;
            match &outbound.route {
                SignalRoute::Direct(peer) => {
                    if let Err(mpsc::error::SendError(signal)) = peer.send(signal) {
                        tracing::warn!(target: "webrtc", session = %self.label(), kind = signal.kind(), "direct peer gone; keeping signal");
                        outbound.pending.push(signal);
                    }
                    false
                }
                SignalRoute::Transfer(_) => {
                    outbound.pending.push(signal);
                    true
                }
                SignalRoute::Pull => {
                    outbound.pending.push(signal);
                    false
                }
            }
        };
        self.bump();
        if push {
            self.spawn_send_pending();
        }
    }

    fn spawn_send_pending(&self) {
        let Some(session) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = session.send_pending(false).await {
                tracing::warn!(target: "webrtc", session = %session.label(), error = %err, "signal transfer failed");
            }
        });
    }

    pub(crate) fn route_direct(&self, peer: mpsc::UnboundedSender<Signal>) {
        let mut outbound = self.outbound.lock();
        for signal in outbound.pending.drain(..) {
            let _ = peer.send(signal);
        }
        outbound.route = SignalRoute::Direct(peer);
    }

    /// Pushes outbound signals through `transfer` from now on, starting with
    /// anything already pending.
    pub fn use_transfer(&self, transfer: Arc<dyn SignalTransfer>) {
        let flush = {
            let mut outbound = self.outbound.lock();
            outbound.route = SignalRoute::Transfer(transfer);
            !outbound.pending.is_empty()
        };
        if flush {
            self.spawn_send_pending();
        }
    }

    /// Drains the outbound batch.
    pub fn take_pending(&self) -> SignalBatch {
        std::mem::take(&mut self.outbound.lock().pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.outbound.lock().pending.is_empty()
    }

    /// Applies an inbound batch strictly in order. Answers produced along the
    /// way go out through the current route.
    pub async fn apply_signals(&self, batch: SignalBatch) -> Result<(), NegotiationError> {
        for signal in batch {
            let _ordered = self.inbound.lock().await;
            chatter!(self.config.debug, target: "webrtc", session = %self.label(), kind = signal.kind(), "inbound signal");
            if let Some(reply) = self.negotiator.on_signal(signal).await? {
                self.signal(reply);
            }
        }
        Ok(())
    }

    /// Callee side of a request/response exchange: applies `batch`, then
    /// waits until there is something to send back. Returns an empty batch
    /// once the session is connected or closed with nothing pending.
    /// Concurrent calls run one after another.
    pub async fn respond(&self, batch: SignalBatch) -> Result<SignalBatch, NegotiationError> {
        let _serial = self.respond_serial.lock().await;
        let mut activity = self.activity.subscribe();
        self.apply_signals(batch).await?;
        loop {
            activity.borrow_and_update();
            let pending = self.take_pending();
            if !pending.is_empty() {
                chatter!(self.config.debug, target: "webrtc", session = %self.label(), count = pending.len(), "responding");
                return Ok(pending);
            }
            if self.is_closed() || self.connection_state() == ConnectionState::Connected {
                return Ok(Vec::new());
            }
            if activity.changed().await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Sends the pending batch through the configured transfer and applies
    /// the reply. Without `force` an empty batch is not sent. Does nothing
    /// when no transfer is configured.
    pub async fn send_pending(&self, force: bool) -> Result<(), NegotiationError> {
        let _serial = self.transfer_serial.lock().await;
        let transfer = match &self.outbound.lock().route {
            SignalRoute::Transfer(transfer) => Some(Arc::clone(transfer)),
            _ => None,
        };
        let Some(transfer) = transfer else {
            return Ok(());
        };
        let batch = self.take_pending();
        if batch.is_empty() && !force {
            return Ok(());
        }
        let sent = batch.len();
        let started = Instant::now();
        let reply = transfer.transfer(batch).await?;
        chatter!(
            self.config.debug,
            target: "webrtc",
            session = %self.label(),
            sent,
            received = reply.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "signal round trip"
        );
        self.apply_signals(reply).await
    }

    /// Resolves once there is something to send, or the session is
    /// connected or closed.
    pub async fn signals_ready(&self) {
        let mut activity = self.activity.subscribe();
        loop {
            activity.borrow_and_update();
            if self.has_pending()
                || self.is_closed()
                || self.connection_state() == ConnectionState::Connected
            {
                return;
            }
            if activity.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drives negotiation by polling `responder` with the pending batch and
    /// applying its replies. Stops once a reply is empty, local gathering is
    /// complete and nothing is left to send.
    pub async fn connect_via(&self, responder: &dyn SignalTransfer) -> Result<(), NegotiationError> {
        self.signals_ready().await;
        let mut activity = self.activity.subscribe();
        let mut rounds = 0u32;
        loop {
            if self.is_closed() {
                return Err(NegotiationError::Closed);
            }
            activity.borrow_and_update();
            let batch = self.take_pending();
            let sent = batch.len();
            let reply = responder.transfer(batch).await?;
            let received = reply.len();
            self.apply_signals(reply).await?;
            rounds += 1;
            chatter!(self.config.debug, target: "webrtc", session = %self.label(), round = rounds, sent, received, "poll round");

            if received > 0 || self.has_pending() {
                continue;
            }
            if self.gathering_state() == GatheringState::Complete {
                break;
            }
            if activity.changed().await.is_err() {
                break;
            }
        }
        tracing::debug!(target: "webrtc", session = %self.label(), rounds, "polling finished");
        Ok(())
    }

    /// Resolves once the transport is connected.
    pub async fn connected(&self) -> Result<(), NegotiationError> {
        let mut activity = self.activity.subscribe();
        loop {
            activity.borrow_and_update();
            if self.is_closed() {
                return Err(NegotiationError::Closed);
            }
            if self.connection_state() == ConnectionState::Connected {
                return Ok(());
            }
            if activity.changed().await.is_err() {
                return Err(NegotiationError::Closed);
            }
        }
    }

    /// Resolves with the terminal state that ended the session.
    pub async fn closed(&self) -> ConnectionState {
        let mut closed = self.closed.subscribe();
        match closed.wait_for(Option::is_some).await {
            Ok(state) => state.unwrap_or(ConnectionState::Closed),
            Err(_) => ConnectionState::Closed,
        }
    }

    /// Terminal state, if the session has ended.
    pub fn closed_state(&self) -> Option<ConnectionState> {
        *self.closed.borrow()
    }

    /// Closes right away. `closed()` resolves without waiting for the
    /// primitive or for channels to wind down. Safe to call repeatedly.
    pub async fn close(&self) {
        self.finish(ConnectionState::Closed);
        if let Err(err) = self.primitive.close().await {
            tracing::warn!(target: "webrtc", session = %self.label(), error = %err, "error closing peer connection");
        }
    }

    pub async fn open_channel(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Arc<DataChannel>, NegotiationError> {
        self.channels.open(name, options).await
    }

    pub async fn await_channel(
        &self,
        name: &str,
        restriction: Restriction,
    ) -> Result<Arc<DataChannel>, NegotiationError> {
        self.channels.await_open(name, restriction).await
    }

    /// An open channel named `name`, created here if neither side has one.
    pub async fn ensure_channel(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Arc<DataChannel>, NegotiationError> {
        let live: Vec<Arc<DataChannel>> = self
            .channels
            .channels(name)
            .into_iter()
            .filter(|channel| !channel.is_closed())
            .collect();
        if let Some(open) = live.iter().find(|channel| channel.is_open()) {
            return Ok(Arc::clone(open));
        }
        if live.is_empty() {
            let created = self.channels.open(name, options).await?;
            chatter!(
                self.config.debug,
                target: "webrtc",
                session = %self.label(),
                channel = %name,
                id = ?created.id(),
                "no live channel, opened another"
            );
        }
        self.channels.await_open(name, Restriction::Any).await
    }

    /// Reads the selected candidate pair from the transport statistics.
    /// With `log` the summary is written at info level.
    pub async fn report_connection(&self, log: bool) -> Option<ConnectionReport> {
        let snapshot = self.primitive.stats().await;
        let report = extract_report(&snapshot, self.started_at.elapsed());
        match &report {
            Some(report) if log => {
                tracing::info!(target: "webrtc", session = %self.label(), "connected {}", report.summary());
            }
            Some(report) => {
                chatter!(self.config.debug, target: "webrtc", session = %self.label(), summary = %report.summary(), "connection report");
            }
            None => {
                tracing::warn!(
                    target: "webrtc",
                    session = %self.label(),
                    pairs = snapshot.candidate_pairs.len(),
                    "no selected candidate pair"
                );
            }
        }
        *self.last_report.lock() = report.clone();
        report
    }

    pub fn last_report(&self) -> Option<ConnectionReport> {
        self.last_report.lock().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("label", &self.config.label)
            .field("polite", &self.config.polite)
            .field("state", &self.connection_state())
            .field("closed", &self.closed_state())
            .finish()
    }
}

async fn dispatch(session: Weak<PeerSession>, mut events: mpsc::UnboundedReceiver<PrimitiveEvent>) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::DirectLink;
    use crate::channel::ChannelOrigin;
    use crate::primitive::mock::{MockNetwork, MockOptions, MockPrimitive};
    use crate::signal::IceCandidate;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn session(network: &Arc<MockNetwork>, label: &str, polite: bool) -> (Arc<PeerSession>, Arc<MockPrimitive>) {
        let primitive = network.create(label);
        let config = SessionConfig::builder(label)
            .polite(polite)
            .debug(true)
            .localhost_only()
            .build();
        (PeerSession::new(config, primitive.clone()), primitive)
    }

    fn candidate(text: &str) -> Signal {
        Signal::Candidate(IceCandidate {
            candidate: text.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
    }

    async fn exchange_until_connected(a: &PeerSession, b: &PeerSession) {
        for _ in 0..100 {
            let to_b = a.take_pending();
            let to_a = b.take_pending();
            b.apply_signals(to_b).await.expect("b applies");
            a.apply_signals(to_a).await.expect("a applies");
            if a.connection_state() == ConnectionState::Connected
                && b.connection_state() == ConnectionState::Connected
            {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("sessions never connected");
    }

    #[tokio::test]
    async fn simultaneous_offers_roll_back_only_the_polite_side() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("a channel");
        b.open_channel("data", ChannelOptions::default())
            .await
            .expect("b channel");
        timeout(WAIT, a.signals_ready()).await.expect("a offers");
        timeout(WAIT, b.signals_ready()).await.expect("b offers");

        exchange_until_connected(&a, &b).await;

        assert!(!a.rolled_back());
        assert!(b.rolled_back());
        timeout(WAIT, a.await_channel("data", Restriction::Any))
            .await
            .expect("a data in time")
            .expect("a data");
        timeout(WAIT, b.await_channel("data", Restriction::Any))
            .await
            .expect("b data in time")
            .expect("b data");
    }

    #[tokio::test]
    async fn batch_is_applied_in_order() {
        let network = MockNetwork::new();
        let (b, primitive) = session(&network, "b", true);
        let remote = network.create("remote");
        let offer = remote.create_offer().await.expect("offer");

        b.apply_signals(vec![
            Signal::Description(offer),
            candidate("candidate:1 1 udp 1 10.1.0.9 9 typ host"),
            candidate("candidate:2 1 udp 1 10.1.0.9 10 typ host"),
        ])
        .await
        .expect("applied");

        assert_eq!(
            primitive.operations(),
            vec![
                "set_remote:offer".to_string(),
                "set_local:answer".to_string(),
                "add_candidate:candidate:1 1 udp 1 10.1.0.9 9 typ host".to_string(),
                "add_candidate:candidate:2 1 udp 1 10.1.0.9 10 typ host".to_string(),
            ]
        );
        let pending = b.take_pending();
        assert!(matches!(pending.first(), Some(Signal::Description(desc)) if !desc.is_offer()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);

        a.close().await;
        assert_eq!(a.closed().await, ConnectionState::Closed);
        a.close().await;
        assert_eq!(a.closed().await, ConnectionState::Closed);
        assert_eq!(a.connection_state(), ConnectionState::Closed);
        assert!(matches!(
            a.await_channel("data", Restriction::Any).await,
            Err(NegotiationError::Closed)
        ));
    }

    #[tokio::test]
    async fn early_and_late_candidates_are_dropped() {
        let network = MockNetwork::new();
        let (a, primitive) = session(&network, "a", false);

        a.apply_signals(vec![candidate("candidate:early 1 udp 1 10.1.0.9 9 typ host")])
            .await
            .expect("early candidate dropped");
        a.close().await;
        a.apply_signals(vec![candidate("candidate:late 1 udp 1 10.1.0.9 9 typ host")])
            .await
            .expect("late candidate dropped");

        assert!(primitive.operations().is_empty());
        assert_eq!(a.flags(), NegotiationFlags::default());
    }

    #[tokio::test]
    async fn respond_returns_answer_then_empty_once_connected() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("channel");
        timeout(WAIT, a.signals_ready()).await.expect("offer ready");
        let offer_only: SignalBatch = a
            .take_pending()
            .into_iter()
            .filter(Signal::is_description)
            .collect();
        assert_eq!(offer_only.len(), 1);

        let reply = timeout(WAIT, b.respond(offer_only))
            .await
            .expect("reply in time")
            .expect("reply");
        assert!(matches!(reply.first(), Some(Signal::Description(desc)) if !desc.is_offer()));
        assert!(reply[1..].iter().all(|signal| !signal.is_description()));

        a.apply_signals(reply).await.expect("answer applied");
        timeout(WAIT, a.connected()).await.expect("a in time").expect("a connected");
        timeout(WAIT, b.connected()).await.expect("b in time").expect("b connected");

        b.take_pending();
        let last = timeout(WAIT, b.respond(Vec::new()))
            .await
            .expect("final reply in time")
            .expect("final reply");
        assert!(last.is_empty());
    }

    #[tokio::test]
    async fn transfer_pushes_batches_and_applies_replies() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);
        a.use_transfer(b.clone());

        let ours = a
            .open_channel("data", ChannelOptions::default())
            .await
            .expect("channel");
        timeout(WAIT, a.connected()).await.expect("a in time").expect("a connected");
        let theirs = timeout(WAIT, b.await_channel("data", Restriction::Theirs))
            .await
            .expect("b channel in time")
            .expect("b channel");
        timeout(WAIT, a.await_channel("data", Restriction::Ours))
            .await
            .expect("a open in time")
            .expect("a open");

        ours.send_text("ping").await.expect("send");
        let received = timeout(WAIT, theirs.recv()).await.expect("recv in time");
        assert_eq!(received.as_ref().and_then(|p| p.as_text()), Some("ping"));
        assert_eq!(theirs.origin(), ChannelOrigin::Theirs);
    }

    #[tokio::test]
    async fn connect_via_stops_after_gathering_completes() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("channel");
        timeout(WAIT, a.connect_via(b.as_ref()))
            .await
            .expect("polling in time")
            .expect("polling");

        timeout(WAIT, a.connected()).await.expect("in time").expect("connected");
        assert_eq!(a.gathering_state(), GatheringState::Complete);
        assert!(!a.has_pending());
    }

    #[tokio::test]
    async fn direct_link_carries_messages_both_ways() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);
        let _link = DirectLink::connect(&a, &b);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("channel");
        let on_a = timeout(WAIT, a.await_channel("data", Restriction::Any))
            .await
            .expect("a in time")
            .expect("a");
        let on_b = timeout(WAIT, b.await_channel("data", Restriction::Any))
            .await
            .expect("b in time")
            .expect("b");

        on_a.send_text("to b").await.expect("send a");
        on_b.send_text("to a").await.expect("send b");
        let at_b = timeout(WAIT, on_b.recv()).await.expect("b recv");
        let at_a = timeout(WAIT, on_a.recv()).await.expect("a recv");
        assert_eq!(at_b, Some(crate::primitive::Payload::text("to b")));
        assert_eq!(at_a, Some(crate::primitive::Payload::text("to a")));
    }

    #[tokio::test]
    async fn local_close_reaches_the_far_side() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);
        let _link = DirectLink::connect(&a, &b);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("channel");
        timeout(WAIT, b.connected()).await.expect("in time").expect("connected");

        let report = a.report_connection(false).await.expect("report");
        assert_eq!(report.protocol, "udp");
        assert_eq!(report.candidate_type, "host");
        assert_eq!(a.last_report(), Some(report));

        a.close().await;
        let state = timeout(WAIT, b.closed()).await.expect("b closed in time");
        assert_eq!(state, ConnectionState::Disconnected);
        assert_eq!(a.closed().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn ensure_channel_reuses_the_open_channel() {
        let network = MockNetwork::new();
        let (a, primitive) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);
        let _link = DirectLink::connect(&a, &b);

        let first = timeout(WAIT, a.ensure_channel("data", ChannelOptions::default()))
            .await
            .expect("in time")
            .expect("first");
        let again = a
            .ensure_channel("data", ChannelOptions::default())
            .await
            .expect("again");
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(primitive.channel_count(), 1);
    }

    #[tokio::test]
    async fn ensure_channel_replaces_a_closed_winner() {
        let network = MockNetwork::new();
        let (a, primitive) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);
        let _link = DirectLink::connect(&a, &b);

        let first = timeout(WAIT, a.ensure_channel("data", ChannelOptions::default()))
            .await
            .expect("in time")
            .expect("first");
        let far_first = timeout(WAIT, b.await_channel("data", Restriction::Theirs))
            .await
            .expect("far side in time")
            .expect("far side");
        first.close().await.expect("close");
        timeout(WAIT, first.closed()).await.expect("closed in time");
        timeout(WAIT, far_first.closed()).await.expect("far side closed in time");

        let second = timeout(WAIT, a.ensure_channel("data", ChannelOptions::default()))
            .await
            .expect("second in time")
            .expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert!(second.is_open());
        assert_eq!(a.channels().channels("data").len(), 2);
        assert_eq!(primitive.channel_count(), 2);

        let any = a.await_channel("data", Restriction::Any).await.expect("any");
        assert!(Arc::ptr_eq(&any, &second));
        let theirs = timeout(WAIT, b.await_channel("data", Restriction::Theirs))
            .await
            .expect("b in time")
            .expect("b");
        assert!(!Arc::ptr_eq(&theirs, &far_first));
        assert!(!theirs.is_closed());
        second.send_text("again").await.expect("send");
        let received = timeout(WAIT, theirs.recv()).await.expect("recv in time");
        assert_eq!(received, Some(crate::primitive::Payload::text("again")));
    }

    #[tokio::test]
    async fn implicit_rollback_marks_only_the_polite_side() {
        let network = MockNetwork::with_options(MockOptions { auto_rollback: true });
        let build = |label: &str, polite: bool| {
            let config = SessionConfig::builder(label)
                .polite(polite)
                .debug(true)
                .localhost_only()
                .explicit_rollback(false)
                .build();
            PeerSession::new(config, network.create(label))
        };
        let a = build("a", false);
        let b = build("b", true);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("a channel");
        b.open_channel("data", ChannelOptions::default())
            .await
            .expect("b channel");
        timeout(WAIT, a.signals_ready()).await.expect("a offers");
        timeout(WAIT, b.signals_ready()).await.expect("b offers");

        exchange_until_connected(&a, &b).await;

        assert!(!a.rolled_back());
        assert!(b.rolled_back());
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        for side in [&a, &b] {
            let ours = timeout(WAIT, side.await_channel("data", Restriction::Ours))
                .await
                .expect("ours in time")
                .expect("ours");
            let theirs = timeout(WAIT, side.await_channel("data", Restriction::Theirs))
                .await
                .expect("theirs in time")
                .expect("theirs");
            assert!(!Arc::ptr_eq(&ours, &theirs));
            assert_eq!(side.channels().channels("data").len(), 2);
        }
    }

    #[tokio::test]
    async fn both_sides_opening_a_name_keep_both_channels() {
        let network = MockNetwork::new();
        let (a, _) = session(&network, "a", false);
        let (b, _) = session(&network, "b", true);
        let _link = DirectLink::connect(&a, &b);

        a.open_channel("data", ChannelOptions::default())
            .await
            .expect("a channel");
        let a_ours = timeout(WAIT, a.await_channel("data", Restriction::Ours))
            .await
            .expect("a ours in time")
            .expect("a ours");
        let b_theirs = timeout(WAIT, b.await_channel("data", Restriction::Theirs))
            .await
            .expect("b theirs in time")
            .expect("b theirs");

        b.open_channel("data", ChannelOptions::default())
            .await
            .expect("b channel");
        let b_ours = timeout(WAIT, b.await_channel("data", Restriction::Ours))
            .await
            .expect("b ours in time")
            .expect("b ours");
        let a_theirs = timeout(WAIT, a.await_channel("data", Restriction::Theirs))
            .await
            .expect("a theirs in time")
            .expect("a theirs");

        assert_eq!(a.channels().channels("data").len(), 2);
        assert_eq!(b.channels().channels("data").len(), 2);
        assert!(!Arc::ptr_eq(&a_ours, &a_theirs));
        assert!(!Arc::ptr_eq(&b_ours, &b_theirs));

        let a_any = a.await_channel("data", Restriction::Any).await.expect("a any");
        let b_any = b.await_channel("data", Restriction::Any).await.expect("b any");
        assert!(Arc::ptr_eq(&a_any, &a_ours));
        assert!(Arc::ptr_eq(&b_any, &b_theirs));

        b_ours.send_text("from b").await.expect("send");
        let received = timeout(WAIT, a_theirs.recv()).await.expect("recv in time");
        assert_eq!(received, Some(crate::primitive::Payload::text("from b")));
    }
}
