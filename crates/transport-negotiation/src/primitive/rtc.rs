//! Connection primitive backed by the `webrtc` crate.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::stats::StatsReportType;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{
    ChannelEvent, ChannelPrimitive, ChannelState, ConnectionPrimitive, ConnectionState,
    EventSink, GatheringState, LocalDescription, Payload, PrimitiveEvent, SignalingState,
};
use crate::config::{ChannelOptions, IceServer, SessionConfig};
use crate::diagnostics::{CandidatePairStats, CandidateStats, StatsSnapshot};
use crate::error::{NegotiationError, to_primitive_error};
use crate::signal::{IceCandidate, SdpKind, SessionDescription};

fn build_api(setting: SettingEngine) -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_primitive_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_primitive_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Setting engine carrying the session's ICE timeouts.
pub fn setting_engine(config: &SessionConfig) -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(config.ice_timeouts.disconnected),
        Some(config.ice_timeouts.failed),
        Some(config.ice_timeouts.keep_alive),
    );
    setting
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(NegotiationError::InvalidSignal(
                "rollback is not a remote description".into(),
            ));
        }
    };
    parsed.map_err(|err| NegotiationError::InvalidSignal(err.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidate, NegotiationError> {
    let init = candidate.to_json().map_err(to_primitive_error)?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn map_channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

/// A channel created on this side, kept so a replacement connection can
/// carry it.
struct LocalChannel {
    channel: Weak<RtcChannel>,
    label: String,
    init: RTCDataChannelInit,
    generation: u64,
}

/// Peer connection from the `webrtc` crate with its callbacks funneled into
/// one ordered event stream.
///
/// The crate cannot roll back a local offer. A rollback instead replaces the
/// connection with a fresh one built from the same api and configuration,
/// which is sound only while nothing has been negotiated yet. Channels
/// created here move to the replacement once it accepts the remote offer.
pub struct RtcPrimitive {
    label: String,
    api: API,
    rtc_config: RTCConfiguration,
    pc: RwLock<Arc<RTCPeerConnection>>,
    /// Bumped on every replacement; callbacks of older connections go quiet.
    generation: Arc<AtomicU64>,
    events: Arc<EventSink<PrimitiveEvent>>,
    local_channels: Mutex<Vec<LocalChannel>>,
    _network: Option<Arc<Net>>,
}

impl RtcPrimitive {
    pub async fn connect(config: &SessionConfig) -> Result<Arc<Self>, NegotiationError> {
        Self::with_setting(config, setting_engine(config), None).await
    }

    /// Peer connection whose sockets live on `network` instead of the host
    /// stack.
    pub async fn on_virtual_network(
        config: &SessionConfig,
        network: &VirtualNetwork,
    ) -> Result<Arc<Self>, NegotiationError> {
        let net = network.attach_host().await?;
        let mut setting = setting_engine(config);
        setting.set_vnet(Some(Arc::clone(&net)));
        setting.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        Self::with_setting(config, setting, Some(net)).await
    }

    pub async fn with_setting(
        config: &SessionConfig,
        setting: SettingEngine,
        network: Option<Arc<Net>>,
    ) -> Result<Arc<Self>, NegotiationError> {
        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config.clone())
                .await
                .map_err(to_primitive_error)?,
        );
        let primitive = Arc::new(Self {
            label: config.label.clone(),
            api,
            rtc_config,
            pc: RwLock::new(Arc::clone(&pc)),
            generation: Arc::new(AtomicU64::new(0)),
            events: EventSink::new(),
            local_channels: Mutex::new(Vec::new()),
            _network: network,
        });
        primitive.register_handlers(&pc, 0);
        Ok(primitive)
    }

    /// The peer connection currently in use.
    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.read())
    }

    fn register_handlers(&self, pc: &RTCPeerConnection, generation: u64) {
        let events = Arc::clone(&self.events);
        let current = Arc::clone(&self.generation);
        let log_label = self.label.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = Arc::clone(&events);
            let label = log_label.clone();
            let live = current.load(Ordering::Acquire) == generation;
            Box::pin(async move {
                let Some(candidate) = candidate.filter(|_| live) else {
                    return;
                };
                match from_rtc_candidate(&candidate) {
                    Ok(candidate) => {
                        events.emit(PrimitiveEvent::IceCandidate(candidate));
                    }
                    Err(err) => {
                        tracing::warn!(target: "webrtc", session = %label, error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let events = Arc::clone(&self.events);
        let current = Arc::clone(&self.generation);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = Arc::clone(&events);
            let live = current.load(Ordering::Acquire) == generation;
            Box::pin(async move {
                if live {
                    let channel: Arc<dyn ChannelPrimitive> = RtcChannel::wrap(dc);
                    events.emit(PrimitiveEvent::DataChannel(channel));
                }
            })
        }));

        let events = Arc::clone(&self.events);
        let current = Arc::clone(&self.generation);
        pc.on_negotiation_needed(Box::new(move || {
            let events = Arc::clone(&events);
            let live = current.load(Ordering::Acquire) == generation;
            Box::pin(async move {
                if live {
                    events.emit(PrimitiveEvent::NegotiationNeeded);
                }
            })
        }));

        let events = Arc::clone(&self.events);
        let current = Arc::clone(&self.generation);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = Arc::clone(&events);
            let live = current.load(Ordering::Acquire) == generation;
            Box::pin(async move {
                if live {
                    events.emit(PrimitiveEvent::ConnectionState(map_connection_state(state)));
                }
            })
        }));

        let events = Arc::clone(&self.events);
        let current = Arc::clone(&self.generation);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let events = Arc::clone(&events);
            let live = current.load(Ordering::Acquire) == generation;
            Box::pin(async move {
                let mapped = match state {
                    RTCIceGathererState::Gathering => GatheringState::Gathering,
                    RTCIceGathererState::Complete => GatheringState::Complete,
                    _ => GatheringState::New,
                };
                if live {
                    events.emit(PrimitiveEvent::GatheringState(mapped));
                }
            })
        }));
    }

    /// Swaps in a fresh peer connection in place of one holding an
    /// unanswered local offer.
    async fn replace_connection(&self) -> Result<(), NegotiationError> {
        let old = self.peer_connection();
        let state = old.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(NegotiationError::Primitive(format!(
                "cannot roll back from {state}"
            )));
        }
        if old.current_remote_description().await.is_some() {
            return Err(NegotiationError::Primitive(
                "cannot roll back a negotiated connection".into(),
            ));
        }

        let replacement = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(to_primitive_error)?,
        );
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.register_handlers(&replacement, generation);
        *self.pc.write() = replacement;

        silence(&old);
        for channel in self.live_channels() {
            channel.silence_current();
        }
        if let Err(err) = old.close().await {
            tracing::debug!(target: "webrtc", session = %self.label, error = %err, "error closing replaced peer connection");
        }
        tracing::debug!(target: "webrtc", session = %self.label, generation, "replaced peer connection to roll back local offer");
        Ok(())
    }

    fn live_channels(&self) -> Vec<Arc<RtcChannel>> {
        let mut local = self.local_channels.lock();
        local.retain(|entry| entry.channel.strong_count() > 0);
        local
            .iter()
            .filter_map(|entry| entry.channel.upgrade())
            .collect()
    }

    /// Recreates channels from older connections on the current one.
    async fn carry_channels(&self) -> Result<(), NegotiationError> {
        let generation = self.generation.load(Ordering::Acquire);
        let stale: Vec<(Arc<RtcChannel>, String, RTCDataChannelInit)> = {
            let mut local = self.local_channels.lock();
            local.retain(|entry| entry.channel.strong_count() > 0);
            local
                .iter_mut()
                .filter(|entry| entry.generation != generation)
                .filter_map(|entry| {
                    entry.generation = generation;
                    let channel = entry.channel.upgrade()?;
                    Some((channel, entry.label.clone(), entry.init.clone()))
                })
                .collect()
        };
        if stale.is_empty() {
            return Ok(());
        }
        let pc = self.peer_connection();
        for (channel, label, init) in stale {
            if !channel.ready_to_carry() {
                continue;
            }
            let dc = pc
                .create_data_channel(&label, Some(init))
                .await
                .map_err(to_primitive_error)?;
            channel.rebind(dc);
            tracing::trace!(target: "webrtc", session = %self.label, channel = %label, "carried channel to replacement connection");
        }
        Ok(())
    }
}

/// Replaces every connection callback with a no-op.
fn silence(pc: &RTCPeerConnection) {
    pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
    pc.on_data_channel(Box::new(|_| Box::pin(async {})));
    pc.on_negotiation_needed(Box::new(|| Box::pin(async {})));
    pc.on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
    pc.on_ice_gathering_state_change(Box::new(|_| Box::pin(async {})));
}

#[async_trait]
impl ConnectionPrimitive for RtcPrimitive {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrimitiveEvent>> {
        self.events.take()
    }

    fn detach(&self) {
        self.events.close();
        silence(&self.peer_connection());
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.carry_channels().await?;
        let offer = self
            .peer_connection()
            .create_offer(None)
            .await
            .map_err(to_primitive_error)?;
        from_rtc_description(offer)
            .ok_or_else(|| NegotiationError::Primitive("offer without a type".into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .peer_connection()
            .create_answer(None)
            .await
            .map_err(to_primitive_error)?;
        from_rtc_description(answer)
            .ok_or_else(|| NegotiationError::Primitive("answer without a type".into()))
    }

    async fn set_local_description(
        &self,
        desc: LocalDescription,
    ) -> Result<(), NegotiationError> {
        let rtc_desc = match desc {
            LocalDescription::Description(desc) => to_rtc_description(desc)?,
            LocalDescription::Rollback => return self.replace_connection().await,
        };
        self.peer_connection()
            .set_local_description(rtc_desc)
            .await
            .map_err(to_primitive_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc_desc = to_rtc_description(desc)?;
        self.peer_connection()
            .set_remote_description(rtc_desc)
            .await
            .map_err(to_primitive_error)?;
        self.carry_channels().await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection()
            .add_ice_candidate(init)
            .await
            .map_err(to_primitive_error)
    }

    async fn create_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn ChannelPrimitive>, NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: options.ordered,
            max_packet_life_time: options.max_packet_life_time,
            max_retransmits: options.max_retransmits,
            protocol: options.protocol.clone(),
            negotiated: if options.pre_negotiated {
                options.id
            } else {
                None
            },
        };
        let dc = self
            .peer_connection()
            .create_data_channel(label, Some(init.clone()))
            .await
            .map_err(to_primitive_error)?;
        let channel = RtcChannel::wrap(dc);
        self.local_channels.lock().push(LocalChannel {
            channel: Arc::downgrade(&channel),
            label: label.to_string(),
            init,
            generation: self.generation.load(Ordering::Acquire),
        });
        Ok(channel)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.peer_connection()
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection().remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.peer_connection().signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.peer_connection().connection_state())
    }

    fn gathering_state(&self) -> GatheringState {
        match self.peer_connection().ice_gathering_state() {
            RTCIceGatheringState::Gathering => GatheringState::Gathering,
            RTCIceGatheringState::Complete => GatheringState::Complete,
            _ => GatheringState::New,
        }
    }

    async fn stats(&self) -> StatsSnapshot {
        let report = self.peer_connection().get_stats().await;
        let mut snapshot = StatsSnapshot::default();
        for stats in report.reports.into_values() {
            match stats {
                StatsReportType::CandidatePair(pair) => {
                    let selected = pair.nominated && pair.state == CandidatePairState::Succeeded;
                    snapshot.candidate_pairs.push(CandidatePairStats {
                        id: pair.id,
                        local_candidate_id: pair.local_candidate_id,
                        remote_candidate_id: pair.remote_candidate_id,
                        selected,
                        nominated: pair.nominated,
                    });
                }
                StatsReportType::LocalCandidate(candidate)
                | StatsReportType::RemoteCandidate(candidate) => {
                    let network = candidate.network_type.to_string();
                    let protocol = network.trim_end_matches(|c: char| c.is_ascii_digit());
                    snapshot.candidates.insert(
                        candidate.id.clone(),
                        CandidateStats {
                            id: candidate.id,
                            protocol: protocol.to_string(),
                            candidate_type: candidate.candidate_type.to_string(),
                            address: Some(candidate.ip),
                            port: Some(candidate.port),
                        },
                    );
                }
                _ => {}
            }
        }
        snapshot
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection()
            .close()
            .await
            .map_err(to_primitive_error)
    }
}

pub struct RtcChannel {
    dc: RwLock<Arc<RTCDataChannel>>,
    events: Arc<EventSink<ChannelEvent>>,
    closed_locally: AtomicBool,
}

impl RtcChannel {
    /// Registers callbacks immediately so nothing the transport delivers
    /// before the coordinator subscribes is lost.
    pub fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let events: Arc<EventSink<ChannelEvent>> = EventSink::new();
        bind_channel(&dc, &events);
        Arc::new(Self {
            dc: RwLock::new(dc),
            events,
            closed_locally: AtomicBool::new(false),
        })
    }

    fn current(&self) -> Arc<RTCDataChannel> {
        Arc::clone(&self.dc.read())
    }

    fn silence_current(&self) {
        silence_channel(&self.current());
    }

    /// Moves this handle onto `dc`, a channel of a replacement connection.
    fn rebind(&self, dc: Arc<RTCDataChannel>) {
        let old = std::mem::replace(&mut *self.dc.write(), Arc::clone(&dc));
        silence_channel(&old);
        bind_channel(&dc, &self.events);
    }

    fn ready_to_carry(&self) -> bool {
        !self.closed_locally.load(Ordering::Acquire)
    }
}

fn bind_channel(dc: &RTCDataChannel, events: &Arc<EventSink<ChannelEvent>>) {
    let sink = Arc::clone(events);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            let payload = if msg.is_string {
                Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Payload::Binary(msg.data)
            };
            sink.emit(ChannelEvent::Message(payload));
        })
    }));

    let sink = Arc::clone(events);
    dc.on_error(Box::new(move |err| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.emit(ChannelEvent::Error(err.to_string()));
        })
    }));

    let sink = Arc::clone(events);
    dc.on_close(Box::new(move || {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.emit(ChannelEvent::Closed);
            sink.close();
        })
    }));

    // Registered last: fires immediately when the channel is already open.
    let sink = Arc::clone(events);
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            sink.emit(ChannelEvent::Open);
        })
    }));
}

fn silence_channel(dc: &RTCDataChannel) {
    dc.on_message(Box::new(|_| Box::pin(async {})));
    dc.on_error(Box::new(|_| Box::pin(async {})));
    dc.on_close(Box::new(|| Box::pin(async {})));
    dc.on_open(Box::new(|| Box::pin(async {})));
}

#[async_trait]
impl ChannelPrimitive for RtcChannel {
    fn label(&self) -> String {
        self.current().label().to_string()
    }

    fn id(&self) -> Option<u16> {
        let dc = self.current();
        if dc.negotiated() || map_channel_state(dc.ready_state()) != ChannelState::Connecting {
            Some(dc.id())
        } else {
            None
        }
    }

    fn negotiated(&self) -> bool {
        self.current().negotiated()
    }

    fn ready_state(&self) -> ChannelState {
        map_channel_state(self.current().ready_state())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    async fn send(&self, payload: Payload) -> Result<usize, NegotiationError> {
        let dc = self.current();
        let sent = match payload {
            Payload::Text(text) => dc.send_text(text).await,
            Payload::Binary(bytes) => dc.send(&bytes).await,
        };
        sent.map_err(to_primitive_error)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.closed_locally.store(true, Ordering::Release);
        self.current().close().await.map_err(to_primitive_error)
    }
}

/// In-process network for running real peer connections without OS sockets.
///
/// Hosts are handed addresses from 10.0.0.2 upward.
pub struct VirtualNetwork {
    router: Arc<AsyncMutex<Router>>,
    next_host: AtomicU8,
}

impl VirtualNetwork {
    pub fn new() -> Result<Arc<Self>, NegotiationError> {
        let router = Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .map_err(to_primitive_error)?;
        Ok(Arc::new(Self {
            router: Arc::new(AsyncMutex::new(router)),
            next_host: AtomicU8::new(2),
        }))
    }

    /// Starts routing. Hosts may be attached before or after.
    pub async fn start(&self) -> Result<(), NegotiationError> {
        let mut router = self.router.lock().await;
        router.start().await.map_err(to_primitive_error)
    }

    pub async fn stop(&self) -> Result<(), NegotiationError> {
        let mut router = self.router.lock().await;
        router.stop().await.map_err(to_primitive_error)
    }

    pub async fn attach_host(&self) -> Result<Arc<Net>, NegotiationError> {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed);
        if host == u8::MAX {
            return Err(NegotiationError::Primitive(
                "virtual network has no free addresses".into(),
            ));
        }
        let net = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![format!("10.0.0.{host}")],
            ..Default::default()
        })));
        let nic = net.get_nic().map_err(to_primitive_error)?;
        {
            let mut router = self.router.lock().await;
            router
                .add_net(Arc::clone(&nic))
                .await
                .map_err(to_primitive_error)?;
        }
        {
            let nic = nic.lock().await;
            nic.set_router(Arc::clone(&self.router))
                .await
                .map_err(to_primitive_error)?;
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_is_never_a_remote_description() {
        let err = to_rtc_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .expect_err("rollback rejected");
        assert!(matches!(err, NegotiationError::InvalidSignal(_)));
    }

    #[test]
    fn connection_states_map_terminal_variants() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert!(map_connection_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(!map_connection_state(RTCPeerConnectionState::Connecting).is_terminal());
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn ice_servers_carry_credentials() {
        let server = to_rtc_ice_server(&IceServer::with_credentials(
            "turn:relay.example:3478",
            "user",
            "secret",
        ));
        assert_eq!(server.urls, vec!["turn:relay.example:3478".to_string()]);
        assert_eq!(server.username, "user");
        assert_eq!(server.credential, "secret");
    }
}
