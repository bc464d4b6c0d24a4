//! Typed facade over the platform peer connection.
//!
//! The negotiation core never talks to a peer connection directly. It drives
//! one through [`ConnectionPrimitive`] and consumes its notifications as a
//! [`PrimitiveEvent`] stream, so the same state machine runs over the
//! `webrtc` crate in production and over [`mock::MockNetwork`] in unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ChannelOptions;
use crate::diagnostics::StatsSnapshot;
use crate::error::NegotiationError;
use crate::signal::{IceCandidate, SessionDescription};

pub mod mock;
pub mod rtc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `new` and `connecting` never end a session; everything past
    /// `connected` does.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Argument to `set_local_description`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalDescription {
    Description(SessionDescription),
    Rollback,
}

/// Notifications from a peer connection, delivered in the order the
/// primitive raised them.
pub enum PrimitiveEvent {
    IceCandidate(IceCandidate),
    /// A channel announced in-band by the far side.
    DataChannel(Arc<dyn ChannelPrimitive>),
    NegotiationNeeded,
    ConnectionState(ConnectionState),
    GatheringState(GatheringState),
}

impl std::fmt::Debug for PrimitiveEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(&candidate.candidate).finish()
            }
            PrimitiveEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PrimitiveEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PrimitiveEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            PrimitiveEvent::GatheringState(state) => {
                f.debug_tuple("GatheringState").field(state).finish()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    Closed,
    Error(String),
}

#[async_trait]
pub trait ConnectionPrimitive: Send + Sync {
    /// Event stream for this connection. Handed out once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PrimitiveEvent>>;
    /// Stop delivering events. The stream ends after anything already queued.
    fn detach(&self);

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: LocalDescription)
    -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn create_channel(
        &self,
        label: &str,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn ChannelPrimitive>, NegotiationError>;

    async fn local_description(&self) -> Option<SessionDescription>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn gathering_state(&self) -> GatheringState;
    async fn stats(&self) -> StatsSnapshot;
    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait ChannelPrimitive: Send + Sync {
    fn label(&self) -> String;
    /// `None` until the transport has assigned one.
    fn id(&self) -> Option<u16>;
    fn negotiated(&self) -> bool;
    fn ready_state(&self) -> ChannelState;
    /// Event stream for this channel. Handed out once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
    async fn send(&self, payload: Payload) -> Result<usize, NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Buffered single-consumer event queue shared between primitive callbacks
/// and whoever takes the receiving end.
pub(crate) struct EventSink<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> EventSink<T> {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        })
    }

    pub(crate) fn emit(&self, event: T) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<T>> {
        self.rx.lock().take()
    }

    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}
