//! Perfect negotiation for WebRTC peer connections.
//!
//! [`PeerSession`] pairs the negotiation state machine with a data channel
//! coordinator and carries signals through whichever binding the caller
//! picks: a direct in-process link, request/response (`respond`), push
//! through a [`SignalTransfer`], or long-polling with `connect_via`.

pub mod binding;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod negotiation;
pub mod primitive;
pub mod registry;
pub mod session;
pub mod signal;

pub use binding::{DirectLink, FnTransfer, HttpTransfer, SignalTransfer, TransferFuture};
pub use channel::{ChannelOrigin, DataChannel, FIRST_LOCAL_CHANNEL_ID, Restriction};
pub use config::{ChannelOptions, IceServer, IceTimeouts, SessionConfig, SessionConfigBuilder};
pub use diagnostics::{ConnectionReport, StatsSnapshot, extract_report};
pub use error::NegotiationError;
pub use negotiation::NegotiationFlags;
pub use primitive::{ChannelState, ConnectionState, GatheringState, Payload, SignalingState};
pub use registry::{
    DEFAULT_SESSION_LIMIT, MockSessionFactory, RtcSessionFactory, SessionFactory, SessionRegistry,
};
pub use session::PeerSession;
pub use signal::{IceCandidate, SdpKind, SessionDescription, Signal, SignalBatch};
