//! Perfect negotiation over a [`ConnectionPrimitive`].
//!
//! Two peers may decide to renegotiate at the same time. The polite peer
//! yields to a colliding remote offer by rolling back its own; the impolite
//! peer drops the remote offer and waits for an answer to its own. Primitive
//! failures during a round are logged and the round is abandoned; only a
//! candidate failure that cannot be explained by a dropped offer or a closed
//! connection reaches the caller.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::NegotiationError;
use crate::primitive::{ConnectionPrimitive, ConnectionState, LocalDescription, SignalingState};
use crate::signal::{IceCandidate, SessionDescription, Signal};

/// Logs at debug when the session asked for it and at trace otherwise.
macro_rules! chatter {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}
pub(crate) use chatter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
    /// A local offer is being produced and has not been applied yet.
    pub making_offer: bool,
    /// The last inbound offer was dropped because of a collision.
    pub ignore_offer: bool,
    /// A remote description is being applied.
    pub setting_remote: bool,
    /// This side discarded its own offer in favor of a remote one.
    pub rolled_back: bool,
    /// Any description has been produced or received.
    pub attempted: bool,
}

/// Clears a flag when dropped, so cancellation cannot leave it latched.
struct FlagGuard<'a> {
    flags: &'a Mutex<NegotiationFlags>,
    clear: fn(&mut NegotiationFlags),
}

impl<'a> FlagGuard<'a> {
    fn raise(
        flags: &'a Mutex<NegotiationFlags>,
        set: fn(&mut NegotiationFlags),
        clear: fn(&mut NegotiationFlags),
    ) -> Self {
        set(&mut flags.lock());
        Self { flags, clear }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        (self.clear)(&mut self.flags.lock());
    }
}

pub struct Negotiator {
    label: String,
    polite: bool,
    explicit_rollback: bool,
    debug: bool,
    primitive: Arc<dyn ConnectionPrimitive>,
    flags: Mutex<NegotiationFlags>,
}

impl Negotiator {
    pub fn new(
        label: impl Into<String>,
        polite: bool,
        explicit_rollback: bool,
        debug: bool,
        primitive: Arc<dyn ConnectionPrimitive>,
    ) -> Self {
        Self {
            label: label.into(),
            polite,
            explicit_rollback,
            debug,
            primitive,
            flags: Mutex::new(NegotiationFlags::default()),
        }
    }

    pub fn polite(&self) -> bool {
        self.polite
    }

    pub fn flags(&self) -> NegotiationFlags {
        *self.flags.lock()
    }

    /// Produces and applies a local offer. Returns the description to send,
    /// or `None` when the round was superseded or rejected.
    pub async fn on_negotiation_needed(&self) -> Option<Signal> {
        let _making = FlagGuard::raise(
            &self.flags,
            |flags| {
                flags.making_offer = true;
                flags.attempted = true;
            },
            |flags| flags.making_offer = false,
        );
        chatter!(
            self.debug,
            target: "webrtc",
            session = %self.label,
            state = ?self.primitive.signaling_state(),
            "creating offer"
        );
        let offer = match self.primitive.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                tracing::warn!(target: "webrtc", session = %self.label, error = %err, "failed to create offer");
                return None;
            }
        };
        let state = self.primitive.signaling_state();
        if state != SignalingState::Stable {
            chatter!(
                self.debug,
                target: "webrtc",
                session = %self.label,
                state = ?state,
                "dropping stale offer"
            );
            return None;
        }
        if let Err(err) = self
            .primitive
            .set_local_description(LocalDescription::Description(offer))
            .await
        {
            tracing::warn!(
                target: "webrtc",
                session = %self.label,
                state = ?self.primitive.signaling_state(),
                error = %err,
                "ignoring error applying local offer"
            );
            return None;
        }
        self.primitive
            .local_description()
            .await
            .map(Signal::Description)
    }

    /// Applies one inbound signal. Returns an answer to send when the signal
    /// was an accepted offer.
    pub async fn on_signal(&self, signal: Signal) -> Result<Option<Signal>, NegotiationError> {
        match signal {
            Signal::Description(desc) => Ok(self.on_description(desc).await),
            Signal::Candidate(candidate) => {
                self.on_candidate(candidate).await?;
                Ok(None)
            }
        }
    }

    async fn on_description(&self, desc: SessionDescription) -> Option<Signal> {
        let is_offer = desc.is_offer();
        let state = self.primitive.signaling_state();
        let (collision, ignore, making, setting) = {
            let mut flags = self.flags.lock();
            flags.attempted = true;
            let collision = is_offer
                && (flags.making_offer
                    || (state != SignalingState::Stable && !flags.setting_remote));
            flags.ignore_offer = !self.polite && collision;
            (
                collision,
                flags.ignore_offer,
                flags.making_offer,
                flags.setting_remote,
            )
        };
        chatter!(
            self.debug,
            target: "webrtc",
            session = %self.label,
            kind = ?desc.kind,
            state = ?state,
            making_offer = making,
            setting_remote = setting,
            collision,
            ignore,
            "inbound description"
        );

        if ignore {
            chatter!(self.debug, target: "webrtc", session = %self.label, "ignoring colliding offer");
            return None;
        }

        if self.explicit_rollback && collision {
            if let Err(err) = self
                .primitive
                .set_local_description(LocalDescription::Rollback)
                .await
            {
                chatter!(self.debug, target: "webrtc", session = %self.label, error = %err, "ignoring error in rollback");
            }
            if let Err(err) = self.primitive.set_remote_description(desc).await {
                chatter!(
                    self.debug,
                    target: "webrtc",
                    session = %self.label,
                    error = %err,
                    "ignoring error applying remote offer after rollback"
                );
            }
            self.flags.lock().rolled_back = true;
            chatter!(self.debug, target: "webrtc", session = %self.label, "rolled back, producing answer");
        } else {
            let _setting = FlagGuard::raise(
                &self.flags,
                |flags| flags.setting_remote = true,
                |flags| flags.setting_remote = false,
            );
            if let Err(err) = self.primitive.set_remote_description(desc).await {
                if collision {
                    chatter!(self.debug, target: "webrtc", session = %self.label, error = %err, "ignoring error applying colliding remote description");
                } else {
                    tracing::warn!(
                        target: "webrtc",
                        session = %self.label,
                        state = ?self.primitive.signaling_state(),
                        error = %err,
                        "ignoring error applying remote description"
                    );
                }
            }
            if collision {
                self.flags.lock().rolled_back = true;
            }
        }

        if !is_offer {
            return None;
        }
        let answer = match self.primitive.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(target: "webrtc", session = %self.label, error = %err, "failed to create answer");
                return None;
            }
        };
        if let Err(err) = self
            .primitive
            .set_local_description(LocalDescription::Description(answer))
            .await
        {
            tracing::warn!(target: "webrtc", session = %self.label, error = %err, "ignoring error applying local answer");
            return None;
        }
        self.primitive
            .local_description()
            .await
            .map(Signal::Description)
    }

    async fn on_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let connection = self.primitive.connection_state();
        if connection == ConnectionState::Closed || !self.primitive.has_remote_description().await
        {
            chatter!(
                self.debug,
                target: "webrtc",
                session = %self.label,
                connection = ?connection,
                signaling = ?self.primitive.signaling_state(),
                gathering = ?self.primitive.gathering_state(),
                "dropping candidate without remote description"
            );
            return Ok(());
        }
        match self.primitive.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let ignoring = self.flags.lock().ignore_offer;
                if ignoring || self.primitive.connection_state() == ConnectionState::Closed {
                    chatter!(self.debug, target: "webrtc", session = %self.label, error = %err, "ignoring candidate failure");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::mock::{MockNetwork, MockPrimitive};

    fn negotiator(primitive: &Arc<MockPrimitive>, polite: bool) -> Negotiator {
        Negotiator::new(primitive.label(), polite, true, true, primitive.clone())
    }

    fn candidate(text: &str) -> Signal {
        Signal::Candidate(IceCandidate {
            candidate: text.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
    }

    async fn remote_offer(network: &Arc<MockNetwork>) -> Signal {
        let other = network.create("other");
        Signal::Description(other.create_offer().await.expect("offer"))
    }

    #[tokio::test]
    async fn impolite_side_drops_colliding_offer() {
        let network = MockNetwork::new();
        let local = network.create("impolite");
        let machine = negotiator(&local, false);

        let offer = machine.on_negotiation_needed().await.expect("local offer");
        assert!(matches!(offer, Signal::Description(ref d) if d.is_offer()));
        assert_eq!(local.signaling_state(), SignalingState::HaveLocalOffer);

        let reply = machine
            .on_signal(remote_offer(&network).await)
            .await
            .expect("collision is not an error");
        assert!(reply.is_none());
        let flags = machine.flags();
        assert!(flags.ignore_offer);
        assert!(!flags.rolled_back);
        assert_eq!(local.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!local.operations().iter().any(|op| op == "set_remote:offer"));
    }

    #[tokio::test]
    async fn polite_side_rolls_back_and_answers() {
        let network = MockNetwork::new();
        let local = network.create("polite");
        let machine = negotiator(&local, true);

        machine.on_negotiation_needed().await.expect("local offer");
        let reply = machine
            .on_signal(remote_offer(&network).await)
            .await
            .expect("apply offer");
        match reply {
            Some(Signal::Description(answer)) => assert_eq!(answer.kind, crate::signal::SdpKind::Answer),
            other => panic!("expected answer, got {other:?}"),
        }
        let flags = machine.flags();
        assert!(flags.rolled_back);
        assert!(!flags.ignore_offer);
        assert!(!flags.setting_remote);
        assert_eq!(local.signaling_state(), SignalingState::Stable);
        let ops = local.operations();
        let rollback = ops.iter().position(|op| op == "rollback").expect("rollback");
        let remote = ops.iter().position(|op| op == "set_remote:offer").expect("remote");
        assert!(rollback < remote);
    }

    #[tokio::test]
    async fn stale_offer_is_not_applied() {
        let network = MockNetwork::new();
        let local = network.create("stale");
        let machine = negotiator(&local, false);
        if let Signal::Description(offer) = remote_offer(&network).await {
            local.set_remote_description(offer).await.expect("remote offer");
        }

        assert!(machine.on_negotiation_needed().await.is_none());
        assert!(!machine.flags().making_offer);
        assert_eq!(local.signaling_state(), SignalingState::HaveRemoteOffer);
        assert!(!local.operations().iter().any(|op| op == "set_local:offer"));
    }

    #[tokio::test]
    async fn candidate_without_remote_description_is_dropped() {
        let network = MockNetwork::new();
        let local = network.create("early");
        let machine = negotiator(&local, true);

        let reply = machine.on_signal(candidate("candidate:early")).await;
        assert!(matches!(reply, Ok(None)));
        assert!(local.operations().is_empty());
        assert_eq!(machine.flags(), NegotiationFlags::default());
    }

    #[tokio::test]
    async fn candidate_after_close_is_dropped() {
        let network = MockNetwork::new();
        let local = network.create("closed");
        let machine = negotiator(&local, true);
        machine
            .on_signal(remote_offer(&network).await)
            .await
            .expect("offer");
        local.close().await.expect("close");

        assert!(machine.on_signal(candidate("candidate:late")).await.is_ok());
        assert!(!local
            .operations()
            .iter()
            .any(|op| op.starts_with("add_candidate")));
    }

    #[tokio::test]
    async fn unexpected_candidate_failure_is_raised() {
        let network = MockNetwork::new();
        let local = network.create("strict");
        let machine = negotiator(&local, true);
        machine
            .on_signal(remote_offer(&network).await)
            .await
            .expect("offer");

        machine
            .on_signal(candidate("candidate:good"))
            .await
            .expect("good candidate");
        let err = machine
            .on_signal(candidate("candidate:invalid"))
            .await
            .expect_err("bad candidate surfaces");
        assert!(matches!(err, NegotiationError::Primitive(_)));
    }

    #[tokio::test]
    async fn candidate_failure_after_ignored_offer_is_swallowed() {
        let network = MockNetwork::new();
        let local = network.create("impolite");
        let machine = negotiator(&local, false);
        let other = network.create("answerer");

        // Establish a remote description, then collide.
        let offer = machine.on_negotiation_needed().await.expect("offer");
        if let Signal::Description(offer) = offer {
            other.set_remote_description(offer).await.expect("remote");
            let answer = other.create_answer().await.expect("answer");
            machine
                .on_signal(Signal::Description(answer))
                .await
                .expect("answer applied");
        }
        machine.on_negotiation_needed().await.expect("second offer");
        machine
            .on_signal(remote_offer(&network).await)
            .await
            .expect("collision");
        assert!(machine.flags().ignore_offer);

        assert!(machine.on_signal(candidate("candidate:invalid")).await.is_ok());
    }
}
