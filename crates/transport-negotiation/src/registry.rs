//! Named session reuse.
//!
//! A [`SessionRegistry`] hands out one live [`PeerSession`] per label. An
//! entry that never started negotiating, or that has ended, is closed and
//! replaced on the next `ensure`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::SessionConfig;
use crate::error::NegotiationError;
use crate::primitive::mock::MockNetwork;
use crate::session::PeerSession;

/// Sessions a single process is expected to hold at once.
pub const DEFAULT_SESSION_LIMIT: usize = 200;

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, config: SessionConfig) -> Result<Arc<PeerSession>, NegotiationError>;
}

/// Sessions backed by real peer connections on the host network stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtcSessionFactory;

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn create(&self, config: SessionConfig) -> Result<Arc<PeerSession>, NegotiationError> {
        PeerSession::connect(config).await
    }
}

/// Sessions backed by the in-memory primitive.
#[derive(Clone)]
pub struct MockSessionFactory {
    network: Arc<MockNetwork>,
}

impl MockSessionFactory {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(&self, config: SessionConfig) -> Result<Arc<PeerSession>, NegotiationError> {
        let primitive = self.network.create(&config.label);
        Ok(PeerSession::new(config, primitive))
    }
}

pub struct SessionRegistry {
    factory: Arc<dyn SessionFactory>,
    sessions: AsyncMutex<HashMap<String, Arc<PeerSession>>>,
    limit: usize,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_limit(factory, DEFAULT_SESSION_LIMIT)
    }

    pub fn with_limit(factory: Arc<dyn SessionFactory>, limit: usize) -> Self {
        Self {
            factory,
            sessions: AsyncMutex::new(HashMap::new()),
            limit,
        }
    }

    /// Live session for `config.label`, created when there is none. Concurrent
    /// calls for one label see the same session.
    pub async fn ensure(&self, config: SessionConfig) -> Result<Arc<PeerSession>, NegotiationError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&config.label) {
            if !existing.is_closed() && !existing.never_attempted() {
                return Ok(Arc::clone(existing));
            }
            tracing::debug!(
                target: "webrtc",
                session = %config.label,
                state = ?existing.connection_state(),
                closed = existing.is_closed(),
                "replacing stale session"
            );
            if let Some(stale) = sessions.remove(&config.label) {
                stale.close().await;
            }
        }
        if sessions.len() >= self.limit {
            tracing::warn!(
                target: "webrtc",
                session = %config.label,
                limit = self.limit,
                "session registry full"
            );
            return Err(NegotiationError::Primitive("registry full".into()));
        }
        let label = config.label.clone();
        let session = self.factory.create(config).await?;
        sessions.insert(label, Arc::clone(&session));
        Ok(session)
    }

    pub async fn get(&self, label: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().await.get(label).cloned()
    }

    /// Forgets `label` without closing its session.
    pub async fn remove(&self, label: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().await.remove(label)
    }

    /// Forgets `session` if it is still the one registered under its label.
    pub async fn release(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.lock().await;
        let current = sessions
            .get(session.label())
            .is_some_and(|registered| Arc::ptr_eq(registered, session));
        if current {
            sessions.remove(session.label());
        }
        current
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn labels(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in drained {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelOptions;
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry(limit: usize) -> SessionRegistry {
        SessionRegistry::with_limit(
            Arc::new(MockSessionFactory::new(MockNetwork::new())),
            limit,
        )
    }

    #[tokio::test]
    async fn attempted_session_is_reused() {
        let registry = registry(4);
        let first = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("first");
        first
            .open_channel("data", ChannelOptions::default())
            .await
            .expect("channel");
        timeout(Duration::from_secs(1), first.signals_ready())
            .await
            .expect("offer");

        let second = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn untouched_session_is_replaced_and_closed() {
        let registry = registry(4);
        let first = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("first");
        assert!(first.never_attempted());

        let second = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn closed_session_is_replaced() {
        let registry = registry(4);
        let first = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("first");
        first.close().await;

        let second = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("second");
        assert!(!second.is_closed());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn limit_rejects_new_labels() {
        let registry = registry(1);
        registry
            .ensure(SessionConfig::new("one"))
            .await
            .expect("one");
        let err = registry
            .ensure(SessionConfig::new("two"))
            .await
            .expect_err("full");
        assert!(matches!(err, NegotiationError::Primitive(message) if message == "registry full"));

        registry.close_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn release_ignores_replaced_sessions() {
        let registry = registry(4);
        let first = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("first");
        let second = registry
            .ensure(SessionConfig::new("peer"))
            .await
            .expect("second");

        assert!(!registry.release(&first).await);
        assert_eq!(registry.len().await, 1);
        assert!(registry.release(&second).await);
        assert!(registry.get("peer").await.is_none());
    }
}
