use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use transport_negotiation::{
    NegotiationError, PeerSession, Restriction, SessionFactory, SessionRegistry, SignalBatch,
};

use crate::config::Config;

pub const ECHO_CHANNEL: &str = "echo";
pub const PORTAL_CHANNEL: &str = "data";
pub const PORTAL_GREETING: &str = "Welcome!";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

struct AppInner {
    config: Config,
    factory: Arc<dyn SessionFactory>,
    echo: SessionRegistry,
    portal: Vec<AsyncMutex<Option<Arc<PeerSession>>>>,
}

impl AppState {
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>) -> Self {
        let portal = (0..config.portal_slots)
            .map(|_| AsyncMutex::new(None))
            .collect();
        Self {
            inner: Arc::new(AppInner {
                echo: SessionRegistry::new(Arc::clone(&factory)),
                factory,
                portal,
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn echo_sessions(&self) -> &SessionRegistry {
        &self.inner.echo
    }

    /// Session for `tag`, created and wired to echo on first contact.
    async fn echo_session(&self, tag: &str) -> Result<Arc<PeerSession>, NegotiationError> {
        if let Some(session) = self.inner.echo.get(tag).await {
            if !session.is_closed() {
                return Ok(session);
            }
        }
        let config = self.inner.config.session.derive(tag, true);
        let session = self.inner.echo.ensure(config).await?;
        tokio::spawn(serve_echo(self.clone(), Arc::clone(&session)));
        Ok(session)
    }

    /// Bot for `slot`, replaced when the previous one has closed.
    async fn portal_bot(&self, slot: usize) -> Result<Arc<PeerSession>, AppError> {
        let cell = self.inner.portal.get(slot).ok_or(AppError::NoSlot(slot))?;
        let mut cell = cell.lock().await;
        if let Some(bot) = cell.as_ref().filter(|bot| !bot.is_closed()) {
            return Ok(Arc::clone(bot));
        }
        let config = self
            .inner
            .config
            .session
            .derive(format!("portal-{slot}"), true);
        let bot = self.inner.factory.create(config).await?;
        debug!(slot, "launched portal bot");
        tokio::spawn(greet(Arc::clone(&bot)));
        *cell = Some(Arc::clone(&bot));
        Ok(bot)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no portal slot {0}")]
    NoSlot(usize),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NoSlot(_) => StatusCode::NOT_FOUND,
            AppError::Negotiation(NegotiationError::InvalidSignal(_)) => StatusCode::BAD_REQUEST,
            AppError::Negotiation(NegotiationError::Closed) => StatusCode::GONE,
            AppError::Negotiation(NegotiationError::Primitive(message))
                if message == "registry full" =>
            {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Negotiation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Long-poll endpoint: applies the posted batch to the tag's session and
/// answers with that session's next batch.
pub async fn echo(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Json(batch): Json<SignalBatch>,
) -> Result<Json<SignalBatch>, AppError> {
    debug!(tag = %tag, count = batch.len(), "echo signals");
    let session = state.echo_session(&tag).await?;
    let reply = session.respond(batch).await?;
    Ok(Json(reply))
}

pub async fn join(
    State(state): State<AppState>,
    Path(slot): Path<usize>,
    Json(batch): Json<SignalBatch>,
) -> Result<Json<SignalBatch>, AppError> {
    let bot = state.portal_bot(slot).await?;
    let reply = bot.respond(batch).await?;
    Ok(Json(reply))
}

/// Echoes every message on the session's `echo` channel. The session is
/// closed when that channel does not open within the TTL, or once it closes.
async fn serve_echo(state: AppState, session: Arc<PeerSession>) {
    let ttl = state.config().session_ttl;
    match timeout(ttl, session.await_channel(ECHO_CHANNEL, Restriction::Any)).await {
        Ok(Ok(channel)) => {
            session.report_connection(true).await;
            while let Some(payload) = channel.recv().await {
                if let Err(err) = channel.send(payload).await {
                    warn!(session = %session.label(), error = %err, "echo send failed");
                    break;
                }
            }
            debug!(session = %session.label(), "echo channel closed");
        }
        Ok(Err(err)) => {
            debug!(session = %session.label(), error = %err, "session ended before echo channel opened");
        }
        Err(_) => {
            info!(session = %session.label(), ttl_secs = ttl.as_secs(), "echo channel not opened in time");
        }
    }
    session.close().await;
    state.echo_sessions().release(&session).await;
}

async fn greet(bot: Arc<PeerSession>) {
    match bot.await_channel(PORTAL_CHANNEL, Restriction::Any).await {
        Ok(channel) => {
            bot.report_connection(true).await;
            if let Err(err) = channel.send_text(PORTAL_GREETING).await {
                warn!(session = %bot.label(), error = %err, "greeting failed");
            }
        }
        Err(err) => {
            debug!(session = %bot.label(), error = %err, "bot closed before a visitor arrived");
        }
    }
}
