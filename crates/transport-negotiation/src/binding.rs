//! Ways of carrying signal batches between two sessions.
//!
//! A [`SignalTransfer`] takes the batch one side has accumulated and returns
//! whatever the far side had for it. The same trait serves the push binding
//! ([`PeerSession::use_transfer`]) and the long-poll loop
//! ([`PeerSession::connect_via`]). [`DirectLink`] hands signals straight to an
//! in-process peer.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{NegotiationError, to_transfer_error};
use crate::session::PeerSession;
use crate::signal::{Signal, SignalBatch};

#[async_trait]
pub trait SignalTransfer: Send + Sync {
    /// Delivers `batch` to the far side and returns its reply, which may be
    /// empty.
    async fn transfer(&self, batch: SignalBatch) -> Result<SignalBatch, NegotiationError>;
}

/// A session answering for a remote caller is itself a transfer target.
#[async_trait]
impl SignalTransfer for PeerSession {
    async fn transfer(&self, batch: SignalBatch) -> Result<SignalBatch, NegotiationError> {
        self.respond(batch).await
    }
}

pub type TransferFuture =
    Pin<Box<dyn Future<Output = Result<SignalBatch, NegotiationError>> + Send + 'static>>;

/// Adapts a closure into a [`SignalTransfer`].
pub struct FnTransfer<F> {
    transfer: F,
}

impl<F> FnTransfer<F>
where
    F: Fn(SignalBatch) -> TransferFuture + Send + Sync + 'static,
{
    pub fn new(transfer: F) -> Arc<Self> {
        Arc::new(Self { transfer })
    }
}

#[async_trait]
impl<F> SignalTransfer for FnTransfer<F>
where
    F: Fn(SignalBatch) -> TransferFuture + Send + Sync + 'static,
{
    async fn transfer(&self, batch: SignalBatch) -> Result<SignalBatch, NegotiationError> {
        (self.transfer)(batch).await
    }
}

/// POSTs the batch as a JSON array and decodes the JSON array in the
/// response.
#[derive(Clone, Debug)]
pub struct HttpTransfer {
    client: reqwest::Client,
    url: Url,
    timeout: Option<Duration>,
}

impl HttpTransfer {
    pub fn new(url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: Url) -> Self {
        Self {
            client,
            url,
            timeout: None,
        }
    }

    /// Fails a round trip with [`NegotiationError::Timeout`] when the far
    /// side holds the request longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl SignalTransfer for HttpTransfer {
    async fn transfer(&self, batch: SignalBatch) -> Result<SignalBatch, NegotiationError> {
        let mut request = self.client.post(self.url.clone()).json(&batch);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(NegotiationError::Transfer(format!(
                "{} responded with {status}",
                self.url
            )));
        }
        response
            .json::<SignalBatch>()
            .await
            .map_err(http_error)
    }
}

fn http_error(err: reqwest::Error) -> NegotiationError {
    if err.is_timeout() {
        NegotiationError::Timeout
    } else {
        to_transfer_error(err)
    }
}

/// Wires two in-process sessions so each signal one emits is applied by the
/// other, in emission order. Dropping the link stops delivery.
pub struct DirectLink {
    pumps: Vec<JoinHandle<()>>,
}

impl DirectLink {
    pub fn connect(a: &Arc<PeerSession>, b: &Arc<PeerSession>) -> Self {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        let pumps = vec![
            tokio::spawn(pump(from_a, Arc::downgrade(b))),
            tokio::spawn(pump(from_b, Arc::downgrade(a))),
        ];
        a.route_direct(to_b);
        b.route_direct(to_a);
        Self { pumps }
    }
}

impl Drop for DirectLink {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn pump(mut signals: mpsc::UnboundedReceiver<Signal>, peer: Weak<PeerSession>) {
    while let Some(signal) = signals.recv().await {
        let Some(peer) = peer.upgrade() else {
            break;
        };
        if let Err(err) = peer.apply_signals(vec![signal]).await {
            tracing::warn!(target: "webrtc", session = %peer.label(), error = %err, "direct signal rejected");
        }
    }
}
