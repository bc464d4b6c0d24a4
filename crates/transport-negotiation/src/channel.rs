//! Data channel lifecycle.
//!
//! Channels reach a session two ways: created here ([`ChannelOrigin::Ours`])
//! or announced by the far side ([`ChannelOrigin::Theirs`]). Both go through
//! the same setup. Callers wait on a channel by name, optionally restricted
//! to one origin, and each (name, restriction) slot resolves at most once:
//! the first channel of that name to open wins, later ones stay reachable by
//! name but never replace it. A slot whose winner closes passes to another
//! open channel of that name, or waits for the next one to open.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};

use crate::config::ChannelOptions;
use crate::error::NegotiationError;
use crate::negotiation::chatter;
use crate::primitive::{ChannelEvent, ChannelPrimitive, ChannelState, ConnectionPrimitive, Payload};

/// Ids handed out locally start here so they never meet the far side's
/// default assignments, which count up from zero.
pub const FIRST_LOCAL_CHANNEL_ID: u16 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelOrigin {
    Ours,
    Theirs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Restriction {
    #[default]
    Any,
    Ours,
    Theirs,
}

impl From<ChannelOrigin> for Restriction {
    fn from(origin: ChannelOrigin) -> Self {
        match origin {
            ChannelOrigin::Ours => Restriction::Ours,
            ChannelOrigin::Theirs => Restriction::Theirs,
        }
    }
}

/// Application handle for one data channel.
pub struct DataChannel {
    label: String,
    origin: ChannelOrigin,
    inner: Arc<dyn ChannelPrimitive>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Payload>>,
    closed: watch::Receiver<bool>,
}

impl DataChannel {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn origin(&self) -> ChannelOrigin {
        self.origin
    }

    pub fn id(&self) -> Option<u16> {
        self.inner.id()
    }

    pub fn negotiated(&self) -> bool {
        self.inner.negotiated()
    }

    pub fn ready_state(&self) -> ChannelState {
        self.inner.ready_state()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ChannelState::Open
    }

    pub async fn send(&self, payload: Payload) -> Result<usize, NegotiationError> {
        self.inner.send(payload).await
    }

    pub async fn send_text(&self, text: &str) -> Result<usize, NegotiationError> {
        self.send(Payload::text(text)).await
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<usize, NegotiationError> {
        self.send(Payload::Binary(bytes::Bytes::copy_from_slice(bytes)))
            .await
    }

    /// Next inbound message, or `None` once the channel has closed and
    /// everything it delivered was read.
    pub async fn recv(&self) -> Option<Payload> {
        self.inbound.lock().await.recv().await
    }

    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn close(&self) -> Result<(), NegotiationError> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .field("origin", &self.origin)
            .field("id", &self.id())
            .field("state", &self.ready_state())
            .finish()
    }
}

#[derive(Default)]
struct OpenSlot {
    resolved: Option<Arc<DataChannel>>,
    waiters: Vec<oneshot::Sender<Arc<DataChannel>>>,
}

#[derive(Default)]
struct ChannelTable {
    channels: HashMap<String, Vec<Arc<DataChannel>>>,
    slots: HashMap<(String, Restriction), OpenSlot>,
    shut: bool,
}

impl ChannelTable {
    fn resolve(&mut self, channel: &Arc<DataChannel>, restriction: Restriction) -> bool {
        let slot = self
            .slots
            .entry((channel.label.clone(), restriction))
            .or_default();
        if slot.resolved.is_some() {
            return false;
        }
        slot.resolved = Some(Arc::clone(channel));
        for waiter in slot.waiters.drain(..) {
            let _ = waiter.send(Arc::clone(channel));
        }
        true
    }

    /// Hands every slot `closed` won to the next open channel of that name
    /// the slot accepts, or re-arms it.
    fn release(&mut self, closed: &Arc<DataChannel>) -> usize {
        let successors: Vec<Arc<DataChannel>> = self
            .channels
            .get(&closed.label)
            .map(|channels| {
                channels
                    .iter()
                    .filter(|channel| !Arc::ptr_eq(channel, closed))
                    .filter(|channel| channel.is_open() && !channel.is_closed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let mut released = 0;
        for restriction in [Restriction::Any, Restriction::Ours, Restriction::Theirs] {
            let key = (closed.label.clone(), restriction);
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            if !slot
                .resolved
                .as_ref()
                .is_some_and(|winner| Arc::ptr_eq(winner, closed))
            {
                continue;
            }
            slot.resolved = None;
            released += 1;
            let successor = successors
                .iter()
                .find(|channel| restriction.accepts(channel.origin))
                .cloned();
            if let Some(successor) = successor {
                self.resolve(&successor, restriction);
            }
        }
        released
    }
}

impl Restriction {
    fn accepts(self, origin: ChannelOrigin) -> bool {
        match self {
            Restriction::Any => true,
            Restriction::Ours => origin == ChannelOrigin::Ours,
            Restriction::Theirs => origin == ChannelOrigin::Theirs,
        }
    }
}

pub struct ChannelCoordinator {
    label: String,
    debug: bool,
    primitive: Arc<dyn ConnectionPrimitive>,
    next_id: AtomicU16,
    table: Arc<Mutex<ChannelTable>>,
}

impl ChannelCoordinator {
    pub fn new(
        label: impl Into<String>,
        debug: bool,
        primitive: Arc<dyn ConnectionPrimitive>,
    ) -> Self {
        Self {
            label: label.into(),
            debug,
            primitive,
            next_id: AtomicU16::new(FIRST_LOCAL_CHANNEL_ID),
            table: Arc::new(Mutex::new(ChannelTable::default())),
        }
    }

    /// Creates a channel and returns its handle right away. The name's
    /// slots resolve once the primitive reports it open.
    pub async fn open(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<Arc<DataChannel>, NegotiationError> {
        if self.table.lock().shut {
            return Err(NegotiationError::Closed);
        }
        let mut options = options;
        if options.pre_negotiated && options.id.is_none() {
            options.id = Some(self.next_id.fetch_add(1, Ordering::Relaxed));
        }
        let inner = self.primitive.create_channel(name, &options).await?;
        chatter!(
            self.debug,
            target: "webrtc",
            session = %self.label,
            channel = name,
            id = ?options.id,
            pre_negotiated = options.pre_negotiated,
            "created channel"
        );
        Ok(self.setup(inner, ChannelOrigin::Ours))
    }

    /// Takes in a channel announced by the far side.
    pub fn adopt(&self, inner: Arc<dyn ChannelPrimitive>) -> Arc<DataChannel> {
        chatter!(
            self.debug,
            target: "webrtc",
            session = %self.label,
            channel = %inner.label(),
            id = ?inner.id(),
            state = ?inner.ready_state(),
            "remote channel announced"
        );
        let already_open = inner.ready_state() == ChannelState::Open;
        let channel = self.setup(inner, ChannelOrigin::Theirs);
        if already_open {
            mark_open(&self.table, &channel, &self.label, self.debug);
        }
        channel
    }

    fn setup(&self, inner: Arc<dyn ChannelPrimitive>, origin: ChannelOrigin) -> Arc<DataChannel> {
        let label = inner.label();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let events = inner.take_events();
        let channel = Arc::new(DataChannel {
            label: label.clone(),
            origin,
            inner,
            inbound: AsyncMutex::new(inbound_rx),
            closed: closed_rx,
        });

        {
            let mut table = self.table.lock();
            table
                .channels
                .entry(label)
                .or_default()
                .push(Arc::clone(&channel));
        }

        match events {
            Some(events) => {
                tokio::spawn(pump_channel_events(
                    events,
                    Arc::downgrade(&channel),
                    Arc::clone(&self.table),
                    inbound_tx,
                    closed_tx,
                    self.label.clone(),
                    self.debug,
                ));
            }
            None => {
                tracing::warn!(
                    target: "webrtc",
                    session = %self.label,
                    channel = %channel.label,
                    "channel events already taken"
                );
            }
        }
        channel
    }

    /// Waits for a channel of this name to open, whichever side created it
    /// unless `restriction` says otherwise. Returns the winner immediately if
    /// one already opened.
    pub async fn await_open(
        &self,
        name: &str,
        restriction: Restriction,
    ) -> Result<Arc<DataChannel>, NegotiationError> {
        let waiter = {
            let mut table = self.table.lock();
            let shut = table.shut;
            let slot = table
                .slots
                .entry((name.to_string(), restriction))
                .or_default();
            if let Some(channel) = &slot.resolved {
                return Ok(Arc::clone(channel));
            }
            if shut {
                return Err(NegotiationError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };
        waiter.await.map_err(|_| NegotiationError::Closed)
    }

    /// The channel that won `name`, or the first one created under it.
    pub fn channel(&self, name: &str) -> Option<Arc<DataChannel>> {
        let table = self.table.lock();
        table
            .slots
            .get(&(name.to_string(), Restriction::Any))
            .and_then(|slot| slot.resolved.clone())
            .or_else(|| {
                table
                    .channels
                    .get(name)
                    .and_then(|channels| channels.first().cloned())
            })
    }

    /// Every channel seen under `name`, in arrival order.
    pub fn channels(&self, name: &str) -> Vec<Arc<DataChannel>> {
        self.table
            .lock()
            .channels
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Fails every pending wait with `Closed`. Resolved slots keep their
    /// channel.
    pub fn shutdown(&self) {
        let mut table = self.table.lock();
        table.shut = true;
        for slot in table.slots.values_mut() {
            slot.waiters.clear();
        }
    }
}

fn mark_open(
    table: &Mutex<ChannelTable>,
    channel: &Arc<DataChannel>,
    session: &str,
    debug: bool,
) {
    let (any, restricted) = {
        let mut table = table.lock();
        let any = table.resolve(channel, Restriction::Any);
        let restricted = table.resolve(channel, channel.origin.into());
        (any, restricted)
    };
    chatter!(
        debug,
        target: "webrtc",
        session = %session,
        channel = %channel.label,
        id = ?channel.id(),
        origin = ?channel.origin,
        resolved_any = any,
        resolved_origin = restricted,
        "channel open"
    );
}

async fn pump_channel_events(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    channel: std::sync::Weak<DataChannel>,
    table: Arc<Mutex<ChannelTable>>,
    inbound: mpsc::UnboundedSender<Payload>,
    closed: watch::Sender<bool>,
    session: String,
    debug: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => {
                if let Some(channel) = channel.upgrade() {
                    mark_open(&table, &channel, &session, debug);
                }
            }
            ChannelEvent::Message(payload) => {
                if inbound.send(payload).is_err() {
                    break;
                }
            }
            ChannelEvent::Error(err) => {
                tracing::warn!(target: "webrtc", session = %session, error = %err, "data channel error");
            }
            ChannelEvent::Closed => break,
        }
    }
    let released = channel
        .upgrade()
        .map(|channel| table.lock().release(&channel))
        .unwrap_or_default();
    chatter!(debug, target: "webrtc", session = %session, released, "data channel closed");
    let _ = closed.send(true);
}
