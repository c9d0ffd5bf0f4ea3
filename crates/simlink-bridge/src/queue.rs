//! Bounded queues between the transport runtime and the simulation thread
//!
//! Commands and outbound envelopes travel through lock-free `ArrayQueue`s
//! sized at initialisation. The transport pushes inbound commands from its
//! own threads and the simulation drains them once per tick; the simulation
//! pushes outbound items and the transport dispatcher pops them. Neither
//! side ever blocks the other.
//!
//! Overflow policy differs by direction:
//! - inbound rejects the newest command so that already-accepted commands
//!   keep their order and the sender can be told to retry
//! - outbound evicts the oldest item so that the freshest snapshot survives
//!
//! Session lifecycle travels on [`SessionEvents`] and close directives on
//! [`CloseSignals`]. Neither shares capacity with commands or snapshots.

use crate::session::PeerId;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use simlink_core::{Command, Envelope, ErrorPayload, OverflowError};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{Notify, watch};

/// Connection lifecycle observed by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection accepted or established
    Connected,
    /// Handshake completed at the given schema version
    Negotiated { version: u32 },
    /// Heartbeat received after the handshake
    Heartbeat,
    /// Peer closed the connection cleanly
    Disconnected,
    /// Connection failed with an I/O error
    Lost,
}

impl SessionEvent {
    /// Whether the connection is gone after this event
    pub fn ends_connection(self) -> bool {
        matches!(self, SessionEvent::Disconnected | SessionEvent::Lost)
    }
}

/// Command tagged with the connection it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct InboundItem {
    pub peer: PeerId,
    pub command: Command,
}

impl InboundItem {
    pub fn new(peer: PeerId, command: Command) -> Self {
        Self { peer, command }
    }
}

/// Who an outbound envelope goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every connected peer
    All,
    Peer(PeerId),
}

/// Envelope waiting to be sent
///
/// The envelope's sequence is stamped later, per connection, by the writer.
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub target: Target,
    pub envelope: Envelope,
    pub enqueued_at: Instant,
}

impl OutboundItem {
    pub fn broadcast(envelope: Envelope) -> Self {
        Self {
            target: Target::All,
            envelope,
            enqueued_at: Instant::now(),
        }
    }

    pub fn to_peer(peer: PeerId, envelope: Envelope) -> Self {
        Self {
            target: Target::Peer(peer),
            envelope,
            enqueued_at: Instant::now(),
        }
    }
}

/// An item that did not fit, handed back to the producer
#[derive(Debug)]
pub struct Overflow<T> {
    pub item: T,
    pub error: OverflowError,
}

/// Transport → simulation command queue; rejects the newest item when full
pub struct InboundQueue {
    items: ArrayQueue<InboundItem>,
    rejected: AtomicU64,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            rejected: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. On overflow the item is returned untouched.
    pub fn try_push(&self, item: InboundItem) -> Result<(), Overflow<InboundItem>> {
        self.items.push(item).map_err(|item| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Overflow {
                item,
                error: OverflowError {
                    queue: "inbound",
                    capacity: self.items.capacity(),
                },
            }
        })
    }

    /// Remove up to `limit` items in arrival order
    pub fn drain(&self, limit: usize) -> Vec<InboundItem> {
        let limit = limit.min(self.items.capacity());
        let mut batch = Vec::with_capacity(limit.min(self.items.len()));
        while batch.len() < limit {
            match self.items.pop() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Items refused since creation
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Lifecycle events drained for one tick
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SessionBatch {
    /// Connects and handshakes, in arrival order
    pub opened: Vec<(PeerId, SessionEvent)>,
    /// Peers that sent at least one heartbeat since the last drain
    pub heartbeats: Vec<PeerId>,
    /// Disconnects and losses, in arrival order
    pub ended: Vec<(PeerId, SessionEvent)>,
}

impl SessionBatch {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.heartbeats.is_empty() && self.ended.is_empty()
    }
}

/// Transport → simulation lifecycle events.
///
/// Unbounded so registration is never refused; growth is bounded by the
/// number of connections because heartbeats collapse to one entry per peer
/// between drains.
pub struct SessionEvents {
    tx: Sender<(PeerId, SessionEvent)>,
    rx: Receiver<(PeerId, SessionEvent)>,
    heartbeats: Mutex<BTreeSet<PeerId>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            heartbeats: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn report(&self, peer: PeerId, event: SessionEvent) {
        if event == SessionEvent::Heartbeat {
            lock(&self.heartbeats).insert(peer);
        } else {
            // Cannot fail: the receiver lives as long as the sender
            let _ = self.tx.send((peer, event));
        }
    }

    /// Everything reported since the last drain
    pub fn drain(&self) -> SessionBatch {
        let mut batch = SessionBatch::default();
        for (peer, event) in self.rx.try_iter() {
            if event.ends_connection() {
                batch.ended.push((peer, event));
            } else {
                batch.opened.push((peer, event));
            }
        }
        batch.heartbeats = std::mem::take(&mut *lock(&self.heartbeats))
            .into_iter()
            .collect();
        batch
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulation → transport close directives, one slot per live connection.
///
/// A directive is never evicted or expired. The transport attaches each
/// connection before reporting it, so every session the simulation knows
/// about can be closed whether or not it finished the handshake.
#[derive(Default)]
pub struct CloseSignals {
    links: Mutex<HashMap<PeerId, watch::Sender<Option<ErrorPayload>>>>,
}

impl CloseSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the receiver fires when the session is closed
    pub fn attach(&self, peer: PeerId) -> watch::Receiver<Option<ErrorPayload>> {
        let (tx, rx) = watch::channel(None);
        lock(&self.links).insert(peer, tx);
        rx
    }

    pub fn detach(&self, peer: PeerId) {
        lock(&self.links).remove(&peer);
    }

    /// Tell the connection to send `reason` and hang up. Returns `false`
    /// when the connection is already gone.
    pub fn close(&self, peer: PeerId, reason: ErrorPayload) -> bool {
        match lock(&self.links).get(&peer) {
            Some(tx) => {
                tx.send_replace(Some(reason));
                true
            }
            None => false,
        }
    }

    /// Connections currently attached
    pub fn len(&self) -> usize {
        lock(&self.links).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.links).is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulation → transport queue; evicts the oldest item when full
pub struct OutboundQueue {
    items: ArrayQueue<OutboundItem>,
    ready: Notify,
    evicted: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            ready: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    /// Enqueue and wake the dispatcher. Returns the item evicted to make room.
    pub fn push(&self, item: OutboundItem) -> Option<OutboundItem> {
        let evicted = self.items.force_push(item);
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<OutboundItem> {
        self.items.pop()
    }

    /// Wait until something has been pushed since the last wakeup
    pub async fn ready(&self) {
        self.ready.notified().await
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Items dropped to make room since creation
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Every channel crossing the thread boundary, shared by both sides
#[derive(Clone)]
pub struct BridgeQueues {
    pub inbound: Arc<InboundQueue>,
    pub events: Arc<SessionEvents>,
    pub outbound: Arc<OutboundQueue>,
    pub closes: Arc<CloseSignals>,
}

impl BridgeQueues {
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        Self {
            inbound: Arc::new(InboundQueue::new(inbound_capacity)),
            events: Arc::new(SessionEvents::new()),
            outbound: Arc::new(OutboundQueue::new(outbound_capacity)),
            closes: Arc::new(CloseSignals::new()),
        }
    }
}
