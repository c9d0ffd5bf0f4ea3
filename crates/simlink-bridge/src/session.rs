//! Optimizer session registry
//!
//! Owned by the simulation thread; the transport only reports events about
//! connections and never touches session state directly.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info};

/// Closed peers remembered so that late traffic is recognised and dropped
const MAX_TOMBSTONES: usize = 1024;

/// Transport-assigned connection identifier; never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection seen, version not yet negotiated
    Connecting,
    Active,
    /// No traffic within the heartbeat timeout, or connection lost
    Stale,
    Closed,
}

/// Per-peer bookkeeping
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: PeerId,
    pub state: SessionState,
    pub last_seen_tick: u64,
    pub negotiated_version: Option<u32>,
    pending: HashSet<u64>,
    pending_order: VecDeque<u64>,
}

impl Session {
    fn new(peer: PeerId, tick: u64) -> Self {
        Self {
            peer,
            state: SessionState::Connecting,
            last_seen_tick: tick,
            negotiated_version: None,
            pending: HashSet::new(),
            pending_order: VecDeque::new(),
        }
    }

    /// Whether a correlation id is inside the dedup window
    pub fn is_pending(&self, correlation_id: u64) -> bool {
        self.pending.contains(&correlation_id)
    }

    /// Correlation ids in the dedup window, oldest first
    pub fn pending_correlation_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending_order.iter().copied()
    }

    fn remember(&mut self, correlation_id: u64, window: usize) {
        self.pending.insert(correlation_id);
        self.pending_order.push_back(correlation_id);
        while self.pending_order.len() > window {
            if let Some(oldest) = self.pending_order.pop_front() {
                self.pending.remove(&oldest);
            }
        }
    }

    fn revive(&mut self, tick: u64) {
        self.last_seen_tick = tick;
        if self.state == SessionState::Stale {
            debug!("Session {} is live again", self.peer);
            self.state = SessionState::Active;
        }
    }
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session already closed: {0}")]
    Closed(PeerId),
    #[error("Session not found: {0}")]
    NotFound(PeerId),
}

/// Registry of optimizer sessions
pub struct SessionRegistry {
    sessions: BTreeMap<PeerId, Session>,
    closed: HashSet<PeerId>,
    closed_order: VecDeque<PeerId>,
    heartbeat_timeout: u64,
    dedup_window: usize,
}

impl SessionRegistry {
    /// Create a registry with the given staleness timeout (in ticks) and
    /// per-session correlation window
    pub fn new(heartbeat_timeout: u64, dedup_window: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            closed: HashSet::new(),
            closed_order: VecDeque::new(),
            heartbeat_timeout,
            dedup_window: dedup_window.max(1),
        }
    }

    /// Create the session on first contact, otherwise refresh its liveness
    pub fn register_or_touch(&mut self, peer: PeerId, tick: u64) -> Result<&Session, RegistryError> {
        if self.closed.contains(&peer) {
            return Err(RegistryError::Closed(peer));
        }
        let session = self.sessions.entry(peer).or_insert_with(|| {
            info!("Optimizer session {} opened", peer);
            Session::new(peer, tick)
        });
        session.revive(tick);
        Ok(session)
    }

    /// Record the negotiated schema version and activate the session
    pub fn mark_negotiated(&mut self, peer: PeerId, version: u32, tick: u64) -> Result<(), RegistryError> {
        self.register_or_touch(peer, tick)?;
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.negotiated_version = Some(version);
            session.state = SessionState::Active;
            debug!("Session {} negotiated schema v{}", peer, version);
        }
        Ok(())
    }

    /// Transport reported an I/O failure; the next sweep closes the session
    pub fn mark_lost(&mut self, peer: PeerId) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.state = SessionState::Stale;
        }
    }

    /// Accept a correlation id for processing.
    ///
    /// Returns `false` when the session is unknown or closed, or when the id
    /// was already seen inside the dedup window.
    pub fn validate(&mut self, correlation_id: u64, peer: PeerId) -> bool {
        let window = self.dedup_window;
        match self.sessions.get_mut(&peer) {
            Some(session) if session.state != SessionState::Closed => {
                if session.is_pending(correlation_id) {
                    return false;
                }
                session.remember(correlation_id, window);
                true
            }
            _ => false,
        }
    }

    /// Age sessions by one step: live sessions past the timeout become stale
    /// and sessions already stale are closed. Returns the sessions closed.
    pub fn sweep_stale(&mut self, tick: u64) -> Vec<Session> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            match session.state {
                SessionState::Stale => expired.push(session.peer),
                SessionState::Connecting | SessionState::Active => {
                    if tick.saturating_sub(session.last_seen_tick) > self.heartbeat_timeout {
                        debug!(
                            "Session {} stale (last seen tick {}, now {})",
                            session.peer, session.last_seen_tick, tick
                        );
                        session.state = SessionState::Stale;
                    }
                }
                SessionState::Closed => {}
            }
        }

        expired.into_iter().filter_map(|peer| self.close(peer)).collect()
    }

    /// Remove a session, discarding its pending correlation ids
    pub fn close(&mut self, peer: PeerId) -> Option<Session> {
        let mut session = self.sessions.remove(&peer)?;
        session.state = SessionState::Closed;
        session.pending.clear();
        session.pending_order.clear();
        self.tombstone(peer);
        info!("Optimizer session {} closed", peer);
        Some(session)
    }

    fn tombstone(&mut self, peer: PeerId) {
        if self.closed.insert(peer) {
            self.closed_order.push_back(peer);
        }
        while self.closed_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }

    pub fn is_closed(&self, peer: PeerId) -> bool {
        self.closed.contains(&peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&Session> {
        self.sessions.get(&peer)
    }

    /// Sessions currently tracked, in peer order
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
