//! Transport channel: sockets, per-connection tasks and the outbound dispatcher
//!
//! The channel owns a dedicated Tokio runtime so socket work never runs on
//! the simulation thread. It talks to the simulation side only through the
//! inbound and outbound queues.
//!
//! Per connection there is a reader loop (frames → decode → connection-level
//! checks → inbound queue) and a writer task that stamps sequence numbers.
//! A single dispatcher task drains the outbound queue and fans envelopes out
//! to the writers. Optimizer processes named in the configuration are
//! launched on the same runtime and killed with it.

use crate::backoff::{Backoff, BackoffPolicy};
use crate::process::OptimizerProcess;
use crate::queue::{
    BridgeQueues, CloseSignals, InboundItem, InboundQueue, OutboundItem, OutboundQueue,
    SessionEvent, SessionEvents, Target,
};
use crate::session::PeerId;
use crate::transport::{self, AsyncWriter, Connection, Endpoint, Listener};
use simlink_core::{
    BridgeConfig, Command, DecodeError, Envelope, EnvelopeKind, ErrorPayload, HeartbeatPayload,
    OptimizerProcessConfig, ReconnectConfig, Result, SUPPORTED_VERSIONS, SimLinkError, SocketRole,
    TransportError, codec, error_codes,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Name this side reports in heartbeats
pub const AGENT_NAME: &str = "simlink-bridge";

/// Upper bound on runtime shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a closing connection may spend flushing queued replies
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a killed optimizer process may take to be reaped
const PROCESS_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Observable channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Socket not yet bound or connected
    Connecting,
    /// Listening (bind role) or linked to the optimizer (connect role)
    Connected,
    /// Link lost; retrying with backoff
    Reconnecting,
    /// Retries exhausted `max_attempts`; still retrying at the capped delay
    Disconnected,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Handshake done; the peer may now receive dispatched envelopes
    Negotiated,
    Close,
}

enum ConnectionEnd {
    Shutdown,
    PeerClosed,
    /// Bridge decided to drop the peer (protocol violation)
    Rejected,
    /// Simulation side closed the session
    SessionClosed,
    WriterStopped,
    Failed(TransportError),
}

/// State shared by every task on the transport runtime
struct ChannelContext {
    inbound: Arc<InboundQueue>,
    events: Arc<SessionEvents>,
    outbound: Arc<OutboundQueue>,
    closes: Arc<CloseSignals>,
    /// Writers of negotiated connections
    peers: Mutex<HashMap<PeerId, mpsc::Sender<Envelope>>>,
    peer_count: AtomicUsize,
    peer_joined: Notify,
    next_peer: AtomicU64,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Receiver<bool>,
    role: SocketRole,
    retry_window: Duration,
    peer_buffer: usize,
}

impl ChannelContext {
    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Channel state {:?} -> {:?}", previous, state);
        }
    }

    fn next_peer_id(&self) -> PeerId {
        PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed))
    }

    async fn register_peer(&self, peer: PeerId, tx: mpsc::Sender<Envelope>) {
        self.peers.lock().await.insert(peer, tx);
        self.peer_count.fetch_add(1, Ordering::Release);
        self.peer_joined.notify_one();
    }

    async fn unregister_peer(&self, peer: PeerId) {
        if self.peers.lock().await.remove(&peer).is_some() {
            self.peer_count.fetch_sub(1, Ordering::Release);
        }
    }

    /// Forward a lifecycle event to the simulation side
    fn report(&self, peer: PeerId, event: SessionEvent) {
        self.events.report(peer, event);
    }

    /// Queue a command for the next tick, or tell the sender it was refused
    fn submit(&self, peer: PeerId, command: Command, tx: &mpsc::Sender<Envelope>) {
        let correlation_id = command.correlation_id;
        if let Err(overflow) = self.inbound.try_push(InboundItem::new(peer, command)) {
            warn!(
                "{}; rejecting command {} from {}",
                overflow.error, correlation_id, peer
            );
            reply(
                peer,
                tx,
                EnvelopeKind::Error,
                correlation_id,
                &ErrorPayload {
                    code: error_codes::INBOUND_OVERFLOW,
                    message: overflow.error.to_string(),
                    tick: None,
                },
            );
        }
    }

    /// Send everything queued, dropping items past the retry window
    async fn flush(&self) {
        let mut expired = 0usize;
        while let Some(item) = self.outbound.pop() {
            if item.enqueued_at.elapsed() > self.retry_window {
                expired += 1;
                continue;
            }
            self.deliver(item).await;
        }
        if expired > 0 {
            warn!(
                "Dropped {} outbound envelopes older than {:?}",
                expired, self.retry_window
            );
        }
    }

    async fn deliver(&self, item: OutboundItem) {
        let peers = self.peers.lock().await;
        match item.target {
            Target::All => {
                for (peer, tx) in peers.iter() {
                    enqueue(*peer, tx, item.envelope.clone());
                }
            }
            Target::Peer(peer) => match peers.get(&peer) {
                Some(tx) => enqueue(peer, tx, item.envelope),
                None => debug!(
                    "{} not connected, dropping {:?} envelope",
                    peer, item.envelope.kind
                ),
            },
        }
    }
}

fn enqueue(peer: PeerId, tx: &mpsc::Sender<Envelope>, envelope: Envelope) {
    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("{} is not keeping up, dropping envelope", peer),
        Err(TrySendError::Closed(_)) => debug!("{} writer already stopped", peer),
    }
}

/// Build and queue a direct reply on a connection
fn reply<T: serde::Serialize>(
    peer: PeerId,
    tx: &mpsc::Sender<Envelope>,
    kind: EnvelopeKind,
    correlation_id: u64,
    payload: &T,
) {
    match Envelope::seal(kind, correlation_id, payload) {
        Ok(envelope) => enqueue(peer, tx, envelope),
        Err(e) => error!("Failed to encode {:?} reply for {}: {}", kind, peer, e),
    }
}

/// Highest schema version both sides speak
pub fn negotiate(offered: &[u32]) -> Option<u32> {
    offered
        .iter()
        .copied()
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
        .max()
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Connection-level protocol state for one peer
struct PeerLink {
    peer: PeerId,
    version: Option<u32>,
    /// Shared with the writer so replies carry the negotiated version
    negotiated: Arc<AtomicU32>,
    last_sequence: Option<u64>,
    /// Set once the simulation side has closed this peer's session
    closed: watch::Receiver<Option<ErrorPayload>>,
}

impl PeerLink {
    fn new(peer: PeerId, negotiated: Arc<AtomicU32>, closed: watch::Receiver<Option<ErrorPayload>>) -> Self {
        Self {
            peer,
            version: None,
            negotiated,
            last_sequence: None,
            closed,
        }
    }

    fn handle_frame(&mut self, frame: &[u8], ctx: &ChannelContext, tx: &mpsc::Sender<Envelope>) -> Flow {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(DecodeError::VersionMismatch { found }) => {
                warn!("{} sent unsupported schema version {}", self.peer, found);
                self.reply_error(tx, 0, error_codes::VERSION_MISMATCH, format!("unsupported schema version {}", found));
                return Flow::Close;
            }
            Err(e) => {
                warn!("Dropping malformed frame from {} ({} bytes): {}", self.peer, frame.len(), e);
                return Flow::Continue;
            }
        };
        debug!(
            "[{}→Bridge] {:?} corr={} seq={} len={}",
            self.peer,
            envelope.kind,
            envelope.correlation_id,
            envelope.sequence,
            frame.len()
        );

        if let Some(last) = self.last_sequence {
            if envelope.sequence <= last {
                warn!(
                    "Dropping replayed envelope from {} (sequence {} after {})",
                    self.peer, envelope.sequence, last
                );
                return Flow::Continue;
            }
        }
        self.last_sequence = Some(envelope.sequence);

        let Some(version) = self.version else {
            return self.handshake(envelope, ctx, tx);
        };
        if envelope.version != version {
            warn!(
                "{} switched schema version from {} to {}",
                self.peer, version, envelope.version
            );
            self.reply_error(
                tx,
                envelope.correlation_id,
                error_codes::VERSION_MISMATCH,
                format!("negotiated version {}, got {}", version, envelope.version),
            );
            return Flow::Close;
        }

        match envelope.kind {
            EnvelopeKind::Heartbeat => {
                self.reply_heartbeat(tx, envelope.correlation_id);
                ctx.report(self.peer, SessionEvent::Heartbeat);
            }
            EnvelopeKind::Command => match envelope.open::<Command>() {
                Ok(command) => ctx.submit(self.peer, command, tx),
                Err(e) => warn!("Dropping command from {}: {}", self.peer, e),
            },
            other => debug!("Ignoring {:?} envelope from {}", other, self.peer),
        }
        Flow::Continue
    }

    fn handshake(&mut self, envelope: Envelope, ctx: &ChannelContext, tx: &mpsc::Sender<Envelope>) -> Flow {
        if envelope.kind != EnvelopeKind::Heartbeat {
            warn!("{} sent {:?} before handshake", self.peer, envelope.kind);
            self.reply_error(
                tx,
                envelope.correlation_id,
                error_codes::HANDSHAKE_REQUIRED,
                "first envelope must be a heartbeat".into(),
            );
            return Flow::Continue;
        }
        let hello: HeartbeatPayload = match envelope.open() {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Dropping handshake from {}: {}", self.peer, e);
                return Flow::Continue;
            }
        };
        let closed = self.closed.borrow().clone();
        if let Some(reason) = closed {
            warn!("Refusing handshake from {}: session already closed", self.peer);
            self.reply_error(tx, envelope.correlation_id, reason.code, reason.message);
            return Flow::Close;
        }

        match negotiate(&hello.supported_versions) {
            Some(version) => {
                info!("{} ({}) negotiated schema v{}", self.peer, hello.agent, version);
                self.version = Some(version);
                self.negotiated.store(version, Ordering::Release);
                self.reply_heartbeat(tx, envelope.correlation_id);
                ctx.report(self.peer, SessionEvent::Negotiated { version });
                Flow::Negotiated
            }
            None => {
                warn!(
                    "{} ({}) offered versions {:?}, this bridge speaks {:?}",
                    self.peer, hello.agent, hello.supported_versions, SUPPORTED_VERSIONS
                );
                self.reply_error(
                    tx,
                    envelope.correlation_id,
                    error_codes::VERSION_MISMATCH,
                    format!("no common schema version; supported {:?}", SUPPORTED_VERSIONS),
                );
                Flow::Close
            }
        }
    }

    fn reply_heartbeat(&self, tx: &mpsc::Sender<Envelope>, correlation_id: u64) {
        let payload = HeartbeatPayload {
            agent: AGENT_NAME.into(),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            tick: None,
        };
        reply(self.peer, tx, EnvelopeKind::Heartbeat, correlation_id, &payload);
    }

    fn reply_error(&self, tx: &mpsc::Sender<Envelope>, correlation_id: u64, code: i32, message: String) {
        let payload = ErrorPayload {
            code,
            message,
            tick: None,
        };
        reply(self.peer, tx, EnvelopeKind::Error, correlation_id, &payload);
    }
}

/// Writer task: stamps per-connection sequence numbers and writes frames
async fn write_loop(
    peer: PeerId,
    mut writer: Box<dyn AsyncWriter>,
    mut rx: mpsc::Receiver<Envelope>,
    negotiated: Arc<AtomicU32>,
    done: Arc<Notify>,
) -> std::result::Result<(), TransportError> {
    let mut sequence = 0u64;
    let result = loop {
        match rx.recv().await {
            Some(envelope) => {
                sequence += 1;
                let mut envelope = envelope.with_sequence(sequence);
                let version = negotiated.load(Ordering::Acquire);
                if version != 0 {
                    envelope = envelope.with_version(version);
                }
                let frame = match codec::encode(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Not sending {:?} to {}: {}", envelope.kind, peer, e);
                        continue;
                    }
                };
                debug!(
                    "[Bridge→{}] {:?} corr={} seq={} len={}",
                    peer,
                    envelope.kind,
                    envelope.correlation_id,
                    sequence,
                    frame.len()
                );
                if let Err(e) = writer.write_frame(&frame).await {
                    break Err(e);
                }
            }
            None => break Ok(()),
        }
    };
    if let Err(e) = writer.close().await {
        debug!("Closing writer for {}: {}", peer, e);
    }
    done.notify_one();
    result
}

/// Drive one connection until it ends, reporting lifecycle to the simulation
async fn run_connection(ctx: Arc<ChannelContext>, conn: Connection) -> ConnectionEnd {
    let peer = ctx.next_peer_id();
    let Connection {
        mut reader,
        writer,
        remote,
    } = conn;
    info!("Optimizer {} connected from {}", peer, remote);

    let (tx, rx) = mpsc::channel(ctx.peer_buffer);
    let negotiated = Arc::new(AtomicU32::new(0));
    let writer_done = Arc::new(Notify::new());
    let mut writer_task = tokio::spawn(write_loop(
        peer,
        writer,
        rx,
        negotiated.clone(),
        writer_done.clone(),
    ));

    let mut closed = ctx.closes.attach(peer);
    ctx.report(peer, SessionEvent::Connected);

    let mut link = PeerLink::new(peer, negotiated, closed.clone());
    let end = loop {
        tokio::select! {
            _ = stopped(ctx.shutdown.clone()) => break ConnectionEnd::Shutdown,
            _ = writer_done.notified() => break ConnectionEnd::WriterStopped,
            signal = closed.changed() => {
                let reason = closed.borrow_and_update().clone();
                match (signal, reason) {
                    (Ok(()), Some(reason)) => {
                        info!("Closing {}: {}", peer, reason.message);
                        reply(peer, &tx, EnvelopeKind::Error, 0, &reason);
                        break ConnectionEnd::SessionClosed;
                    }
                    (Ok(()), None) => {}
                    (Err(_), _) => break ConnectionEnd::SessionClosed,
                }
            }
            frame = reader.read_frame() => match frame {
                Ok(frame) => match link.handle_frame(&frame, &ctx, &tx) {
                    Flow::Continue => {}
                    Flow::Negotiated => ctx.register_peer(peer, tx.clone()).await,
                    Flow::Close => break ConnectionEnd::Rejected,
                },
                Err(TransportError::Closed) => break ConnectionEnd::PeerClosed,
                Err(e) => break ConnectionEnd::Failed(e),
            }
        }
    };

    ctx.unregister_peer(peer).await;
    ctx.closes.detach(peer);
    drop(tx);
    let written = match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => {
            error!("Writer for {} panicked: {}", peer, join);
            Ok(())
        }
        Err(_) => {
            writer_task.abort();
            debug!("Writer for {} did not drain in time", peer);
            Ok(())
        }
    };

    match (&end, written) {
        (ConnectionEnd::Shutdown | ConnectionEnd::SessionClosed, _) => {}
        (ConnectionEnd::Failed(e), _) => {
            warn!("Connection to {} failed: {}", peer, e);
            ctx.report(peer, SessionEvent::Lost);
        }
        (_, Err(e)) => {
            warn!("Connection to {} failed: {}", peer, e);
            ctx.report(peer, SessionEvent::Lost);
        }
        (_, Ok(())) => {
            info!("Optimizer {} disconnected", peer);
            ctx.report(peer, SessionEvent::Disconnected);
        }
    }
    end
}

async fn accept_loop(listener: Listener, ctx: Arc<ChannelContext>, policy: BackoffPolicy) {
    let mut backoff = Backoff::new(policy);
    loop {
        tokio::select! {
            _ = stopped(ctx.shutdown.clone()) => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    backoff.reset();
                    tokio::spawn(run_connection(ctx.clone(), conn));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!("Accept failed: {}; retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = stopped(ctx.shutdown.clone()) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Dial with a per-attempt timeout, up to `connect_attempts` times
async fn initial_connect(endpoint: &Endpoint, config: &ReconnectConfig) -> std::result::Result<Connection, String> {
    let mut backoff = Backoff::new(BackoffPolicy::from(config));
    let mut last_error = String::new();
    for attempt in 1..=config.connect_attempts {
        match tokio::time::timeout(config.connect_timeout(), transport::connect(endpoint)).await {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", config.connect_timeout()),
        }
        warn!(
            "Connect to {} failed (attempt {}/{}): {}",
            endpoint, attempt, config.connect_attempts, last_error
        );
        if attempt < config.connect_attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
    Err(format!("{}: {}", endpoint, last_error))
}

async fn connect_loop(endpoint: Endpoint, first: Connection, ctx: Arc<ChannelContext>, config: ReconnectConfig) {
    let mut backoff = Backoff::new(BackoffPolicy::from(&config));
    let mut next = Some(first);

    loop {
        let conn = match next.take() {
            Some(conn) => conn,
            None => match reconnect(&endpoint, &ctx, &config, &mut backoff).await {
                Some(conn) => conn,
                None => break,
            },
        };

        ctx.set_state(ChannelState::Connected);
        if let ConnectionEnd::Shutdown = run_connection(ctx.clone(), conn).await {
            break;
        }
        ctx.set_state(ChannelState::Reconnecting);
    }
    debug!("Connect loop stopped");
}

/// Retry until connected or shut down
async fn reconnect(
    endpoint: &Endpoint,
    ctx: &ChannelContext,
    config: &ReconnectConfig,
    backoff: &mut Backoff,
) -> Option<Connection> {
    backoff.reset();
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = stopped(ctx.shutdown.clone()) => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match tokio::time::timeout(config.connect_timeout(), transport::connect(endpoint)).await {
            Ok(Ok(conn)) => {
                info!("Reconnected to {} after {} attempts", endpoint, backoff.attempts());
                return Some(conn);
            }
            Ok(Err(e)) => debug!("Reconnect to {} failed: {}", endpoint, e),
            Err(_) => debug!("Reconnect to {} timed out", endpoint),
        }

        if backoff.attempts() == config.max_attempts {
            warn!(
                "Still disconnected from {} after {} attempts; retrying every {:?}",
                endpoint,
                config.max_attempts,
                config.max_backoff()
            );
            ctx.set_state(ChannelState::Disconnected);
        }
    }
}

async fn dispatch_loop(ctx: Arc<ChannelContext>) {
    loop {
        if ctx.peer_count.load(Ordering::Acquire) > 0 {
            ctx.flush().await;
        }
        tokio::select! {
            _ = ctx.outbound.ready() => {}
            _ = ctx.peer_joined.notified() => {}
            _ = stopped(ctx.shutdown.clone()) => break,
        }
    }
    debug!("Dispatcher stopped");
}

/// Socket side of the bridge, running on its own runtime
pub struct TransportChannel {
    runtime: Option<Runtime>,
    ctx: Arc<ChannelContext>,
    shutdown: watch::Sender<bool>,
    local: Option<Endpoint>,
    optimizers: Vec<OptimizerProcess>,
}

impl TransportChannel {
    /// Bind or connect according to `config`, blocking until the socket is
    /// usable. Must not be called from inside an async runtime.
    pub fn open(config: &BridgeConfig, queues: BridgeQueues) -> Result<Self> {
        let fatal = |msg: String| SimLinkError::FatalInit(msg);

        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(fatal("transport channel cannot be opened inside an async runtime".into()));
        }
        let endpoint: Endpoint = config
            .endpoint
            .address
            .parse()
            .map_err(|e: TransportError| fatal(e.to_string()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("simlink-transport")
            .enable_all()
            .build()
            .map_err(|e| fatal(format!("failed to start transport runtime: {}", e)))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(ChannelState::Connecting);
        let ctx = Arc::new(ChannelContext {
            inbound: queues.inbound,
            events: queues.events,
            outbound: queues.outbound,
            closes: queues.closes,
            peers: Mutex::new(HashMap::new()),
            peer_count: AtomicUsize::new(0),
            peer_joined: Notify::new(),
            next_peer: AtomicU64::new(1),
            state,
            shutdown: shutdown_rx,
            role: config.endpoint.role,
            retry_window: config.reconnect.retry_window(),
            peer_buffer: config.outbound_capacity.max(1),
        });

        let (local, optimizers) = match ctx.role {
            SocketRole::Bind => {
                let listener = runtime
                    .block_on(Listener::bind(&endpoint))
                    .map_err(|e| fatal(e.to_string()))?;
                let local = listener.local_endpoint();
                info!("Bridge listening on {}", local.as_ref().unwrap_or(&endpoint));
                let optimizers = launch(&config.optimizers, local.as_ref().unwrap_or(&endpoint), &runtime)?;
                ctx.set_state(ChannelState::Connected);
                runtime.spawn(accept_loop(
                    listener,
                    ctx.clone(),
                    BackoffPolicy::from(&config.reconnect),
                ));
                (local, optimizers)
            }
            SocketRole::Connect => {
                // The optimizer listens, so it has to be up before the first dial
                let optimizers = launch(&config.optimizers, &endpoint, &runtime)?;
                let conn = runtime
                    .block_on(initial_connect(&endpoint, &config.reconnect))
                    .map_err(fatal)?;
                info!("Bridge connected to {}", endpoint);
                ctx.set_state(ChannelState::Connected);
                runtime.spawn(connect_loop(
                    endpoint.clone(),
                    conn,
                    ctx.clone(),
                    config.reconnect.clone(),
                ));
                (Some(endpoint), optimizers)
            }
        };
        runtime.spawn(dispatch_loop(ctx.clone()));

        Ok(Self {
            runtime: Some(runtime),
            ctx,
            shutdown,
            local,
            optimizers,
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.ctx.state.borrow()
    }

    /// Endpoint actually bound or dialed
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.local.as_ref()
    }

    /// Connections that completed the handshake
    pub fn peer_count(&self) -> usize {
        self.ctx.peer_count.load(Ordering::Acquire)
    }

    /// Optimizer processes launched with the channel
    pub fn optimizers(&self) -> &[OptimizerProcess] {
        &self.optimizers
    }

    /// Stop every task, kill launched optimizers and close all sockets.
    /// In-flight sends are abandoned.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        self.ctx.set_state(ChannelState::Closed);
        let optimizers = std::mem::take(&mut self.optimizers);
        if tokio::runtime::Handle::try_current().is_ok() {
            // Dropping the supervisors with the runtime kills the processes
            runtime.shutdown_background();
        } else {
            runtime.block_on(async {
                for process in optimizers {
                    process.stop(PROCESS_STOP_TIMEOUT).await;
                }
            });
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        info!("Transport channel closed");
    }
}

/// Start every configured optimizer; on failure the ones already started are
/// killed when the runtime is dropped
fn launch(configs: &[OptimizerProcessConfig], bridge: &Endpoint, runtime: &Runtime) -> Result<Vec<OptimizerProcess>> {
    configs
        .iter()
        .map(|config| OptimizerProcess::spawn(config, bridge, runtime.handle()))
        .collect()
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_picks_highest_common() {
        assert_eq!(negotiate(&[1]), Some(1));
        assert_eq!(negotiate(&[3, 1, 2]), Some(1));
        assert_eq!(negotiate(&[2, 3]), None);
        assert_eq!(negotiate(&[]), None);
    }

    #[test]
    fn test_open_rejects_bad_endpoint() {
        let config = BridgeConfig {
            endpoint: simlink_core::EndpointConfig {
                address: "udp://127.0.0.1:1".into(),
                role: SocketRole::Bind,
            },
            ..Default::default()
        };
        let result = TransportChannel::open(&config, BridgeQueues::new(4, 4));
        assert!(matches!(result, Err(SimLinkError::FatalInit(_))));
    }

    #[test]
    fn test_open_connect_fails_when_nobody_listens() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = BridgeConfig::default();
        config.endpoint.address = format!("tcp://127.0.0.1:{}", port);
        config.endpoint.role = SocketRole::Connect;
        config.reconnect.connect_attempts = 2;
        config.reconnect.initial_backoff_ms = 10;
        config.reconnect.connect_timeout_ms = 200;

        let result = TransportChannel::open(&config, BridgeQueues::new(4, 4));
        assert!(matches!(result, Err(SimLinkError::FatalInit(_))));
    }

    #[test]
    fn test_bind_reports_local_endpoint_and_closes() {
        let mut config = BridgeConfig::default();
        config.endpoint.address = "tcp://127.0.0.1:0".into();

        let mut channel = TransportChannel::open(&config, BridgeQueues::new(4, 4)).unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        match channel.local_endpoint() {
            Some(Endpoint::Tcp(addr)) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected endpoint {:?}", other),
        }

        channel.shutdown();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.peer_count(), 0);
    }
}
