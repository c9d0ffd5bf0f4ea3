//! Optimizer-side client for simlink bridges
//!
//! Dials a bridge (or accepts a bridge that dials out), performs the version
//! handshake and exchanges envelopes. Inbound frames are read by a background
//! task so every receive can be bounded by a timeout without losing data.
//! Once negotiated, a keepalive task heartbeats on a fixed interval so the
//! bridge never marks an idle optimizer stale.

use simlink_core::codec::{read_frame_from, write_frame_to};
use simlink_core::{
    AckPayload, Command, Endpoint, Envelope, EnvelopeKind, ErrorPayload, HeartbeatPayload, Result,
    SUPPORTED_VERSIONS, SimLinkError, Snapshot, TransportError, codec,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Correlation id carried by keepalive heartbeats; replies to it are consumed
/// internally and never surface through `recv`
pub const KEEPALIVE_CORRELATION_ID: u64 = 0;

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name reported in heartbeats
    pub agent: String,
    pub supported_versions: Vec<u32>,
    pub handshake_timeout: Duration,
    /// Heartbeat interval after the handshake; `None` disables keepalive
    pub keepalive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent: "simlink-optimizer".into(),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            handshake_timeout: Duration::from_secs(5),
            keepalive: Some(Duration::from_secs(1)),
        }
    }
}

impl ClientConfig {
    fn hello(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            agent: self.agent.clone(),
            supported_versions: self.supported_versions.clone(),
            tick: None,
        }
    }
}

/// Write half plus the per-connection stamping state, shared with the
/// keepalive task
struct Outbox {
    stream: BoxedWrite,
    next_sequence: u64,
    version: Option<u32>,
}

impl Outbox {
    /// Stamp the next sequence number and negotiated version, then send
    async fn send(&mut self, envelope: Envelope) -> Result<u64> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut envelope = envelope.with_sequence(sequence);
        if let Some(version) = self.version {
            envelope = envelope.with_version(version);
        }
        self.send_raw(&envelope).await?;
        Ok(sequence)
    }

    async fn send_raw(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode(envelope)?;
        debug!(
            "[Optimizer→Bridge] {:?} corr={} seq={} len={}",
            envelope.kind,
            envelope.correlation_id,
            envelope.sequence,
            frame.len()
        );
        write_frame_to(&mut self.stream, &frame).await?;
        Ok(())
    }
}

/// Outcome of a command as reported by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(AckPayload),
    Error(ErrorPayload),
}

/// Connection to one bridge
pub struct OptimizerClient {
    outbox: Arc<Mutex<Outbox>>,
    incoming: mpsc::Receiver<Result<Envelope>>,
    reader_handle: JoinHandle<()>,
    keepalive_handle: Option<JoinHandle<()>>,
    config: ClientConfig,
    version: Option<u32>,
    next_correlation: u64,
    last_received: Option<u64>,
    backlog: VecDeque<Envelope>,
}

impl OptimizerClient {
    /// Dial a bridge and complete the handshake
    pub async fn connect(address: &str) -> Result<Self> {
        Self::connect_with(address, ClientConfig::default()).await
    }

    pub async fn connect_with(address: &str, config: ClientConfig) -> Result<Self> {
        let mut client = Self::dial(address, config).await?;
        client.handshake().await?;
        Ok(client)
    }

    /// Dial without handshaking
    pub async fn dial(address: &str, config: ClientConfig) -> Result<Self> {
        let endpoint: Endpoint = address.parse()?;
        let connect_err = |source| TransportError::Connect {
            address: endpoint.to_string(),
            source,
        };

        let (reader, writer): (BoxedRead, BoxedWrite) = match &endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
                stream.set_nodelay(true).map_err(connect_err)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(connect_err)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(TransportError::InvalidEndpoint(
                    "ipc:// endpoints need Unix domain sockets".into(),
                )
                .into());
            }
        };
        debug!("Connected to bridge at {}", endpoint);
        Ok(Self::from_halves(reader, writer, config))
    }

    fn from_halves(reader: BoxedRead, writer: BoxedWrite, config: ClientConfig) -> Self {
        let (tx, incoming) = mpsc::channel(256);
        let reader_handle = tokio::spawn(read_loop(reader, tx));
        Self {
            outbox: Arc::new(Mutex::new(Outbox {
                stream: writer,
                next_sequence: 1,
                version: None,
            })),
            incoming,
            reader_handle,
            keepalive_handle: None,
            config,
            version: None,
            next_correlation: 1,
            last_received: None,
            backlog: VecDeque::new(),
        }
    }

    /// Offer our versions and wait for the bridge's heartbeat reply
    pub async fn handshake(&mut self) -> Result<u32> {
        let correlation_id = self.heartbeat().await?;
        let timeout = self.config.handshake_timeout;
        let envelope = self
            .wait_for(timeout, |e| {
                e.correlation_id == correlation_id
                    && matches!(e.kind, EnvelopeKind::Heartbeat | EnvelopeKind::Error)
            })
            .await?;

        if envelope.kind == EnvelopeKind::Error {
            let error: ErrorPayload = envelope.open()?;
            return Err(SimLinkError::Protocol(format!(
                "handshake rejected ({}): {}",
                error.code, error.message
            )));
        }
        let hello: HeartbeatPayload = envelope.open()?;
        let version = hello
            .supported_versions
            .iter()
            .copied()
            .filter(|v| self.config.supported_versions.contains(v))
            .max()
            .unwrap_or(envelope.version);
        info!("Handshake with {} done, schema v{}", hello.agent, version);
        self.version = Some(version);
        self.outbox.lock().await.version = Some(version);
        self.start_keepalive();
        Ok(version)
    }

    fn start_keepalive(&mut self) {
        let Some(period) = self.config.keepalive.filter(|period| !period.is_zero()) else {
            return;
        };
        if let Some(previous) = self.keepalive_handle.take() {
            previous.abort();
        }
        let outbox = self.outbox.clone();
        let hello = self.config.hello();
        self.keepalive_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let envelope = match Envelope::seal(EnvelopeKind::Heartbeat, KEEPALIVE_CORRELATION_ID, &hello) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Keepalive heartbeat could not be encoded: {}", e);
                        break;
                    }
                };
                if let Err(e) = outbox.lock().await.send(envelope).await {
                    debug!("Keepalive stopped: {}", e);
                    break;
                }
            }
        }));
    }

    /// Allocate a correlation id unique within this connection; never
    /// [`KEEPALIVE_CORRELATION_ID`]
    pub fn next_correlation_id(&mut self) -> u64 {
        let id = self.next_correlation;
        self.next_correlation += 1;
        id
    }

    /// Send a heartbeat; returns its correlation id
    pub async fn heartbeat(&mut self) -> Result<u64> {
        let correlation_id = self.next_correlation_id();
        let payload = self.config.hello();
        self.send(Envelope::seal(EnvelopeKind::Heartbeat, correlation_id, &payload)?)
            .await?;
        Ok(correlation_id)
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        let envelope = Envelope::seal(EnvelopeKind::Command, command.correlation_id, command)?;
        self.send(envelope).await.map(|_| ())
    }

    /// Stamp the next sequence number and negotiated version, then send.
    /// Returns the sequence used.
    pub async fn send(&mut self, envelope: Envelope) -> Result<u64> {
        self.outbox.lock().await.send(envelope).await
    }

    /// Send an envelope exactly as given
    pub async fn send_raw(&mut self, envelope: &Envelope) -> Result<()> {
        self.outbox.lock().await.send_raw(envelope).await
    }

    /// Write arbitrary bytes to the socket
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mut outbox = self.outbox.lock().await;
        outbox.stream.write_all(bytes).await.map_err(TransportError::Write)?;
        outbox.stream.flush().await.map_err(TransportError::Write)?;
        Ok(())
    }

    /// Next envelope in arrival order
    pub async fn recv(&mut self) -> Result<Envelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Ok(envelope);
        }
        self.read_next().await
    }

    /// Next envelope, or `None` if nothing arrives in time
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Ok(Some(envelope));
        }
        match tokio::time::timeout(timeout, self.read_next()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Wait for the next snapshot, keeping other envelopes for later
    pub async fn next_snapshot(&mut self, timeout: Duration) -> Result<Snapshot> {
        let envelope = self
            .wait_for(timeout, |e| e.kind == EnvelopeKind::Snapshot)
            .await?;
        Ok(envelope.open()?)
    }

    /// Wait for the ack or error answering `correlation_id`
    pub async fn await_reply(&mut self, correlation_id: u64, timeout: Duration) -> Result<Reply> {
        let envelope = self
            .wait_for(timeout, |e| {
                e.correlation_id == correlation_id
                    && matches!(e.kind, EnvelopeKind::Ack | EnvelopeKind::Error)
            })
            .await?;
        match envelope.kind {
            EnvelopeKind::Ack => Ok(Reply::Ack(envelope.open()?)),
            _ => Ok(Reply::Error(envelope.open()?)),
        }
    }

    /// First envelope matching `pred`; non-matching ones stay queued in order
    async fn wait_for<F>(&mut self, timeout: Duration, pred: F) -> Result<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            if let Some(envelope) = self.backlog.remove(pos) {
                return Ok(envelope);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, self.read_next()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SimLinkError::Timeout(format!(
                        "no matching envelope within {:?}",
                        timeout
                    )));
                }
            };
            if pred(&envelope) {
                return Ok(envelope);
            }
            self.backlog.push_back(envelope);
        }
    }

    async fn read_next(&mut self) -> Result<Envelope> {
        loop {
            let envelope = self
                .incoming
                .recv()
                .await
                .ok_or(SimLinkError::Transport(TransportError::Closed))??;
            if let Some(last) = self.last_received {
                if envelope.sequence <= last {
                    warn!(
                        "Bridge sequence went from {} to {}",
                        last, envelope.sequence
                    );
                }
            }
            self.last_received = Some(envelope.sequence);
            if envelope.kind == EnvelopeKind::Heartbeat && envelope.correlation_id == KEEPALIVE_CORRELATION_ID {
                continue;
            }
            return Ok(envelope);
        }
    }

    /// Negotiated schema version, once the handshake is done
    pub fn negotiated_version(&self) -> Option<u32> {
        self.version
    }

    /// Sequence of the last envelope received from the bridge
    pub fn last_received_sequence(&self) -> Option<u64> {
        self.last_received
    }

    /// Stop the keepalive and half-close the socket; the bridge sees a clean
    /// disconnect
    pub async fn close(mut self) -> Result<()> {
        if let Some(keepalive) = self.keepalive_handle.take() {
            keepalive.abort();
        }
        self.outbox
            .lock()
            .await
            .stream
            .shutdown()
            .await
            .map_err(TransportError::Write)?;
        Ok(())
    }
}

impl Drop for OptimizerClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        if let Some(keepalive) = self.keepalive_handle.take() {
            keepalive.abort();
        }
    }
}

/// Read frames until the stream ends, forwarding decoded envelopes
async fn read_loop(mut reader: BoxedRead, tx: mpsc::Sender<Result<Envelope>>) {
    loop {
        let item = match read_frame_from(&mut reader).await {
            Ok(frame) => codec::decode(&frame).map_err(SimLinkError::from),
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                break;
            }
        };
        if tx.send(item).await.is_err() {
            break;
        }
    }
}

/// Listening socket for bridges configured with the `connect` role
pub struct OptimizerListener {
    inner: ListenerKind,
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
}

impl OptimizerListener {
    pub async fn bind(address: &str) -> Result<Self> {
        let endpoint: Endpoint = address.parse()?;
        let bind_err = |source| TransportError::Bind {
            address: endpoint.to_string(),
            source,
        };
        let inner = match &endpoint {
            Endpoint::Tcp(addr) => ListenerKind::Tcp(TcpListener::bind(addr).await.map_err(bind_err)?),
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(bind_err)?;
                }
                let listener = tokio::net::UnixListener::bind(path).map_err(bind_err)?;
                ListenerKind::Unix(listener, path.clone())
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(TransportError::InvalidEndpoint(
                    "ipc:// endpoints need Unix domain sockets".into(),
                )
                .into());
            }
        };
        Ok(Self { inner })
    }

    /// Bound address in `tcp://` / `ipc://` form
    pub fn local_address(&self) -> Option<String> {
        match &self.inner {
            ListenerKind::Tcp(listener) => listener
                .local_addr()
                .ok()
                .map(|addr| Endpoint::Tcp(addr.to_string()).to_string()),
            #[cfg(unix)]
            ListenerKind::Unix(_, path) => Some(Endpoint::Ipc(path.clone()).to_string()),
        }
    }

    /// Accept one bridge and complete the handshake
    pub async fn accept(&self, config: ClientConfig) -> Result<OptimizerClient> {
        let (reader, writer): (BoxedRead, BoxedWrite) = match &self.inner {
            ListenerKind::Tcp(listener) => {
                let (stream, remote) = listener.accept().await.map_err(TransportError::Read)?;
                debug!("Bridge connected from {}", remote);
                let _ = stream.set_nodelay(true);
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener, _) => {
                let (stream, _) = listener.accept().await.map_err(TransportError::Read)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        let mut client = OptimizerClient::from_halves(reader, writer, config);
        client.handshake().await?;
        Ok(client)
    }
}

impl Drop for OptimizerListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenerKind::Unix(_, path) = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}
