//! Transport abstractions for the bridge
//!
//! Provides AsyncReader/AsyncWriter traits implemented for TCP and Unix
//! domain sockets, and the listener/dialer pair the channel uses to obtain
//! connections.

use async_trait::async_trait;
use simlink_core::TransportError;

pub use simlink_core::Endpoint;

/// Trait for async reading from a transport
#[async_trait]
pub trait AsyncReader: Send {
    /// Read one complete frame, length prefix included
    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Trait for async writing to a transport
#[async_trait]
pub trait AsyncWriter: Send + Sync {
    /// Write one complete frame, length prefix included
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Flush and half-close the write side
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// An established, split connection
pub struct Connection {
    pub reader: Box<dyn AsyncReader>,
    pub writer: Box<dyn AsyncWriter>,
    /// Human-readable peer address for logs
    pub remote: String,
}

/// Bound socket accepting optimizer connections
pub enum Listener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(crate::unix::UnixSocketListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Tcp(addr) => crate::tcp::bind(addr).await.map(Listener::Tcp),
            #[cfg(unix)]
            Endpoint::Ipc(path) => crate::unix::UnixSocketListener::bind(path).map(Listener::Unix),
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(TransportError::InvalidEndpoint(
                "ipc:// endpoints need Unix domain sockets".into(),
            )),
        }
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        match self {
            Listener::Tcp(listener) => crate::tcp::accept(listener).await,
            #[cfg(unix)]
            Listener::Unix(listener) => listener.accept().await,
        }
    }

    /// Address actually bound, useful when binding port 0
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        match self {
            Listener::Tcp(listener) => listener
                .local_addr()
                .ok()
                .map(|addr| Endpoint::Tcp(addr.to_string())),
            #[cfg(unix)]
            Listener::Unix(listener) => Some(Endpoint::Ipc(listener.path().to_path_buf())),
        }
    }
}

/// Dial an endpoint once
pub async fn connect(endpoint: &Endpoint) -> Result<Connection, TransportError> {
    match endpoint {
        Endpoint::Tcp(addr) => crate::tcp::connect(addr).await,
        #[cfg(unix)]
        Endpoint::Ipc(path) => crate::unix::connect(path).await,
        #[cfg(not(unix))]
        Endpoint::Ipc(_) => Err(TransportError::InvalidEndpoint(
            "ipc:// endpoints need Unix domain sockets".into(),
        )),
    }
}
