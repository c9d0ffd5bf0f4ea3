//! Socket addresses in `tcp://host:port` / `ipc:///path` form

use crate::error::TransportError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where a socket lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `ipc:///path/to.sock`
    Ipc(PathBuf),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = address.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{} (expected tcp://host:port)",
                    address
                )));
            }
            // ZeroMQ-style wildcard
            let addr = match addr.strip_prefix("*:") {
                Some(port) => format!("0.0.0.0:{}", port),
                None => addr.to_string(),
            };
            return Ok(Endpoint::Tcp(addr));
        }
        if let Some(path) = address.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{} (expected ipc:///path)",
                    address
                )));
            }
            return Ok(Endpoint::Ipc(path.into()));
        }
        Err(TransportError::InvalidEndpoint(format!(
            "{} (expected tcp:// or ipc:// scheme)",
            address
        )))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
