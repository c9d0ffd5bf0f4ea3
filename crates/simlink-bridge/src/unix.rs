//! Unix domain socket transport implementation
//!
//! Backs `ipc://` endpoints. The listener removes a stale socket file before
//! binding and deletes its own file when dropped.

use crate::transport::{AsyncReader, AsyncWriter, Connection};
use async_trait::async_trait;
use simlink_core::TransportError;
use simlink_core::codec::{read_frame_from, write_frame_to};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// Unix socket read wrapper
pub struct UnixReadWrapper(pub OwnedReadHalf);

#[async_trait]
impl AsyncReader for UnixReadWrapper {
    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        read_frame_from(&mut self.0).await
    }
}

/// Unix socket write wrapper
pub struct UnixWriteWrapper(pub OwnedWriteHalf);

#[async_trait]
impl AsyncWriter for UnixWriteWrapper {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        write_frame_to(&mut self.0, frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.shutdown().await.map_err(TransportError::Write)
    }
}

/// Listener that owns its socket file
pub struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixSocketListener {
    pub fn bind(path: &Path) -> Result<Self, TransportError> {
        let bind_err = |source| TransportError::Bind {
            address: path.display().to_string(),
            source,
        };

        if path.exists() {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path).map_err(bind_err)?;
        }
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, _) = self.listener.accept().await.map_err(TransportError::Read)?;
        Ok(split(stream, self.path.display().to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub(crate) async fn connect(path: &Path) -> Result<Connection, TransportError> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::Connect {
            address: path.display().to_string(),
            source,
        })?;
    Ok(split(stream, path.display().to_string()))
}

fn split(stream: UnixStream, remote: String) -> Connection {
    let (read_half, write_half) = stream.into_split();
    Connection {
        reader: Box::new(UnixReadWrapper(read_half)),
        writer: Box::new(UnixWriteWrapper(write_half)),
        remote,
    }
}
