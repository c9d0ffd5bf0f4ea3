//! TCP transport implementation

use crate::transport::{AsyncReader, AsyncWriter, Connection};
use async_trait::async_trait;
use simlink_core::TransportError;
use simlink_core::codec::{read_frame_from, write_frame_to};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// TCP read wrapper
pub struct TcpReadWrapper(pub OwnedReadHalf);

#[async_trait]
impl AsyncReader for TcpReadWrapper {
    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        read_frame_from(&mut self.0).await
    }
}

/// TCP write wrapper
pub struct TcpWriteWrapper(pub OwnedWriteHalf);

#[async_trait]
impl AsyncWriter for TcpWriteWrapper {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        write_frame_to(&mut self.0, frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.shutdown().await.map_err(TransportError::Write)
    }
}

pub(crate) async fn bind(addr: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr).await.map_err(|source| TransportError::Bind {
        address: addr.to_string(),
        source,
    })
}

pub(crate) async fn accept(listener: &TcpListener) -> Result<Connection, TransportError> {
    let (stream, remote) = listener.accept().await.map_err(TransportError::Read)?;
    Ok(split(stream, remote.to_string()))
}

pub(crate) async fn connect(addr: &str) -> Result<Connection, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::Connect {
            address: addr.to_string(),
            source,
        })?;
    Ok(split(stream, addr.to_string()))
}

fn split(stream: TcpStream, remote: String) -> Connection {
    // Disable Nagle's algorithm for low latency
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", remote, e);
    }
    let (read_half, write_half) = stream.into_split();
    Connection {
        reader: Box::new(TcpReadWrapper(read_half)),
        writer: Box::new(TcpWriteWrapper(write_half)),
        remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simlink_core::{AckPayload, Envelope, EnvelopeKind, decode, encode};

    #[tokio::test]
    async fn test_tcp_frames_roundtrip() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await.unwrap();
            let frame = conn.reader.read_frame().await.unwrap();
            conn.writer.write_frame(&frame).await.unwrap();
        });

        let mut client = connect(&addr).await.unwrap();
        let env = Envelope::seal(EnvelopeKind::Ack, 11, &AckPayload { applied_tick: 2 })
            .unwrap()
            .with_sequence(1);
        client.writer.write_frame(&encode(&env).unwrap()).await.unwrap();

        let echoed = client.reader.read_frame().await.unwrap();
        assert_eq!(decode(&echoed).unwrap(), env);
        server.await.unwrap();

        // Server dropped its halves: clean EOF
        assert!(matches!(client.reader.read_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(matches!(connect(&addr).await, Err(TransportError::Connect { .. })));
    }
}
