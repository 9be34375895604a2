// SPDX-License-Identifier: MPL-2.0

//! Byte-stream transport layer for MQTT connections
//!
//! The engine only needs an ordered, reliable byte stream. [`Transport`] is
//! that stream; a [`Connector`] opens a fresh one for every connect attempt.
//! TLS or WebSocket framing belongs below this layer.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod tcp;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Transport trait for different connection types
///
/// All transports implement AsyncRead and AsyncWrite so the engine can split
/// them into independently owned read and write halves.
#[async_trait]
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Gracefully close the connection
    async fn close(&mut self) -> Result<(), TransportError> {
        self.shutdown().await.map_err(TransportError::Io)
    }

    /// Get the peer address as a string
    fn peer_addr(&self) -> Result<String, TransportError>;

    /// Set TCP_NODELAY option (no-op for non-TCP transports)
    fn set_nodelay(&self, _nodelay: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Boxed transport for dynamic dispatch
pub type BoxedTransport = Box<dyn Transport>;

/// Opens a new [`Transport`] to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedTransport, TransportError>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

/// In-process pipe, mostly used to drive the engine against a scripted broker.
#[async_trait]
impl Transport for tokio::io::DuplexStream {
    fn peer_addr(&self) -> Result<String, TransportError> {
        Ok("duplex".to_string())
    }
}

pub use tcp::{TcpConnector, TcpTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_duplex_close_signals_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut transport: BoxedTransport = Box::new(client);
        transport.write_all(b"hi").await.unwrap();
        transport.close().await.unwrap();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");
        assert_eq!(transport.peer_addr().unwrap(), "duplex");
    }
}
