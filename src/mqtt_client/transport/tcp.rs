// SPDX-License-Identifier: MPL-2.0

//! TCP transport implementation

use super::{BoxedTransport, Connector, Transport, TransportError};
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP transport implementation
///
/// This is a simple wrapper around `TcpStream` that implements the `Transport` trait.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        if addr.is_empty() {
            return Err(TransportError::InvalidAddress(addr.to_string()));
        }
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            TransportError::ConnectionFailed(format!("TCP connection to {} failed: {}", addr, e))
        })?;
        Ok(Self { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn peer_addr(&self) -> Result<String, TransportError> {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .map_err(TransportError::Io)
    }

    fn set_nodelay(&self, nodelay: bool) -> Result<(), TransportError> {
        self.stream.set_nodelay(nodelay).map_err(TransportError::Io)
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(ctx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(ctx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(ctx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(ctx)
    }
}

/// Connects to `host:port` over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            nodelay: true,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedTransport, TransportError> {
        let transport = TcpTransport::connect(&self.addr).await?;
        transport.set_nodelay(self.nodelay)?;
        debug!(addr = %self.addr, nodelay = self.nodelay, "tcp transport connected");
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpConnector::new(addr.clone());
        assert_eq!(connector.describe(), format!("tcp://{}", addr));
        let mut transport = connector.connect().await.unwrap();
        assert_eq!(transport.peer_addr().unwrap(), addr);
        transport.write_all(&[0xC0, 0x00]).await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(server.await.unwrap(), [0xC0, 0x00]);
    }

    #[tokio::test]
    async fn test_tcp_transport_invalid_address() {
        let result = TcpTransport::connect("invalid-address-that-does-not-exist:1883").await;
        assert!(result.is_err(), "Should fail with invalid address");
        assert!(matches!(
            TcpTransport::connect("").await,
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_transport_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = TcpTransport::connect(&addr).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
