//! Raw client stream
//!
//! The legacy framing: request bytes follow the version byte directly on
//! the TLS stream. One exchange per connection.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

use super::ClientStream;

/// Thin wrapper over the TLS stream; never reusable
pub struct RawClientStream<S> {
    inner: S,
    local: SocketAddr,
    remote: SocketAddr,
}

impl<S> RawClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established TLS stream
    pub fn new(inner: S, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            inner,
            local,
            remote,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RawClientStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RawClientStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<S> ClientStream for RawClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn is_reusable(&self) -> bool {
        false
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    async fn dispose(mut self: Box<Self>, graceful: bool) {
        if graceful {
            if let Err(e) = self.inner.shutdown().await {
                trace!(remote = %self.remote, error = %e, "Raw stream shutdown failed");
            }
        }
        // Dropping closes both TLS and TCP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:443".parse().unwrap(),
            "203.0.113.5:50000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_raw_passes_bytes_through() {
        let (client, server) = tokio::io::duplex(256);
        let (local, remote) = addrs();
        let mut stream = RawClientStream::new(server, local, remote);

        let mut peer = client;
        peer.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        stream.write_all(b"world").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_raw_is_never_reusable() {
        let (_client, server) = tokio::io::duplex(16);
        let (local, remote) = addrs();
        let stream = RawClientStream::new(server, local, remote);
        assert!(!stream.is_reusable());
        assert_eq!(stream.remote_addr(), remote);
        assert_eq!(stream.local_addr(), local);
    }

    #[tokio::test]
    async fn test_raw_graceful_dispose_closes_write_side() {
        let (mut client, server) = tokio::io::duplex(16);
        let (local, remote) = addrs();
        let stream = Box::new(RawClientStream::new(server, local, remote));

        stream.dispose(true).await;

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "peer should observe EOF after graceful dispose");
    }
}
