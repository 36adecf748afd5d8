//! Client stream abstraction
//!
//! A [`ClientStream`] is a bidirectional byte stream bound to one remote
//! peer, carrying one or more request/response exchanges. Two framing
//! variants exist:
//!
//! - [`RawClientStream`]: a thin wrapper over the TLS stream. One exchange
//!   per connection; never reusable.
//! - [`ChunkedClientStream`]: the payload rides inside HTTP/1.1 chunked
//!   transfer-encoding within the TLS stream. After a response has been
//!   fully written and flushed the same connection can carry further
//!   exchanges.
//!
//! The host selects the variant from the first byte read after the TLS
//! handshake (`0x01` raw, `'P'` chunked) and holds streams as
//! `Box<dyn ClientStream>`. Reuse is the host's decision: a stream only
//! reports whether its variant permits it.

mod chunked;
mod raw;

pub use chunked::ChunkedClientStream;
pub use raw::RawClientStream;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Local/remote address pair of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    /// Local bind address the connection arrived on
    pub local: SocketAddr,
    /// Remote peer address
    pub remote: SocketAddr,
}

impl std::fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// A bidirectional byte stream bound to one remote peer
///
/// Every exchange either disposes the stream or hands it back to the host
/// for reuse. Reuse is only valid for a reusable variant and only after a
/// full response body has been written and flushed; the host's request
/// pipeline enforces that ordering.
#[async_trait]
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {
    /// Remote peer address
    fn remote_addr(&self) -> SocketAddr;

    /// Local bind address the connection arrived on
    fn local_addr(&self) -> SocketAddr;

    /// Local/remote pair
    fn endpoint_pair(&self) -> EndpointPair {
        EndpointPair {
            local: self.local_addr(),
            remote: self.remote_addr(),
        }
    }

    /// Whether this variant permits reuse after a completed exchange
    fn is_reusable(&self) -> bool;

    /// Write pre-formatted bytes directly on the transport, bypassing the
    /// variant's response framing, then flush.
    ///
    /// Carries the anonymous error reply, which must reach the peer as
    /// literal bytes even on the chunked variant.
    async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Close the stream.
    ///
    /// A graceful dispose terminates the stream's framing (final
    /// zero-length chunk for the chunked variant) and shuts the transport
    /// down cleanly; an ungraceful dispose simply drops the connection.
    async fn dispose(self: Box<Self>, graceful: bool);
}
