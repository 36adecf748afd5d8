//! HTTP-chunked reusable client stream
//!
//! The payload travels inside HTTP/1.1 chunked transfer-encoding carried
//! by the TLS stream: the client opens one long-lived HTTP request whose
//! chunked body is the request byte stream, and the server answers with
//! one chunked response whose body is the reply byte stream. Reads
//! decode the inbound chunk framing; writes encode the outbound framing
//! and lazily emit the response head before the first chunk.
//!
//! The first byte of the request line (`'P'`) has already been consumed
//! by the host's transport sniffer and is handed back to the constructor.
//! A graceful dispose terminates the response with the final zero-length
//! chunk before closing.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

use super::ClientStream;
use crate::error::StreamError;

/// Ceiling for the inbound HTTP request head
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Maximum number of request headers to parse
const MAX_HEADERS: usize = 64;

/// Internal read buffer size
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Ceiling for a chunk-size line, extensions included
const MAX_CHUNK_SIZE_LINE: usize = 32;

/// Response head emitted before the first outbound chunk
const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: application/octet-stream\r\n\
    Transfer-Encoding: chunked\r\n\r\n";

/// Inbound decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Accumulating the HTTP request head
    Head,
    /// Reading a chunk-size line
    ChunkSize,
    /// Inside a chunk body
    ChunkData { remaining: usize },
    /// Consuming the CRLF after a chunk body
    ChunkTrailer,
    /// Consuming the CRLF after the final zero chunk
    LastTrailer,
    /// Peer terminated its chunked stream or closed
    Eof,
}

/// Reusable client stream carried over HTTP chunked framing inside TLS
pub struct ChunkedClientStream<S> {
    inner: S,
    local: SocketAddr,
    remote: SocketAddr,

    read_state: ReadState,
    head_buf: Vec<u8>,
    line_buf: Vec<u8>,
    trailer_read: u8,
    read_buf: Box<[u8]>,
    read_pos: usize,
    read_len: usize,

    write_buf: Vec<u8>,
    write_pos: usize,
    head_sent: bool,
    terminator_sent: bool,
}

impl<S> ChunkedClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established TLS stream.
    ///
    /// `sentinel` is the first byte of the HTTP request line, already
    /// consumed by the transport sniffer.
    pub fn new(inner: S, local: SocketAddr, remote: SocketAddr, sentinel: u8) -> Self {
        Self {
            inner,
            local,
            remote,
            read_state: ReadState::Head,
            head_buf: vec![sentinel],
            line_buf: Vec::with_capacity(MAX_CHUNK_SIZE_LINE),
            trailer_read: 0,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            read_pos: 0,
            read_len: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            head_sent: false,
            terminator_sent: false,
        }
    }

    /// Refill the internal read buffer when drained.
    ///
    /// Returns `Ok(false)` when the peer closed the connection.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        if self.read_pos < self.read_len {
            return Poll::Ready(Ok(true));
        }
        let mut buf = ReadBuf::new(&mut self.read_buf);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
        let n = buf.filled().len();
        self.read_pos = 0;
        self.read_len = n;
        Poll::Ready(Ok(n > 0))
    }

    /// Validate the accumulated request head
    fn parse_head(&self) -> io::Result<()> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(&self.head_buf) {
            Ok(httparse::Status::Complete(_)) => {
                if request.version != Some(1) {
                    return Err(StreamError::invalid_head("not HTTP/1.1").into());
                }
                trace!(
                    remote = %self.remote,
                    method = request.method.unwrap_or("?"),
                    path = request.path.unwrap_or("?"),
                    "Chunked transport request head"
                );
                Ok(())
            }
            Ok(httparse::Status::Partial) => {
                Err(StreamError::invalid_head("truncated request head").into())
            }
            Err(e) => Err(StreamError::invalid_head(e.to_string()).into()),
        }
    }

    /// Drain pending encoded output into the inner stream
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

/// Parse a chunk-size line (hex size, optional extensions after `;`)
fn parse_chunk_size(line: &[u8]) -> io::Result<usize> {
    let line = match line.strip_suffix(b"\r") {
        Some(stripped) => stripped,
        None => return Err(StreamError::invalid_chunk("size line not CRLF-terminated").into()),
    };
    let hex = line.split(|&b| b == b';').next().unwrap_or_default();
    let text = std::str::from_utf8(hex)
        .map_err(|_| io::Error::from(StreamError::invalid_chunk("non-ASCII chunk size")))?;
    usize::from_str_radix(text.trim(), 16)
        .map_err(|_| StreamError::invalid_chunk(format!("bad chunk size {text:?}")).into())
}

impl<S> AsyncRead for ChunkedClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.read_state {
                ReadState::Eof => return Poll::Ready(Ok(())),

                ReadState::Head => {
                    if !ready!(this.poll_fill(cx))? {
                        this.read_state = ReadState::Eof;
                        continue;
                    }
                    while this.read_pos < this.read_len {
                        let byte = this.read_buf[this.read_pos];
                        this.read_pos += 1;
                        this.head_buf.push(byte);
                        if this.head_buf.ends_with(b"\r\n\r\n") {
                            this.parse_head()?;
                            this.read_state = ReadState::ChunkSize;
                            break;
                        }
                        if this.head_buf.len() > MAX_HEAD_SIZE {
                            return Poll::Ready(Err(StreamError::invalid_head(
                                "request head too large",
                            )
                            .into()));
                        }
                    }
                }

                ReadState::ChunkSize => {
                    if !ready!(this.poll_fill(cx))? {
                        this.read_state = ReadState::Eof;
                        continue;
                    }
                    while this.read_pos < this.read_len {
                        let byte = this.read_buf[this.read_pos];
                        this.read_pos += 1;
                        if byte == b'\n' {
                            let size = parse_chunk_size(&this.line_buf)?;
                            this.line_buf.clear();
                            this.read_state = if size == 0 {
                                ReadState::LastTrailer
                            } else {
                                ReadState::ChunkData { remaining: size }
                            };
                            break;
                        }
                        this.line_buf.push(byte);
                        if this.line_buf.len() > MAX_CHUNK_SIZE_LINE {
                            return Poll::Ready(Err(StreamError::invalid_chunk(
                                "chunk size line too long",
                            )
                            .into()));
                        }
                    }
                }

                ReadState::ChunkData { remaining } => {
                    if out.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    if !ready!(this.poll_fill(cx))? {
                        this.read_state = ReadState::Eof;
                        continue;
                    }
                    let available = this.read_len - this.read_pos;
                    let n = remaining.min(available).min(out.remaining());
                    out.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                    this.read_pos += n;
                    this.read_state = if remaining == n {
                        ReadState::ChunkTrailer
                    } else {
                        ReadState::ChunkData {
                            remaining: remaining - n,
                        }
                    };
                    return Poll::Ready(Ok(()));
                }

                ReadState::ChunkTrailer | ReadState::LastTrailer => {
                    if !ready!(this.poll_fill(cx))? {
                        this.read_state = ReadState::Eof;
                        continue;
                    }
                    while this.read_pos < this.read_len && this.trailer_read < 2 {
                        let byte = this.read_buf[this.read_pos];
                        this.read_pos += 1;
                        let expected = if this.trailer_read == 0 { b'\r' } else { b'\n' };
                        if byte != expected {
                            return Poll::Ready(Err(StreamError::invalid_chunk(
                                "chunk not CRLF-terminated",
                            )
                            .into()));
                        }
                        this.trailer_read += 1;
                    }
                    if this.trailer_read == 2 {
                        this.trailer_read = 0;
                        this.read_state = if this.read_state == ReadState::ChunkTrailer {
                            ReadState::ChunkSize
                        } else {
                            ReadState::Eof
                        };
                    }
                }
            }
        }
    }
}

impl<S> AsyncWrite for ChunkedClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        // A zero-length chunk would terminate the response stream
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if !this.head_sent {
            this.write_buf.extend_from_slice(RESPONSE_HEAD);
            this.head_sent = true;
        }
        this.write_buf
            .extend_from_slice(format!("{:X}\r\n", buf.len()).as_bytes());
        this.write_buf.extend_from_slice(buf);
        this.write_buf.extend_from_slice(b"\r\n");

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        if this.head_sent && !this.terminator_sent {
            this.write_buf.extend_from_slice(b"0\r\n\r\n");
            this.terminator_sent = true;
            ready!(this.poll_drain(cx))?;
        }

        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<S> ClientStream for ChunkedClientStream<S>
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
        true
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        // Bypasses the chunk encoder: the anonymous reply replaces the
        // HTTP response this stream would otherwise have produced.
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    async fn dispose(mut self: Box<Self>, graceful: bool) {
        if graceful {
            if let Err(e) = self.shutdown().await {
                trace!(remote = %self.remote, error = %e, "Chunked stream shutdown failed");
            }
        }
    }
}
