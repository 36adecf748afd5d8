//! Accept loop and per-connection request pipeline
//!
//! One accept loop runs per TCP listener. Each accepted connection gets a
//! detached task that TLS-authenticates, sniffs the transport framing,
//! and then processes request exchanges until the stream is disposed,
//! transferred, or times out. Chunked-reusable streams loop back into the
//! cycle with a fresh timeout per exchange.
//!
//! The loop tolerates a configured number of consecutive accept failures
//! ([`ACCEPT_ERROR_BUDGET`] by default); any successful accept resets the
//! counter, and exceeding the budget stops the whole host.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::handlers::{self, DispatchResult, RequestError};
use super::ConnectionHost;
use crate::protocol::{
    self, anonymous_reply, RequestCode, SessionResponseBase, CHUNKED_TRANSPORT_SENTINEL,
    RAW_TRANSPORT_VERSION,
};
use crate::stream::{ChunkedClientStream, ClientStream, RawClientStream};

/// Default number of consecutive accept errors tolerated before the
/// host stops itself; `HostConfig::accept_error_budget` overrides it
pub const ACCEPT_ERROR_BUDGET: u32 = 200;

/// Source of inbound connections for one accept loop
#[async_trait]
pub(crate) trait Acceptor: Send {
    async fn accept_connection(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept_connection(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept loop for one TCP listener.
///
/// The loop owns its listener: exiting drops it, so a stray `stop` never
/// double-closes the socket.
pub(crate) async fn accept_loop<A: Acceptor>(
    host: Arc<ConnectionHost>,
    mut listener: A,
    local: SocketAddr,
    cancel: CancellationToken,
) {
    info!(listen = %local, "Accept loop started");

    let error_budget = host.config().accept_error_budget;
    let mut consecutive_errors: u32 = 0;
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = listener.accept_connection() => match result {
                Ok((socket, remote)) => {
                    consecutive_errors = 0;
                    host.stats_ref()
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(client = %remote, listen = %local, "Accepted connection");

                    let host = Arc::clone(&host);
                    let token = cancel.clone();
                    connections.spawn(handle_connection(host, socket, local, remote, token));

                    // Reap finished connection tasks without blocking
                    while connections.try_join_next().is_some() {}
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if is_benign_accept_error(&e) {
                        trace!(listen = %local, error = %e, "Benign accept error");
                    } else {
                        warn!(listen = %local, error = %e, "Accept error");
                    }

                    if consecutive_errors > error_budget {
                        let budget_err = crate::error::HostError::ErrorBudgetExceeded {
                            addr: local,
                            count: consecutive_errors,
                        };
                        error!(listen = %local, error = %budget_err, "Stopping host");
                        let host = Arc::clone(&host);
                        tokio::spawn(async move { host.stop().await });
                        break;
                    }
                }
            }
        }
    }

    // Connection tasks observe the host token at every suspension point,
    // so this drain completes promptly once the token is cancelled.
    while connections.join_next().await.is_some() {}
    info!(listen = %local, "Accept loop exited");
}

/// Accept errors that need no log line
fn is_benign_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Outcome of one request cycle
enum CycleOutcome {
    /// Stream consumed: disposed or handed to the session layer
    Done,
    /// Chunked stream returned for another exchange
    Reuse(Box<dyn ClientStream>),
}

/// Per-connection pipeline: TLS, transport sniff, then request cycles
async fn handle_connection(
    host: Arc<ConnectionHost>,
    socket: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    cancel: CancellationToken,
) {
    let request_timeout = host.config().request_timeout();

    // TLS handshake and transport sniff share the first timeout window
    let established = tokio::select! {
        () = cancel.cancelled() => {
            trace!(client = %remote, "Connection setup cancelled");
            return;
        }
        established = timeout(
            request_timeout,
            establish_stream(&host, socket, local, remote, &cancel),
        ) => established,
    };

    let mut stream = match established {
        Ok(Some(stream)) => stream,
        Ok(None) => return,
        Err(_) => {
            debug!(client = %remote, "Connection setup timed out");
            return;
        }
    };

    // Request cycles: each exchange gets its own timeout, so a reused
    // stream is never charged for previous exchanges.
    loop {
        let cycle = process_request(&host, stream);
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                trace!(client = %remote, "Request cycle cancelled");
                return;
            }
            outcome = timeout(request_timeout, cycle) => outcome,
        };

        match outcome {
            Ok(CycleOutcome::Reuse(reusable)) => {
                host.stats_ref().streams_reused.fetch_add(1, Ordering::Relaxed);
                stream = reusable;
            }
            Ok(CycleOutcome::Done) => return,
            Err(_) => {
                // Dropping the cycle future disposes the stream ungracefully
                debug!(client = %remote, "Request exchange timed out");
                return;
            }
        }
    }
}

/// TLS-authenticate and sniff the transport framing byte
async fn establish_stream(
    host: &ConnectionHost,
    socket: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    cancel: &CancellationToken,
) -> Option<Box<dyn ClientStream>> {
    let mut tls_stream = match host.tls_service().accept(socket, local, cancel).await {
        Ok(stream) => stream,
        Err(e) => {
            host.stats_ref()
                .tls_handshake_failures
                .fetch_add(1, Ordering::Relaxed);
            debug!(client = %remote, error = %e, "TLS handshake failed");
            return None;
        }
    };

    let version = match tls_stream.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            // Closed before the first byte: a scanner or health check
            trace!(client = %remote, "Connection closed before transport negotiation");
            return None;
        }
        Err(e) => {
            debug!(client = %remote, error = %e, "Failed to read transport version");
            return None;
        }
    };

    match version {
        RAW_TRANSPORT_VERSION => {
            Some(Box::new(RawClientStream::new(tls_stream, local, remote)))
        }
        CHUNKED_TRANSPORT_SENTINEL => Some(Box::new(ChunkedClientStream::new(
            tls_stream, local, remote, version,
        ))),
        other => {
            let e = crate::error::ProtocolError::UnsupportedTransport(other);
            debug!(client = %remote, error = %e, "Closing connection");
            None
        }
    }
}

/// Process one request exchange on the stream
async fn process_request(host: &ConnectionHost, mut stream: Box<dyn ClientStream>) -> CycleOutcome {
    let remote = stream.remote_addr();

    let code_byte = match stream.read_u8().await {
        Ok(byte) => byte,
        Err(e) if is_closed_io(&e) => {
            trace!(client = %remote, "Connection closed between requests");
            stream.dispose(false).await;
            return CycleOutcome::Done;
        }
        Err(e) => {
            debug!(client = %remote, error = %e, "Failed to read request code");
            stream.dispose(false).await;
            return CycleOutcome::Done;
        }
    };

    let result = match RequestCode::try_from(code_byte) {
        Ok(code) => {
            trace!(client = %remote, ?code, "Dispatching request");
            dispatch(host, code, stream).await
        }
        Err(e) => DispatchResult::Failed {
            stream,
            error: RequestError::Anonymous(e),
        },
    };

    apply_reply_policy(host, result, remote).await
}

/// Route a known request code to its handler
async fn dispatch(
    host: &ConnectionHost,
    code: RequestCode,
    stream: Box<dyn ClientStream>,
) -> DispatchResult {
    match code {
        RequestCode::Hello => handlers::handle_hello(host, stream).await,
        RequestCode::TcpDatagramChannel => {
            handlers::handle_tcp_datagram_channel(host, stream).await
        }
        RequestCode::TcpProxyChannel => handlers::handle_tcp_proxy_channel(host, stream).await,
        RequestCode::UdpChannel => handlers::handle_udp_channel(host, stream).await,
        RequestCode::Bye => handlers::handle_bye(host, stream).await,
    }
}

/// The single reply-policy match over a dispatch result
async fn apply_reply_policy(
    host: &ConnectionHost,
    result: DispatchResult,
    remote: SocketAddr,
) -> CycleOutcome {
    match result {
        DispatchResult::Responded(stream) => {
            host.stats_ref()
                .requests_succeeded
                .fetch_add(1, Ordering::Relaxed);
            if stream.is_reusable() {
                CycleOutcome::Reuse(stream)
            } else {
                stream.dispose(true).await;
                CycleOutcome::Done
            }
        }

        DispatchResult::Abrupt(stream) => {
            host.stats_ref()
                .requests_succeeded
                .fetch_add(1, Ordering::Relaxed);
            stream.dispose(false).await;
            CycleOutcome::Done
        }

        DispatchResult::Transferred => {
            host.stats_ref()
                .requests_succeeded
                .fetch_add(1, Ordering::Relaxed);
            CycleOutcome::Done
        }

        DispatchResult::Failed { mut stream, error } => {
            match error {
                RequestError::Session(e) => {
                    host.stats_ref()
                        .session_error_replies
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(client = %remote, code = ?e.code, "Replying with session error");

                    let mut reply = SessionResponseBase::error(e.code, e.message);
                    reply.access_usage = e.access_usage;
                    if let Err(write_err) =
                        protocol::write_message(&mut stream, &reply).await
                    {
                        trace!(client = %remote, error = %write_err, "Failed to write session error");
                    }
                }
                RequestError::Anonymous(e) => {
                    host.stats_ref()
                        .anonymous_replies
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(client = %remote, error = %e, "Replying with anonymous 401");

                    if let Err(write_err) = stream.write_raw(&anonymous_reply()).await {
                        trace!(client = %remote, error = %write_err, "Failed to write anonymous reply");
                    }
                }
                RequestError::Transport(e) => {
                    if e.is_connection_closed() {
                        trace!(client = %remote, "Connection closed mid-exchange");
                    } else {
                        debug!(client = %remote, error = %e, "Transport error mid-exchange");
                    }
                }
            }
            stream.dispose(false).await;
            CycleOutcome::Done
        }
    }
}

fn is_closed_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
    )
}
