//! Request handlers
//!
//! One handler per request code. Every handler reads its body, calls into
//! the session manager, and either responds on the stream, transfers the
//! stream into the session layer, or fails with a classified error that
//! the pipeline's reply policy turns into a session-error reply or the
//! anonymous 401.

use std::sync::Arc;

use tracing::debug;

use crate::error::ProtocolError;
use crate::protocol::{
    self, HelloRequest, HelloResponse, RequestBase, SessionErrorCode, SessionResponseBase,
    TcpDatagramChannelRequest, TcpProxyChannelRequest, UdpChannelRequest,
    UdpChannelSessionResponse,
};
use crate::session::{Session, SessionError};
use crate::stream::ClientStream;

use super::ConnectionHost;

/// How a dispatched request left the stream
pub(crate) enum DispatchResult {
    /// Response written and flushed; the stream may be reused if its
    /// variant permits it
    Responded(Box<dyn ClientStream>),
    /// No response body by design (Bye); dispose ungracefully
    Abrupt(Box<dyn ClientStream>),
    /// Stream ownership moved into the session layer
    Transferred,
    /// Request failed; the stream is returned for the reply policy
    Failed {
        stream: Box<dyn ClientStream>,
        error: RequestError,
    },
}

/// Failure classes of a request exchange
///
/// The pipeline's reply policy is a single match over this type.
pub(crate) enum RequestError {
    /// Authenticated enough for a structured reply
    Session(SessionError),
    /// Unknown client or malformed request; answered with the 401
    Anonymous(ProtocolError),
    /// Transport-level failure; no reply possible
    Transport(ProtocolError),
}

/// Classify a protocol error from a request body read.
///
/// A truncated body is a malformed request and earns the 401; only a hard
/// transport failure (reset, broken pipe) goes down the silent path —
/// there is nobody left to read a reply.
fn classify_read(error: ProtocolError) -> RequestError {
    match error {
        ProtocolError::Io(_) if error.is_connection_closed() => RequestError::Transport(error),
        _ => RequestError::Anonymous(error),
    }
}

macro_rules! try_read {
    ($stream:expr, $max:expr) => {
        match protocol::read_message(&mut $stream, $max).await {
            Ok(request) => request,
            Err(e) => {
                return DispatchResult::Failed {
                    stream: $stream,
                    error: classify_read(e),
                }
            }
        }
    };
}

/// Authenticate a non-Hello request against the session manager
async fn authenticate(
    host: &ConnectionHost,
    base: &RequestBase,
    stream: &dyn ClientStream,
) -> Result<Arc<dyn Session>, SessionError> {
    host.session_manager()
        .get_session(
            base.session_id,
            &base.session_key,
            &base.request_id,
            stream.endpoint_pair(),
        )
        .await
}

/// Hello: create a session and publish the connection parameters
pub(crate) async fn handle_hello(
    host: &ConnectionHost,
    mut stream: Box<dyn ClientStream>,
) -> DispatchResult {
    let request: HelloRequest = try_read!(stream, host.max_message_size());
    let endpoints = stream.endpoint_pair();

    // Session creation comes first. Version validation happens after it so
    // an unknown client and a known-but-old client are indistinguishable
    // on the wire.
    let info = match host
        .session_manager()
        .create_session(&request, endpoints)
        .await
    {
        Ok(info) => info,
        Err(e) => {
            return DispatchResult::Failed {
                stream,
                error: RequestError::Session(e),
            }
        }
    };

    let session = match host
        .session_manager()
        .get_session(
            info.session_id,
            &info.session_key,
            &request.request_id,
            endpoints,
        )
        .await
    {
        Ok(session) => session,
        Err(e) => {
            return DispatchResult::Failed {
                stream,
                error: RequestError::Session(e),
            }
        }
    };
    session.set_use_udp_channel(request.use_udp_channel);

    if request.client_info.protocol_version < protocol::MIN_CLIENT_PROTOCOL_VERSION {
        return DispatchResult::Failed {
            stream,
            error: RequestError::Session(
                SessionError::new(
                    SessionErrorCode::UnsupportedClient,
                    format!(
                        "protocol version {} is not supported",
                        request.client_info.protocol_version
                    ),
                )
                .with_access_usage(info.access_usage),
            ),
        };
    }

    let udp_endpoints = host.udp_endpoints();
    let udp_port = if session.use_udp_channel() {
        udp_endpoints.first().map_or(0, |e| e.port())
    } else {
        0
    };
    let udp_key = if udp_port == 0 {
        None
    } else if request.use_udp_channel2 {
        Some(session.session_key())
    } else {
        Some(session.udp_channel_key())
    };

    let net_filter = host.net_filter();
    let response = HelloResponse {
        base: SessionResponseBase::ok(),
        session_id: info.session_id,
        session_key: info.session_key,
        server_secret: host.server_secret().to_string(),
        tcp_end_points: host.tcp_endpoints(),
        udp_end_points: udp_endpoints,
        udp_key,
        udp_port,
        server_version: crate::VERSION.to_string(),
        server_protocol_version: protocol::SERVER_PROTOCOL_VERSION,
        suppressed_to: info.suppressed_to,
        access_usage: info.access_usage,
        max_datagram_channel_count: host.max_datagram_channel_count(),
        client_public_address: endpoints.remote.ip(),
        include_ip_ranges: net_filter.include_ip_ranges.clone(),
        exclude_ip_ranges: net_filter.exclude_ip_ranges.clone(),
        packet_capture_include_ip_ranges: net_filter.packet_capture_include_ip_ranges.clone(),
        packet_capture_exclude_ip_ranges: net_filter.packet_capture_exclude_ip_ranges.clone(),
        is_ip_v6_supported: net_filter.is_ip_v6_supported,
    };

    match protocol::write_message(&mut stream, &response).await {
        Ok(()) => DispatchResult::Responded(stream),
        Err(e) => DispatchResult::Failed {
            stream,
            error: RequestError::Transport(e),
        },
    }
}

/// Bye: close the session; no response body
pub(crate) async fn handle_bye(
    host: &ConnectionHost,
    mut stream: Box<dyn ClientStream>,
) -> DispatchResult {
    let request: RequestBase = try_read!(stream, host.max_message_size());

    let session = match authenticate(host, &request, stream.as_ref()).await {
        Ok(session) => session,
        Err(e) => {
            return DispatchResult::Failed {
                stream,
                error: RequestError::Session(e),
            }
        }
    };

    if let Err(e) = host
        .session_manager()
        .close_session(session.id(), &request.request_id)
        .await
    {
        debug!(session_id = session.id(), error = %e, "Session close reported an error");
    }
    DispatchResult::Abrupt(stream)
}

/// TcpDatagramChannel: hand the stream to the session as a datagram channel
pub(crate) async fn handle_tcp_datagram_channel(
    host: &ConnectionHost,
    mut stream: Box<dyn ClientStream>,
) -> DispatchResult {
    let request: TcpDatagramChannelRequest = try_read!(stream, host.max_message_size());

    let session = match authenticate(host, &request.base, stream.as_ref()).await {
        Ok(session) => session,
        Err(e) => {
            return DispatchResult::Failed {
                stream,
                error: RequestError::Session(e),
            }
        }
    };

    // Ownership transfers here; the session owns the channel until it closes
    if let Err(e) = session.add_tcp_datagram_channel(stream).await {
        debug!(session_id = session.id(), error = %e, "Datagram channel rejected after handoff");
    }
    DispatchResult::Transferred
}

/// TcpProxyChannel: hand the stream to the session for splicing
pub(crate) async fn handle_tcp_proxy_channel(
    host: &ConnectionHost,
    mut stream: Box<dyn ClientStream>,
) -> DispatchResult {
    let request: TcpProxyChannelRequest = try_read!(stream, host.max_message_size());

    let session = match authenticate(host, &request.base, stream.as_ref()).await {
        Ok(session) => session,
        Err(e) => {
            return DispatchResult::Failed {
                stream,
                error: RequestError::Session(e),
            }
        }
    };

    if let Err(e) = session.add_tcp_proxy_channel(stream, &request).await {
        debug!(session_id = session.id(), error = %e, "Proxy channel rejected after handoff");
    }
    DispatchResult::Transferred
}

/// UdpChannel: enable UDP on the session and publish its key and port
pub(crate) async fn handle_udp_channel(
    host: &ConnectionHost,
    mut stream: Box<dyn ClientStream>,
) -> DispatchResult {
    let request: UdpChannelRequest = try_read!(stream, host.max_message_size());

    let session = match authenticate(host, &request.base, stream.as_ref()).await {
        Ok(session) => session,
        Err(e) => {
            return DispatchResult::Failed {
                stream,
                error: RequestError::Session(e),
            }
        }
    };

    session.set_use_udp_channel(true);
    let udp_port = host.udp_endpoints().first().map_or(0, |e| e.port());

    let response = UdpChannelSessionResponse {
        base: SessionResponseBase::ok(),
        udp_key: session.udp_key(),
        udp_port,
    };

    match protocol::write_message(&mut stream, &response).await {
        Ok(()) => DispatchResult::Responded(stream),
        Err(e) => DispatchResult::Failed {
            stream,
            error: RequestError::Transport(e),
        },
    }
}
