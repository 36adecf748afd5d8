//! Session layer interface
//!
//! The host never owns session state; it calls into a [`SessionManager`]
//! supplied at construction. The manager authenticates requests, creates
//! and closes sessions, and hands out [`Session`] handles that adopt
//! tunnel channels and receive demultiplexed UDP datagrams.
//!
//! Implementations live outside this crate; the traits pin down exactly
//! the operations the connection host invokes.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::protocol::{
    AccessUsage, HelloRequest, SessionErrorCode, SuppressType, TcpProxyChannelRequest,
};
use crate::stream::{ClientStream, EndpointPair};

/// Session identifier; also the demux key of the UDP envelope
pub type SessionId = u64;

/// A session-layer failure carrying its wire error code
///
/// These errors reach clients as a structured [`SessionResponseBase`]
/// reply rather than the anonymous 401.
///
/// [`SessionResponseBase`]: crate::protocol::SessionResponseBase
#[derive(Debug, Clone, Error)]
#[error("Session error ({code:?}): {message}")]
pub struct SessionError {
    /// Wire error code sent to the client
    pub code: SessionErrorCode,
    /// Diagnostic message
    pub message: String,
    /// Usage snapshot attached to the reply, when known
    pub access_usage: Option<AccessUsage>,
}

impl SessionError {
    /// Create an error with a code and diagnostic message
    pub fn new(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            access_usage: None,
        }
    }

    /// Attach a usage snapshot to the reply
    #[must_use]
    pub fn with_access_usage(mut self, usage: AccessUsage) -> Self {
        self.access_usage = Some(usage);
        self
    }
}

/// State returned by session creation
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Assigned session id
    pub session_id: SessionId,
    /// Opaque key authenticating subsequent requests (base64)
    pub session_key: String,
    /// Usage snapshot at creation
    pub access_usage: AccessUsage,
    /// Whether an older session was suppressed in favour of this one
    pub suppressed_to: SuppressType,
}

/// An authenticated session owned by the session layer
#[async_trait]
pub trait Session: Send + Sync {
    /// Session id
    fn id(&self) -> SessionId;

    /// Key authenticating requests to this session; with the current key
    /// derivation this is also the UDP key.
    fn session_key(&self) -> String;

    /// Legacy UDP channel key for clients predating the current derivation
    fn udp_channel_key(&self) -> String;

    /// Effective UDP key, per the derivation negotiated at Hello
    fn udp_key(&self) -> String;

    /// Record whether the client asked for a UDP channel
    fn set_use_udp_channel(&self, enabled: bool);

    /// Whether this session tunnels datagrams over UDP
    fn use_udp_channel(&self) -> bool;

    /// Adopt the stream as a long-lived bidirectional datagram channel.
    /// Ownership transfers to the session until the channel closes.
    async fn add_tcp_datagram_channel(
        &self,
        channel: Box<dyn ClientStream>,
    ) -> Result<(), SessionError>;

    /// Splice the stream with an outbound connection to the requested
    /// destination. Same ownership transfer as the datagram channel.
    async fn add_tcp_proxy_channel(
        &self,
        channel: Box<dyn ClientStream>,
        request: &TcpProxyChannelRequest,
    ) -> Result<(), SessionError>;

    /// Deliver one inbound UDP datagram (integrity tag plus encrypted
    /// payload, session-id prefix stripped) with its source address.
    /// Datagrams for one socket arrive in receipt order.
    async fn receive_udp_datagram(&self, datagram: Bytes, from: SocketAddr);
}

/// The external session manager the host dispatches into
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Create a session for a Hello request. The manager assigns the id
    /// and key and determines access usage.
    async fn create_session(
        &self,
        request: &HelloRequest,
        endpoints: EndpointPair,
    ) -> Result<SessionInfo, SessionError>;

    /// Look up a session, authenticating with its key.
    ///
    /// `request_id` is the client's idempotency id for the exchange;
    /// the manager uses it to deduplicate retried requests.
    async fn get_session(
        &self,
        session_id: SessionId,
        session_key: &str,
        request_id: &str,
        endpoints: EndpointPair,
    ) -> Result<Arc<dyn Session>, SessionError>;

    /// Look up a session by id alone; used only by the UDP demux path,
    /// where the envelope's integrity tag stands in for authentication
    fn find_session(&self, session_id: SessionId) -> Option<Arc<dyn Session>>;

    /// Close a session and release its channels. A retried Bye carries
    /// the same `request_id` and must stay idempotent.
    async fn close_session(
        &self,
        session_id: SessionId,
        request_id: &str,
    ) -> Result<(), SessionError>;
}
