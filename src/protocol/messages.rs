//! Wire message types
//!
//! All messages are JSON objects with PascalCase member names, selected by
//! the request-code byte that precedes them. Session keys travel as opaque
//! base64 strings; the host never interprets them.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Session error codes carried in every session-level response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionErrorCode {
    /// No error
    Ok,
    /// Unclassified server-side failure
    GeneralError,
    /// Session no longer exists or the key did not match
    SessionClosed,
    /// Session was suppressed by another session on the same token
    SessionSuppressed,
    /// Access token has expired
    AccessExpired,
    /// Access token traffic quota exhausted
    AccessTrafficOverflow,
    /// Server is in maintenance mode
    Maintenance,
    /// Client must reconnect to another host
    RedirectHost,
    /// Client protocol version is too old
    UnsupportedClient,
}

/// Session suppression disposition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuppressType {
    /// Not suppressed
    #[default]
    None,
    /// Suppressed by another session of the same client
    YourSelf,
    /// Suppressed by a session of a different client
    Other,
}

/// Access usage snapshot published to the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessUsage {
    /// Bytes sent through the session's token so far
    pub sent_traffic: u64,
    /// Bytes received through the session's token so far
    pub received_traffic: u64,
    /// Traffic quota in bytes; zero means unlimited
    pub max_traffic: u64,
    /// Number of sessions currently active on the token
    pub active_session_count: u32,
}

/// An inclusive IP address range used by capture and tunnel filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpRange {
    /// First address of the range
    pub first_ip_address: IpAddr,
    /// Last address of the range
    pub last_ip_address: IpAddr,
}

impl IpRange {
    /// Create a range covering `first..=last`
    #[must_use]
    pub const fn new(first: IpAddr, last: IpAddr) -> Self {
        Self {
            first_ip_address: first,
            last_ip_address: last,
        }
    }

    /// The full IPv4 range
    #[must_use]
    pub fn all_ipv4() -> Self {
        Self::new(
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(std::net::Ipv4Addr::BROADCAST),
        )
    }
}

/// Fields common to every non-Hello request
///
/// `session_key` authenticates the request to an existing session;
/// `request_id` lets the session layer deduplicate retried requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestBase {
    /// Target session id
    pub session_id: u64,
    /// Opaque key proving ownership of the session
    pub session_key: String,
    /// Client-chosen idempotency id
    #[serde(default)]
    pub request_id: String,
}

/// Client identity reported during Hello
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientInfo {
    /// Stable client installation id
    pub client_id: String,
    /// Client protocol version; must be at least 2
    pub protocol_version: u32,
    /// Client software version
    pub client_version: String,
    /// Client user agent
    pub user_agent: String,
}

/// Session creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HelloRequest {
    /// Access token id
    pub token_id: String,
    /// Client identity
    pub client_info: ClientInfo,
    /// Whether the client wants a UDP channel
    #[serde(default)]
    pub use_udp_channel: bool,
    /// Current UDP key derivation: the session key is the UDP key
    #[serde(default)]
    pub use_udp_channel2: bool,
    /// Client-chosen idempotency id; older clients omit it
    #[serde(default)]
    pub request_id: String,
}

/// Base of every session-level response; also the structured error reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionResponseBase {
    /// Result of the request
    pub error_code: SessionErrorCode,
    /// Human-readable diagnostic, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Usage snapshot, when the session is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_usage: Option<AccessUsage>,
    /// Who suppressed this session, if anyone
    #[serde(default)]
    pub suppressed_by: SuppressType,
    /// Host the client should reconnect to on `RedirectHost`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_host_end_point: Option<SocketAddr>,
}

impl SessionResponseBase {
    /// A plain `Ok` response
    #[must_use]
    pub fn ok() -> Self {
        Self {
            error_code: SessionErrorCode::Ok,
            error_message: None,
            access_usage: None,
            suppressed_by: SuppressType::None,
            redirect_host_end_point: None,
        }
    }

    /// An error response with a diagnostic message
    pub fn error(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            access_usage: None,
            suppressed_by: SuppressType::None,
            redirect_host_end_point: None,
        }
    }
}

/// Reply to a successful Hello
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HelloResponse {
    /// Result and diagnostics
    #[serde(flatten)]
    pub base: SessionResponseBase,
    /// Assigned session id
    pub session_id: u64,
    /// Opaque key for authenticating subsequent requests
    pub session_key: String,
    /// Server secret shared with the session's crypto layer
    pub server_secret: String,
    /// Effective TCP endpoints the client should use
    pub tcp_end_points: Vec<SocketAddr>,
    /// Effective UDP endpoints the client should use
    pub udp_end_points: Vec<SocketAddr>,
    /// Key for the session's UDP channel, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_key: Option<String>,
    /// UDP port the session's channel listens on; zero when absent
    pub udp_port: u16,
    /// Server software version
    pub server_version: String,
    /// Server protocol version; always [`super::SERVER_PROTOCOL_VERSION`]
    pub server_protocol_version: u32,
    /// Whether an older session of this client was suppressed
    pub suppressed_to: SuppressType,
    /// Usage snapshot at session creation
    pub access_usage: AccessUsage,
    /// Maximum number of TCP datagram channels per session
    pub max_datagram_channel_count: u32,
    /// The client's address as observed by the server
    pub client_public_address: IpAddr,
    /// Ranges the client should tunnel
    pub include_ip_ranges: Vec<IpRange>,
    /// Ranges the client must not tunnel
    pub exclude_ip_ranges: Vec<IpRange>,
    /// Ranges the client's packet capture should include
    pub packet_capture_include_ip_ranges: Vec<IpRange>,
    /// Ranges the client's packet capture should exclude
    pub packet_capture_exclude_ip_ranges: Vec<IpRange>,
    /// Whether the server tunnels IPv6
    pub is_ip_v6_supported: bool,
}

/// Request to adopt the stream as a datagram channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpDatagramChannelRequest {
    /// Session authentication
    #[serde(flatten)]
    pub base: RequestBase,
}

/// Request to splice the stream with an outbound connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpProxyChannelRequest {
    /// Session authentication
    #[serde(flatten)]
    pub base: RequestBase,
    /// Destination the server should connect to
    pub destination_end_point: SocketAddr,
    /// Original host name, when the client resolved the destination itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_host_name: Option<String>,
}

/// Request to enable the session's UDP channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UdpChannelRequest {
    /// Session authentication
    #[serde(flatten)]
    pub base: RequestBase,
}

/// Reply to a UDP channel request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UdpChannelSessionResponse {
    /// Result and diagnostics
    #[serde(flatten)]
    pub base: SessionResponseBase,
    /// Key for the session's UDP channel
    pub udp_key: String,
    /// UDP port the channel listens on
    pub udp_port: u16,
}
