//! Session request/response wire protocol
//!
//! This module defines the control protocol spoken on every tunnel
//! connection after TLS: one request-code byte followed by a
//! length-prefixed JSON body, answered with a length-prefixed JSON
//! response.
//!
//! # Wire Format
//!
//! ```text
//! +-----------+----------------+------------------+
//! | code (1B) | length (4B LE) | UTF-8 JSON body  |
//! +-----------+----------------+------------------+
//! ```
//!
//! Responses omit the code byte and carry only the length-prefixed JSON.
//! Request codes are stable across protocol versions once assigned.
//!
//! # Error Replies
//!
//! Failures split into two classes:
//!
//! - **Session errors** (the client authenticated enough to deserve a
//!   structured reply): a serialized [`SessionResponseBase`].
//! - **Everything else**: the fixed anonymous 401 reply from
//!   [`anonymous_reply`], which makes the server indistinguishable from a
//!   generic HTTPS endpoint.

mod framing;
mod messages;

pub use framing::{
    encode_message, read_message, write_message, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use messages::{
    AccessUsage, ClientInfo, HelloRequest, HelloResponse, IpRange, RequestBase, SessionErrorCode,
    SessionResponseBase, SuppressType, TcpDatagramChannelRequest, TcpProxyChannelRequest,
    UdpChannelRequest, UdpChannelSessionResponse,
};

use chrono::Utc;

use crate::error::ProtocolError;

/// Protocol version constant sent in every `HelloResponse`
pub const SERVER_PROTOCOL_VERSION: u32 = 3;

/// Minimum client protocol version the server accepts
pub const MIN_CLIENT_PROTOCOL_VERSION: u32 = 2;

/// Raw transport version byte sent by legacy-framing clients after TLS
pub const RAW_TRANSPORT_VERSION: u8 = 0x01;

/// Sentinel first byte of the HTTP-chunked transport (`'P'` of the request line)
pub const CHUNKED_TRANSPORT_SENTINEL: u8 = 0x50;

/// Request codes
///
/// Each code is a single byte on the wire. Values are frozen; new codes
/// must pick a previously unused byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestCode {
    /// Session creation handshake
    Hello = 0x01,
    /// Adopt the stream as a long-lived datagram channel
    TcpDatagramChannel = 0x02,
    /// Splice the stream with an outbound TCP connection
    TcpProxyChannel = 0x03,
    /// Enable the session's UDP channel
    UdpChannel = 0x04,
    /// Close the session
    Bye = 0x05,
}

impl RequestCode {
    /// Byte value of this code
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RequestCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::TcpDatagramChannel),
            0x03 => Ok(Self::TcpProxyChannel),
            0x04 => Ok(Self::UdpChannel),
            0x05 => Ok(Self::Bye),
            other => Err(ProtocolError::UnknownRequestCode(other)),
        }
    }
}

/// Build the fixed anonymous 401 reply.
///
/// Sent verbatim on any failure that must not disclose what this server
/// is: unknown request codes, malformed framing, unauthenticated clients.
/// The banner mimics a stock Kestrel deployment so scanners see a generic
/// HTTPS endpoint; only the `Date` header varies.
#[must_use]
pub fn anonymous_reply() -> Vec<u8> {
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    format!(
        "HTTP/1.1 401 Unauthorized\r\n\
         Content-Length: 0\r\n\
         Date: {date}\r\n\
         Server: Kestrel\r\n\
         WWW-Authenticate: Bearer\r\n"
    )
    .into_bytes()
}
