//! vpn-host: VPN server connection host and session protocol core
//!
//! This crate implements the server side of a VPN tunnelling system's
//! control plane: it accepts TLS connections, negotiates one of two
//! transport framings, processes the session request protocol, and
//! demultiplexes session-scoped UDP datagrams. Session state itself lives
//! behind the [`session::SessionManager`] trait supplied by the embedding
//! application.
//!
//! # Architecture
//!
//! ```text
//! TCP accept → TLS handshake → transport sniff → ClientStream
//!                  |                                  |
//!                  v                                  v
//!            TlsService                      request code byte
//!       (cert per bind endpoint)                      |
//!                                                     v
//!                              Hello / TcpDatagramChannel / TcpProxyChannel
//!                                       / UdpChannel / Bye
//!                                                     |
//!                                                     v
//!                                              SessionManager
//!
//! UDP datagram → UdpChannelTransmitter → session id demux → Session
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error hierarchy
//! - [`host`]: Connection host, accept loops, request handlers
//! - [`protocol`]: Request codes, wire messages, framing, error replies
//! - [`session`]: Session layer interface (implemented externally)
//! - [`stream`]: Client stream variants (raw, HTTP-chunked reusable)
//! - [`tls`]: Certificate selection and TLS accept service
//! - [`udp`]: UDP channel transmitter and datagram envelope

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod tls;
pub mod udp;

// Re-export commonly used types at the crate root
pub use config::{AppConfig, HostConfig, NetFilterConfig};
pub use error::{
    ConfigError, HostError, ProtocolError, StreamError, TlsError, UdpError, VpnHostError,
};
pub use host::{ConnectionHost, HostStatsSnapshot, ACCEPT_ERROR_BUDGET};
pub use protocol::{
    HelloRequest, HelloResponse, RequestCode, SessionErrorCode, SessionResponseBase,
    SERVER_PROTOCOL_VERSION,
};
pub use session::{Session, SessionError, SessionId, SessionInfo, SessionManager};
pub use stream::{ChunkedClientStream, ClientStream, EndpointPair, RawClientStream};
pub use tls::{CertificateProvider, PemFileCertProvider, StaticCertProvider, TlsService};
pub use udp::{UdpChannelTransmitter, UdpPacketHeader, UDP_HEADER_SIZE};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
