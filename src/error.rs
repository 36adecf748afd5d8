//! Error types for vpn-host
//!
//! This module defines the error hierarchy for the connection host core.
//! All errors are categorized by subsystem and include recovery hints used
//! by the accept loop's error budget.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for vpn-host
#[derive(Debug, Error)]
pub enum VpnHostError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection host lifecycle and accept errors
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// TLS certificate and handshake errors
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Wire protocol errors (framing, codes, JSON shape)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Client stream errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// UDP transmitter errors
    #[error("UDP error: {0}")]
    Udp(#[from] UdpError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VpnHostError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Host(e) => e.is_recoverable(),
            Self::Tls(e) => e.is_recoverable(),
            Self::Protocol(e) => e.is_recoverable(),
            Self::Stream(e) => e.is_recoverable(),
            Self::Udp(e) => e.is_recoverable(),
            Self::Io(e) => is_recoverable_io(e),
        }
    }
}

/// Shared I/O recoverability classification
fn is_recoverable_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Connection host lifecycle and accept-loop errors
#[derive(Debug, Error)]
pub enum HostError {
    /// Start called without any TCP endpoint
    #[error("No TcpEndPoint specified")]
    NoTcpEndPoint,

    /// Start called while the host is already running
    #[error("Host is already started")]
    AlreadyStarted,

    /// Operation on a disposed host
    #[error("Host has been disposed")]
    Disposed,

    /// Failed to bind a listener or transmitter
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// The address that failed to bind
        addr: SocketAddr,
        /// The reason for failure
        reason: String,
    },

    /// Failed to accept a connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Consecutive accept errors exceeded the error budget
    #[error("Accept error budget exceeded on {addr} after {count} consecutive errors")]
    ErrorBudgetExceeded {
        /// Listener local address
        addr: SocketAddr,
        /// Number of consecutive errors observed
        count: u32,
    },

    /// Request exchange exceeded its timeout window
    #[error("Request timed out")]
    RequestTimeout,

    /// Host is shutting down
    #[error("Host is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("Host I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HostError {
    /// Create a bind failed error
    pub fn bind_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Create an accept error
    pub fn accept(msg: impl Into<String>) -> Self {
        Self::AcceptError(msg.into())
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoTcpEndPoint
            | Self::AlreadyStarted
            | Self::Disposed
            | Self::BindFailed { .. }
            | Self::ErrorBudgetExceeded { .. } => false,
            Self::AcceptError(_) | Self::RequestTimeout | Self::ShuttingDown => true,
            Self::Io(e) => is_recoverable_io(e),
        }
    }
}

/// TLS certificate and handshake errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load certificate
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad {
        /// Path to the certificate file
        path: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to load private key
    #[error("Failed to load private key from {path}: {reason}")]
    PrivateKeyLoad {
        /// Path to the key file
        path: String,
        /// The reason for failure
        reason: String,
    },

    /// No certificate configured for a bind endpoint
    #[error("No certificate configured for {endpoint}")]
    NoCertificate {
        /// Local bind endpoint the lookup was keyed by
        endpoint: SocketAddr,
    },

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// TLS handshake failed
    #[error("TLS handshake failed (cancelled={cancelled}): {reason}")]
    Handshake {
        /// The reason for failure
        reason: String,
        /// Whether cancellation caused the failure
        cancelled: bool,
    },
}

impl TlsError {
    /// Create a certificate load error
    pub fn certificate_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a private key load error
    pub fn private_key_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PrivateKeyLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a handshake error
    pub fn handshake(reason: impl Into<String>, cancelled: bool) -> Self {
        Self::Handshake {
            reason: reason.into(),
            cancelled,
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::CertificateLoad { .. }
            | Self::PrivateKeyLoad { .. }
            | Self::NoCertificate { .. }
            | Self::Config(_) => false,
            // A failed handshake only affects one connection
            Self::Handshake { .. } => true,
        }
    }
}

/// Wire protocol errors (framing, request codes, JSON shape)
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared message length exceeds the configured ceiling
    #[error("Message too large: {len} bytes (max {max})")]
    MessageTooLarge {
        /// Declared length
        len: usize,
        /// Configured ceiling
        max: usize,
    },

    /// Unknown request code byte
    #[error("Unknown request code: 0x{0:02x}")]
    UnknownRequestCode(u8),

    /// Unsupported transport version byte after TLS
    #[error("Unsupported transport version: 0x{0:02x}")]
    UnsupportedTransport(u8),

    /// Message body is not well-formed JSON of the expected shape
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Peer closed the connection mid-frame
    #[error("Connection closed mid-frame")]
    UnexpectedEof,

    /// I/O error while reading or writing a frame
    #[error("Protocol I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::MessageTooLarge { .. }
            | Self::UnknownRequestCode(_)
            | Self::UnsupportedTransport(_)
            | Self::Malformed(_) => false,
            Self::UnexpectedEof => true,
            Self::Io(e) => is_recoverable_io(e),
        }
    }

    /// True when the peer simply went away (benign close)
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::UnexpectedEof => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Client stream errors
#[derive(Debug, Error)]
pub enum StreamError {
    /// Invalid HTTP request head on the chunked transport
    #[error("Invalid HTTP request head: {0}")]
    InvalidRequestHead(String),

    /// Invalid chunk framing on the chunked transport
    #[error("Invalid chunk framing: {0}")]
    InvalidChunk(String),

    /// Stream was disposed and cannot be used
    #[error("Stream disposed")]
    Disposed,

    /// I/O error on the underlying transport
    #[error("Stream I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// Create an invalid request head error
    pub fn invalid_head(msg: impl Into<String>) -> Self {
        Self::InvalidRequestHead(msg.into())
    }

    /// Create an invalid chunk error
    pub fn invalid_chunk(msg: impl Into<String>) -> Self {
        Self::InvalidChunk(msg.into())
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidRequestHead(_) | Self::InvalidChunk(_) | Self::Disposed => false,
            Self::Io(e) => is_recoverable_io(e),
        }
    }
}

/// Convert stream errors into I/O errors for use inside AsyncRead/AsyncWrite
impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(io_err) => io_err,
            StreamError::InvalidRequestHead(_) | StreamError::InvalidChunk(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e.to_string())
            }
            StreamError::Disposed => io::Error::new(io::ErrorKind::NotConnected, e.to_string()),
        }
    }
}

/// UDP transmitter errors
#[derive(Debug, Error)]
pub enum UdpError {
    /// Failed to bind the socket
    #[error("Failed to bind UDP socket to {addr}: {reason}")]
    BindFailed {
        /// The address that failed to bind
        addr: SocketAddr,
        /// The reason for failure
        reason: String,
    },

    /// Datagram shorter than the envelope header
    #[error("Datagram too short: {len} bytes")]
    DatagramTooShort {
        /// Received datagram length
        len: usize,
    },

    /// Integrity pre-check failed
    #[error("Datagram failed integrity pre-check")]
    IntegrityCheckFailed,

    /// Transmitter is disposed
    #[error("Transmitter disposed")]
    Disposed,

    /// I/O error
    #[error("UDP I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UdpError {
    /// Create a bind failed error
    pub fn bind_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindFailed { .. } | Self::Disposed => false,
            Self::DatagramTooShort { .. } | Self::IntegrityCheckFailed => true,
            Self::Io(e) => is_recoverable_io(e),
        }
    }
}
