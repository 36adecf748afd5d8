//! Connection host
//!
//! The [`ConnectionHost`] owns the listen surface: it binds the UDP
//! transmitters and TCP listeners, runs one accept loop per TCP listener,
//! and drives the per-connection request pipeline. Session state lives
//! behind the [`SessionManager`] it was constructed with; TLS material
//! behind the [`TlsService`].
//!
//! # Lifecycle
//!
//! ```text
//! new() -> start(tcp, udp) -> [accept loops, transmitters] -> stop()
//!                 ^                                             |
//!                 +------------- restart allowed --------------+
//!                          dispose() ends the cycle
//! ```
//!
//! `start` requires at least one TCP endpoint and unwinds partially bound
//! sockets on failure. `stop` cancels the host token, disposes every
//! transmitter and listener, awaits the accept loops, and clears the TLS
//! cache; it is idempotent and safe under concurrent callers. A disposed
//! host never starts again.

mod handlers;
mod pipeline;

pub use pipeline::ACCEPT_ERROR_BUDGET;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{HostConfig, NetFilterConfig};
use crate::error::{HostError, VpnHostError};
use crate::session::SessionManager;
use crate::tls::TlsService;
use crate::udp::UdpChannelTransmitter;

/// Length of a generated server secret in raw bytes
const SERVER_SECRET_LEN: usize = 16;

/// Host state guarded by one lock; membership sets have their own
struct HostState {
    is_started: bool,
    is_disposed: bool,
    /// Replaced on each start so a restart gets a fresh token
    cancel: CancellationToken,
}

/// The server-side connection host
pub struct ConnectionHost {
    config: HostConfig,
    server_secret: String,
    tls: Arc<TlsService>,
    session_manager: Arc<dyn SessionManager>,

    state: Mutex<HostState>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    transmitters: Mutex<Vec<Arc<UdpChannelTransmitter>>>,
    tcp_endpoints: Mutex<Vec<SocketAddr>>,
    udp_endpoints: Mutex<Vec<SocketAddr>>,

    stats: HostStats,
}

impl ConnectionHost {
    /// Create a host over a session manager and TLS service
    pub fn new(
        config: HostConfig,
        tls: Arc<TlsService>,
        session_manager: Arc<dyn SessionManager>,
    ) -> Arc<Self> {
        let server_secret = config
            .server_secret
            .clone()
            .unwrap_or_else(generate_server_secret);

        Arc::new(Self {
            config,
            server_secret,
            tls,
            session_manager,
            state: Mutex::new(HostState {
                is_started: false,
                is_disposed: false,
                cancel: CancellationToken::new(),
            }),
            accept_tasks: Mutex::new(Vec::new()),
            transmitters: Mutex::new(Vec::new()),
            tcp_endpoints: Mutex::new(Vec::new()),
            udp_endpoints: Mutex::new(Vec::new()),
            stats: HostStats::default(),
        })
    }

    /// Bind the listen surface and spawn the accept loops.
    ///
    /// UDP sockets bind first so their resolved endpoints are published
    /// before the first Hello can ask for them. Failure at any step
    /// unwinds every partially bound socket and leaves the host stopped.
    pub async fn start(
        self: &Arc<Self>,
        tcp_endpoints: &[SocketAddr],
        udp_endpoints: &[SocketAddr],
    ) -> Result<(), VpnHostError> {
        let cancel = {
            let mut state = self.state.lock();
            if state.is_disposed {
                return Err(HostError::Disposed.into());
            }
            if state.is_started {
                return Err(HostError::AlreadyStarted.into());
            }
            if tcp_endpoints.is_empty() {
                return Err(HostError::NoTcpEndPoint.into());
            }
            state.is_started = true;
            state.cancel = CancellationToken::new();
            state.cancel.clone()
        };

        if let Err(e) = self.bind_all(tcp_endpoints, udp_endpoints, &cancel).await {
            self.state.lock().is_started = false;
            cancel.cancel();
            self.shutdown_resources().await;
            return Err(e);
        }

        info!(
            tcp = ?self.tcp_endpoints(),
            udp = ?self.udp_endpoints(),
            "Connection host started"
        );
        Ok(())
    }

    async fn bind_all(
        self: &Arc<Self>,
        tcp_endpoints: &[SocketAddr],
        udp_endpoints: &[SocketAddr],
        cancel: &CancellationToken,
    ) -> Result<(), VpnHostError> {
        for &endpoint in udp_endpoints {
            let transmitter = UdpChannelTransmitter::bind(
                endpoint,
                Arc::clone(&self.session_manager),
                cancel,
            )
            .await?;
            self.udp_endpoints.lock().push(transmitter.local_addr());
            self.transmitters.lock().push(transmitter);
        }

        let mut listeners = Vec::with_capacity(tcp_endpoints.len());
        for &endpoint in tcp_endpoints {
            let listener = TcpListener::bind(endpoint)
                .await
                .map_err(|e| HostError::bind_failed(endpoint, e.to_string()))?;
            let local = listener.local_addr().map_err(HostError::Io)?;
            self.tcp_endpoints.lock().push(local);
            listeners.push((listener, local));
        }

        for (listener, local) in listeners {
            let host = Arc::clone(self);
            let token = cancel.clone();
            let handle = tokio::spawn(pipeline::accept_loop(host, listener, local, token));
            self.accept_tasks.lock().push(handle);
        }

        Ok(())
    }

    /// Stop the host: cancel in-flight work, dispose every transmitter
    /// and listener, await the accept loops, clear the TLS cache.
    ///
    /// Safe to call multiple times and concurrently with `dispose`.
    pub async fn stop(&self) {
        let cancel = {
            let mut state = self.state.lock();
            if !state.is_started {
                return;
            }
            state.is_started = false;
            state.cancel.clone()
        };

        cancel.cancel();
        self.shutdown_resources().await;
        info!("Connection host stopped");
    }

    async fn shutdown_resources(&self) {
        let transmitters: Vec<_> = self.transmitters.lock().drain(..).collect();
        for transmitter in &transmitters {
            transmitter.dispose().await;
        }

        let tasks: Vec<_> = self.accept_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.tcp_endpoints.lock().clear();
        self.udp_endpoints.lock().clear();
        self.tls.clear_cache();
    }

    /// Stop and permanently retire the host. Idempotent.
    pub async fn dispose(&self) {
        self.state.lock().is_disposed = true;
        self.stop().await;
    }

    /// Whether the host is currently started
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().is_started
    }

    /// Whether the host has been disposed
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().is_disposed
    }

    /// Effective TCP endpoints, with OS-resolved ports
    #[must_use]
    pub fn tcp_endpoints(&self) -> Vec<SocketAddr> {
        self.tcp_endpoints.lock().clone()
    }

    /// Effective UDP endpoints, with OS-resolved ports
    #[must_use]
    pub fn udp_endpoints(&self) -> Vec<SocketAddr> {
        self.udp_endpoints.lock().clone()
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> HostStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn session_manager(&self) -> &Arc<dyn SessionManager> {
        &self.session_manager
    }

    pub(crate) fn tls_service(&self) -> &TlsService {
        &self.tls
    }

    pub(crate) fn config(&self) -> &HostConfig {
        &self.config
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    pub(crate) fn server_secret(&self) -> &str {
        &self.server_secret
    }

    pub(crate) fn net_filter(&self) -> &NetFilterConfig {
        &self.config.net_filter
    }

    pub(crate) fn max_datagram_channel_count(&self) -> u32 {
        self.config.max_datagram_channel_count
    }

    pub(crate) fn stats_ref(&self) -> &HostStats {
        &self.stats
    }
}

fn generate_server_secret() -> String {
    let mut secret = [0u8; SERVER_SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    BASE64.encode(secret)
}

/// Host counters
#[derive(Debug, Default)]
pub struct HostStats {
    pub(crate) connections_accepted: AtomicU64,
    pub(crate) tls_handshake_failures: AtomicU64,
    pub(crate) requests_succeeded: AtomicU64,
    pub(crate) session_error_replies: AtomicU64,
    pub(crate) anonymous_replies: AtomicU64,
    pub(crate) streams_reused: AtomicU64,
}

impl HostStats {
    pub(crate) fn snapshot(&self) -> HostStatsSnapshot {
        HostStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            tls_handshake_failures: self.tls_handshake_failures.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            session_error_replies: self.session_error_replies.load(Ordering::Relaxed),
            anonymous_replies: self.anonymous_replies.load(Ordering::Relaxed),
            streams_reused: self.streams_reused.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the host counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatsSnapshot {
    /// TCP connections accepted across all listeners
    pub connections_accepted: u64,
    /// Connections dropped during the TLS handshake
    pub tls_handshake_failures: u64,
    /// Requests answered with a success response or channel handoff
    pub requests_succeeded: u64,
    /// Structured session-error replies written
    pub session_error_replies: u64,
    /// Anonymous 401 replies written
    pub anonymous_replies: u64,
    /// Exchanges served on a reused chunked stream
    pub streams_reused: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_is_base64() {
        let secret = generate_server_secret();
        let decoded = BASE64.decode(&secret).unwrap();
        assert_eq!(decoded.len(), SERVER_SECRET_LEN);
    }

    #[test]
    fn test_stats_snapshot_default() {
        let stats = HostStats::default();
        assert_eq!(stats.snapshot(), HostStatsSnapshot::default());
    }
}
