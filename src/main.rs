//! vpn-host: VPN server connection host
//!
//! This is the main entry point for the production host.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./vpn-host
//!
//! # Run with custom configuration
//! ./vpn-host -c /path/to/config.json
//!
//! # Run with environment overrides
//! VPN_HOST_LOG_LEVEL=debug ./vpn-host
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vpn_host::config::{load_config_with_env, AppConfig};
use vpn_host::host::ConnectionHost;
use vpn_host::session::{Session, SessionError, SessionId, SessionInfo, SessionManager};
use vpn_host::tls::{PemFileCertProvider, TlsService};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/vpn-host/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("vpn-host v{}", vpn_host::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"vpn-host v{}

VPN server connection host and session protocol core.

USAGE:
    vpn-host [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/vpn-host/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    VPN_HOST_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    VPN_HOST_CERT_FILE      Override certificate file path
    VPN_HOST_KEY_FILE       Override private key file path
    VPN_HOST_LISTEN_TCP     Override TCP endpoints (comma-separated)
    VPN_HOST_LISTEN_UDP     Override UDP endpoints (comma-separated)
"#,
        vpn_host::VERSION
    );
}

fn init_logging() {
    let filter = std::env::var("VPN_HOST_LOG_LEVEL")
        .map_or_else(
            |_| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            EnvFilter::new,
        );

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let config = AppConfig::generate_default();
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_logging();

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        println!("Configuration OK: {}", args.config_path.display());
        return Ok(());
    }

    info!(version = vpn_host::VERSION, "Starting vpn-host");

    let provider = Arc::new(PemFileCertProvider::new(
        &config.certificate_file,
        &config.private_key_file,
    ));
    let tls = Arc::new(TlsService::new(provider));

    // The embedding deployment supplies the real session manager; the
    // standalone binary runs with one that rejects every session so the
    // listen surface can be exercised end to end.
    let session_manager: Arc<dyn SessionManager> = Arc::new(RejectingSessionManager);

    let host = ConnectionHost::new(config.host.clone(), tls, session_manager);
    host.start(&config.listen_tcp, &config.listen_udp)
        .await
        .context("starting connection host")?;

    wait_for_shutdown().await;

    info!("Shutdown signal received");
    host.dispose().await;

    let stats = host.stats();
    info!(
        accepted = stats.connections_accepted,
        served = stats.requests_succeeded,
        rejected = stats.anonymous_replies,
        "Final counters"
    );
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            result = ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
            }
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
    }
}

/// Session manager that refuses every request.
///
/// Stands in when vpn-host runs without an embedding session layer:
/// clients get well-formed error replies and the anonymity behaviour is
/// preserved, but no tunnel is ever established.
struct RejectingSessionManager;

#[async_trait::async_trait]
impl SessionManager for RejectingSessionManager {
    async fn create_session(
        &self,
        _request: &vpn_host::protocol::HelloRequest,
        _endpoints: vpn_host::stream::EndpointPair,
    ) -> std::result::Result<SessionInfo, SessionError> {
        Err(SessionError::new(
            vpn_host::protocol::SessionErrorCode::Maintenance,
            "no session layer attached",
        ))
    }

    async fn get_session(
        &self,
        _session_id: SessionId,
        _session_key: &str,
        _request_id: &str,
        _endpoints: vpn_host::stream::EndpointPair,
    ) -> std::result::Result<Arc<dyn Session>, SessionError> {
        Err(SessionError::new(
            vpn_host::protocol::SessionErrorCode::SessionClosed,
            "no session layer attached",
        ))
    }

    fn find_session(&self, _session_id: SessionId) -> Option<Arc<dyn Session>> {
        None
    }

    async fn close_session(
        &self,
        _session_id: SessionId,
        _request_id: &str,
    ) -> std::result::Result<(), SessionError> {
        Ok(())
    }
}
