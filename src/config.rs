//! Configuration types and loading
//!
//! Configuration is a JSON file deserialized into [`AppConfig`], with a
//! small set of `VPN_HOST_*` environment overrides applied on top. Every
//! field has a default so a minimal file only names the certificate pair.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{IpRange, MAX_MESSAGE_SIZE};

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// TCP bind endpoints; at least one is required to start
    #[serde(default = "default_listen_tcp")]
    pub listen_tcp: Vec<SocketAddr>,

    /// UDP bind endpoints; port 0 lets the OS pick
    #[serde(default)]
    pub listen_udp: Vec<SocketAddr>,

    /// Default certificate chain (PEM)
    pub certificate_file: String,

    /// Default private key (PEM)
    pub private_key_file: String,

    /// Connection host tuning
    #[serde(default)]
    pub host: HostConfig,
}

/// Connection host tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Per-request exchange timeout in seconds.
    /// A reused stream gets a fresh window per exchange.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Ceiling for one framed protocol message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Consecutive accept failures tolerated per listener before the
    /// host stops itself
    #[serde(default = "default_accept_error_budget")]
    pub accept_error_budget: u32,

    /// Server secret shared with session crypto (base64).
    /// Generated at host construction when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_secret: Option<String>,

    /// Maximum TCP datagram channels advertised per session
    #[serde(default = "default_max_datagram_channels")]
    pub max_datagram_channel_count: u32,

    /// Tunnel and packet-capture address filters
    #[serde(default)]
    pub net_filter: NetFilterConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_message_size: default_max_message_size(),
            accept_error_budget: default_accept_error_budget(),
            server_secret: None,
            max_datagram_channel_count: default_max_datagram_channels(),
            net_filter: NetFilterConfig::default(),
        }
    }
}

impl HostConfig {
    /// Per-request timeout as a [`Duration`]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Address filters published to clients in the Hello response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetFilterConfig {
    /// Ranges the client should tunnel
    #[serde(default = "default_all_ipv4")]
    pub include_ip_ranges: Vec<IpRange>,

    /// Ranges the client must not tunnel
    #[serde(default)]
    pub exclude_ip_ranges: Vec<IpRange>,

    /// Ranges the client's packet capture should include
    #[serde(default = "default_all_ipv4")]
    pub packet_capture_include_ip_ranges: Vec<IpRange>,

    /// Ranges the client's packet capture should exclude
    #[serde(default)]
    pub packet_capture_exclude_ip_ranges: Vec<IpRange>,

    /// Whether the server tunnels IPv6
    #[serde(default)]
    pub is_ip_v6_supported: bool,
}

impl Default for NetFilterConfig {
    fn default() -> Self {
        Self {
            include_ip_ranges: default_all_ipv4(),
            exclude_ip_ranges: Vec::new(),
            packet_capture_include_ip_ranges: default_all_ipv4(),
            packet_capture_exclude_ip_ranges: Vec::new(),
            is_ip_v6_supported: false,
        }
    }
}

fn default_listen_tcp() -> Vec<SocketAddr> {
    vec!["0.0.0.0:443".parse().expect("static address")]
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_accept_error_budget() -> u32 {
    crate::host::ACCEPT_ERROR_BUDGET
}

fn default_max_datagram_channels() -> u32 {
    8
}

fn default_all_ipv4() -> Vec<IpRange> {
    vec![IpRange::all_ipv4()]
}

impl AppConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_tcp.is_empty() {
            return Err(ConfigError::validation("listen_tcp must not be empty"));
        }
        if self.certificate_file.is_empty() {
            return Err(ConfigError::validation("certificate_file is required"));
        }
        if self.private_key_file.is_empty() {
            return Err(ConfigError::validation("private_key_file is required"));
        }
        if self.host.request_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "request_timeout_secs must be positive",
            ));
        }
        Ok(())
    }

    /// A default configuration suitable for `--generate-config`
    #[must_use]
    pub fn generate_default() -> Self {
        Self {
            listen_tcp: default_listen_tcp(),
            listen_udp: Vec::new(),
            certificate_file: "/etc/vpn-host/certificate.pem".into(),
            private_key_file: "/etc/vpn-host/private-key.pem".into(),
            host: HostConfig::default(),
        }
    }
}

/// Load configuration from a JSON file
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig =
        serde_json::from_str(&contents).map_err(|e| ConfigError::parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration and apply `VPN_HOST_*` environment overrides
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let mut config = load_config(path)?;

    if let Some(value) = read_env("VPN_HOST_CERT_FILE")? {
        config.certificate_file = value;
    }
    if let Some(value) = read_env("VPN_HOST_KEY_FILE")? {
        config.private_key_file = value;
    }
    if let Some(value) = read_env("VPN_HOST_LISTEN_TCP")? {
        config.listen_tcp = parse_endpoint_list("VPN_HOST_LISTEN_TCP", &value)?;
    }
    if let Some(value) = read_env("VPN_HOST_LISTEN_UDP")? {
        config.listen_udp = parse_endpoint_list("VPN_HOST_LISTEN_UDP", &value)?;
    }

    config.validate()?;
    Ok(config)
}

fn read_env(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::EnvError {
            name: name.into(),
            reason: e.to_string(),
        }),
    }
}

fn parse_endpoint_list(name: &str, value: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::EnvError {
                name: name.into(),
                reason: format!("invalid endpoint {s:?}"),
            })
        })
        .collect()
}
