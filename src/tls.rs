//! TLS acceptor service
//!
//! Certificates are selected by the *local* bind endpoint: a host bound to
//! several addresses may present a distinct certificate on each. The
//! service caches one acceptor per endpoint and drops the cache when the
//! host stops, releasing keys.
//!
//! The handshake never requests a client certificate and never checks
//! revocation; a failed handshake is classified as [`TlsError::Handshake`]
//! so the caller can distinguish it from plain I/O failures.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TlsError;

/// Source of server certificates, keyed by local bind endpoint
pub trait CertificateProvider: Send + Sync {
    /// Build the TLS server configuration for a bind endpoint
    fn server_config(&self, endpoint: SocketAddr) -> Result<ServerConfig, TlsError>;
}

/// TLS acceptor service with a per-endpoint acceptor cache
pub struct TlsService {
    provider: Arc<dyn CertificateProvider>,
    cache: Mutex<HashMap<SocketAddr, TlsAcceptor>>,
}

impl TlsService {
    /// Create a service over a certificate provider
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        install_crypto_provider();
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Perform the server-side handshake on an accepted socket.
    ///
    /// The certificate is looked up by `local`, the bind endpoint the
    /// connection arrived on. Cancellation mid-handshake is reported in
    /// the error so the caller can log it as benign.
    pub async fn accept(
        &self,
        socket: TcpStream,
        local: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let acceptor = self.acceptor_for(local)?;

        tokio::select! {
            result = acceptor.accept(socket) => {
                result.map_err(|e| TlsError::handshake(e.to_string(), false))
            }
            () = cancel.cancelled() => {
                Err(TlsError::handshake("host stopping", true))
            }
        }
    }

    /// Drop every cached acceptor, releasing certificate keys
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        if !cache.is_empty() {
            debug!(entries = cache.len(), "Clearing TLS acceptor cache");
            cache.clear();
        }
    }

    fn acceptor_for(&self, endpoint: SocketAddr) -> Result<TlsAcceptor, TlsError> {
        if let Some(acceptor) = self.cache.lock().get(&endpoint) {
            return Ok(acceptor.clone());
        }

        let config = self.provider.server_config(endpoint)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        self.cache.lock().insert(endpoint, acceptor.clone());
        trace!(endpoint = %endpoint, "Built TLS acceptor");
        Ok(acceptor)
    }
}

/// Install the process default crypto provider (only once)
fn install_crypto_provider() {
    static CRYPTO_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Certificate provider backed by PEM files.
///
/// A default certificate/key pair serves every endpoint; individual
/// endpoints may override it with their own pair.
pub struct PemFileCertProvider {
    default_cert: PathBuf,
    default_key: PathBuf,
    overrides: HashMap<SocketAddr, (PathBuf, PathBuf)>,
}

impl PemFileCertProvider {
    /// Create a provider with one default certificate pair
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            default_cert: cert_path.into(),
            default_key: key_path.into(),
            overrides: HashMap::new(),
        }
    }

    /// Serve a distinct certificate pair on one bind endpoint
    #[must_use]
    pub fn with_endpoint_cert(
        mut self,
        endpoint: SocketAddr,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.overrides
            .insert(endpoint, (cert_path.into(), key_path.into()));
        self
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let file = File::open(path)
            .map_err(|e| TlsError::certificate_load(path.display().to_string(), e.to_string()))?;
        let mut reader = BufReader::new(file);

        let mut certs = Vec::new();
        for cert in rustls_pemfile::certs(&mut reader) {
            certs.push(cert.map_err(|e| {
                TlsError::certificate_load(path.display().to_string(), e.to_string())
            })?);
        }

        if certs.is_empty() {
            return Err(TlsError::certificate_load(
                path.display().to_string(),
                "no certificates found",
            ));
        }
        Ok(certs)
    }

    fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
        let file = File::open(path)
            .map_err(|e| TlsError::private_key_load(path.display().to_string(), e.to_string()))?;
        let mut reader = BufReader::new(file);

        // Try PKCS#8 first
        if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .flatten()
            .next()
        {
            return Ok(PrivateKeyDer::Pkcs8(key));
        }

        // Rewind and try RSA
        if reader.get_mut().rewind().is_ok() {
            if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
                .flatten()
                .next()
            {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
        }

        // Rewind and try EC
        if reader.get_mut().rewind().is_ok() {
            if let Some(key) = rustls_pemfile::ec_private_keys(&mut reader)
                .flatten()
                .next()
            {
                return Ok(PrivateKeyDer::Sec1(key));
            }
        }

        Err(TlsError::private_key_load(
            path.display().to_string(),
            "no valid private key found",
        ))
    }
}

impl CertificateProvider for PemFileCertProvider {
    fn server_config(&self, endpoint: SocketAddr) -> Result<ServerConfig, TlsError> {
        let (cert_path, key_path) = self
            .overrides
            .get(&endpoint)
            .map_or((&self.default_cert, &self.default_key), |(c, k)| (c, k));

        let certs = Self::load_certs(cert_path)?;
        let key = Self::load_private_key(key_path)?;

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(e.to_string()))
    }
}

/// Certificate provider holding already-parsed certificates in memory
pub struct StaticCertProvider {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl StaticCertProvider {
    /// Create a provider from parsed DER material
    pub fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { certs, key }
    }
}

impl CertificateProvider for StaticCertProvider {
    fn server_config(&self, _endpoint: SocketAddr) -> Result<ServerConfig, TlsError> {
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| TlsError::config(e.to_string()))
    }
}
