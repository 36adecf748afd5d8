//! Connection host integration tests
//!
//! These tests drive the host end to end over real sockets: a TLS client
//! (with certificate verification disabled) speaks the wire protocol
//! against a host backed by a mock session manager and an rcgen-issued
//! certificate.
//!
//! # Test Categories
//!
//! 1. **Protocol tests**: raw and chunked Hello, UDP channel, Bye
//! 2. **Anonymity tests**: malformed requests earn the fixed 401 reply
//! 3. **Lifecycle tests**: start preconditions, restart, dispose, stop
//!    with in-flight requests
//! 4. **UDP tests**: port resolution and unknown-session drop

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustls::pki_types::{PrivateKeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use vpn_host::config::HostConfig;
use vpn_host::host::ConnectionHost;
use vpn_host::protocol::{AccessUsage, HelloRequest, SessionErrorCode, SuppressType};
use vpn_host::session::{Session, SessionError, SessionId, SessionInfo, SessionManager};
use vpn_host::stream::{ClientStream, EndpointPair};
use vpn_host::tls::{StaticCertProvider, TlsService};
use vpn_host::udp::{seal_datagram, INTEGRITY_TAG_SIZE};

// ============================================================================
// Wire Constants
// ============================================================================

const RAW_VERSION: u8 = 0x01;
const CODE_HELLO: u8 = 0x01;
const CODE_TCP_DATAGRAM: u8 = 0x02;
const CODE_UDP_CHANNEL: u8 = 0x04;
const CODE_BYE: u8 = 0x05;

const HELLO_BODY: &str = r#"{"TokenId":"t","ClientInfo":{"ClientId":"c","ProtocolVersion":2,"ClientVersion":"5.0","UserAgent":"ua"},"UseUdpChannel":false,"UseUdpChannel2":false}"#;

// ============================================================================
// Mock Session Layer
// ============================================================================

struct MockSession {
    id: SessionId,
    key: String,
    use_udp: AtomicBool,
    adopted_channels: AtomicU32,
    datagrams: Mutex<Vec<(Bytes, SocketAddr)>>,
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn session_key(&self) -> String {
        self.key.clone()
    }

    fn udp_channel_key(&self) -> String {
        format!("legacy-{}", self.key)
    }

    fn udp_key(&self) -> String {
        self.key.clone()
    }

    fn set_use_udp_channel(&self, enabled: bool) {
        self.use_udp.store(enabled, Ordering::SeqCst);
    }

    fn use_udp_channel(&self) -> bool {
        self.use_udp.load(Ordering::SeqCst)
    }

    async fn add_tcp_datagram_channel(
        &self,
        channel: Box<dyn ClientStream>,
    ) -> Result<(), SessionError> {
        self.adopted_channels.fetch_add(1, Ordering::SeqCst);
        channel.dispose(false).await;
        Ok(())
    }

    async fn add_tcp_proxy_channel(
        &self,
        channel: Box<dyn ClientStream>,
        _request: &vpn_host::protocol::TcpProxyChannelRequest,
    ) -> Result<(), SessionError> {
        self.adopted_channels.fetch_add(1, Ordering::SeqCst);
        channel.dispose(false).await;
        Ok(())
    }

    async fn receive_udp_datagram(&self, datagram: Bytes, from: SocketAddr) {
        self.datagrams.lock().push((datagram, from));
    }
}

#[derive(Default)]
struct MockSessionManager {
    create_calls: AtomicU32,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<MockSession>>>,
    seen_request_ids: Mutex<Vec<String>>,
}

impl MockSessionManager {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            create_calls: AtomicU32::new(0),
            next_id: AtomicU64::new(100),
            sessions: Mutex::new(HashMap::new()),
            seen_request_ids: Mutex::new(Vec::new()),
        })
    }

    fn create_session_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn session(&self, id: SessionId) -> Option<Arc<MockSession>> {
        self.sessions.lock().get(&id).cloned()
    }
}

#[async_trait]
impl SessionManager for MockSessionManager {
    async fn create_session(
        &self,
        request: &HelloRequest,
        _endpoints: EndpointPair,
    ) -> Result<SessionInfo, SessionError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if request.token_id == "expired" {
            return Err(SessionError::new(
                SessionErrorCode::AccessExpired,
                "token expired",
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(MockSession {
            id,
            key: format!("key-{id}"),
            use_udp: AtomicBool::new(false),
            adopted_channels: AtomicU32::new(0),
            datagrams: Mutex::new(Vec::new()),
        });
        self.sessions.lock().insert(id, Arc::clone(&session));

        Ok(SessionInfo {
            session_id: id,
            session_key: session.key.clone(),
            access_usage: AccessUsage {
                sent_traffic: 0,
                received_traffic: 0,
                max_traffic: 1 << 30,
                active_session_count: 1,
            },
            suppressed_to: SuppressType::None,
        })
    }

    async fn get_session(
        &self,
        session_id: SessionId,
        session_key: &str,
        request_id: &str,
        _endpoints: EndpointPair,
    ) -> Result<Arc<dyn Session>, SessionError> {
        if !request_id.is_empty() {
            self.seen_request_ids.lock().push(request_id.to_string());
        }
        let session = self
            .sessions
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or_else(|| SessionError::new(SessionErrorCode::SessionClosed, "not found"))?;
        if session.key != session_key {
            return Err(SessionError::new(
                SessionErrorCode::SessionClosed,
                "session key mismatch",
            ));
        }
        Ok(session)
    }

    fn find_session(&self, session_id: SessionId) -> Option<Arc<dyn Session>> {
        self.sessions
            .lock()
            .get(&session_id)
            .cloned()
            .map(|s| s as Arc<dyn Session>)
    }

    async fn close_session(
        &self,
        session_id: SessionId,
        request_id: &str,
    ) -> Result<(), SessionError> {
        if !request_id.is_empty() {
            self.seen_request_ids.lock().push(request_id.to_string());
        }
        self.sessions.lock().remove(&session_id);
        Ok(())
    }
}

// ============================================================================
// Test Host and TLS Client
// ============================================================================

async fn start_host(
    manager: Arc<MockSessionManager>,
    udp_endpoints: &[SocketAddr],
) -> (Arc<ConnectionHost>, SocketAddr) {
    let issued = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certs = vec![issued.cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(issued.key_pair.serialize_der().into());

    let tls = Arc::new(TlsService::new(Arc::new(StaticCertProvider::new(certs, key))));
    let host = ConnectionHost::new(HostConfig::default(), tls, manager);
    host.start(&["127.0.0.1:0".parse().unwrap()], udp_endpoints)
        .await
        .unwrap();

    let tcp = host.tcp_endpoints()[0];
    (host, tcp)
}

/// Certificate verifier that accepts anything; test client only
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

async fn tls_connect(addr: SocketAddr) -> TlsStream<TcpStream> {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

/// Write one raw-framed request: code byte, LE length, JSON body
async fn write_raw_request(stream: &mut TlsStream<TcpStream>, code: u8, body: &str) {
    stream.write_all(&[code]).await.unwrap();
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write_all(body.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

/// Read one length-prefixed JSON reply
async fn read_json_reply(stream: &mut TlsStream<TcpStream>) -> serde_json::Value {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Read until EOF and return everything
async fn read_to_eof(stream: &mut TlsStream<TcpStream>) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    out
}

/// Client-side decoder for the host's chunked HTTP response
struct ChunkedReader {
    raw: Vec<u8>,
    decoded: Vec<u8>,
    head_done: bool,
}

impl ChunkedReader {
    fn new() -> Self {
        Self {
            raw: Vec::new(),
            decoded: Vec::new(),
            head_done: false,
        }
    }

    async fn read_message(&mut self, stream: &mut TlsStream<TcpStream>) -> serde_json::Value {
        let prefix = self.take(stream, 4).await;
        let len = u32::from_le_bytes(prefix.try_into().unwrap()) as usize;
        let body = self.take(stream, len).await;
        serde_json::from_slice(&body).unwrap()
    }

    /// Take exactly `n` decoded payload bytes
    async fn take(&mut self, stream: &mut TlsStream<TcpStream>, n: usize) -> Vec<u8> {
        while self.decoded.len() < n {
            self.pump(stream).await;
        }
        self.decoded.drain(..n).collect()
    }

    /// Read more raw bytes and decode whatever is complete
    async fn pump(&mut self, stream: &mut TlsStream<TcpStream>) {
        let mut buf = [0u8; 4096];
        let read = stream.read(&mut buf).await.unwrap();
        assert!(read > 0, "server closed mid-response");
        self.raw.extend_from_slice(&buf[..read]);

        if !self.head_done {
            let Some(end) = find_subslice(&self.raw, b"\r\n\r\n") else {
                return;
            };
            let head = String::from_utf8_lossy(&self.raw[..end]).into_owned();
            assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {head}");
            assert!(head.contains("Transfer-Encoding: chunked"));
            self.raw.drain(..end + 4);
            self.head_done = true;
        }

        // Decode complete chunks
        loop {
            let Some(line_end) = find_subslice(&self.raw, b"\r\n") else {
                return;
            };
            let size_line = String::from_utf8_lossy(&self.raw[..line_end]).into_owned();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            let chunk_total = line_end + 2 + size + 2;
            if self.raw.len() < chunk_total {
                return;
            }
            self.decoded
                .extend_from_slice(&self.raw[line_end + 2..line_end + 2 + size]);
            self.raw.drain(..chunk_total);
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ============================================================================
// End-to-End Scenarios
// ============================================================================

#[tokio::test]
async fn s1_raw_hello_happy_path() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(Arc::clone(&manager), &[]).await;

    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut client, CODE_HELLO, HELLO_BODY).await;

    let reply = read_json_reply(&mut client).await;
    assert_eq!(reply["ServerProtocolVersion"], 3);
    assert_eq!(reply["ErrorCode"], "Ok");
    assert!(reply["SessionId"].as_u64().unwrap() >= 100);
    assert!(!reply["SessionKey"].as_str().unwrap().is_empty());
    assert_eq!(reply["UdpPort"], 0);
    assert_eq!(reply["ClientPublicAddress"], "127.0.0.1");

    // Raw variant: one exchange, then FIN
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "raw connection must close after the exchange");

    host.dispose().await;
}

#[tokio::test]
async fn s2_unsupported_client_rejected_after_session_creation() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(Arc::clone(&manager), &[]).await;

    let body = HELLO_BODY.replace("\"ProtocolVersion\":2", "\"ProtocolVersion\":1");
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut client, CODE_HELLO, &body).await;

    let reply = read_json_reply(&mut client).await;
    assert_eq!(reply["ErrorCode"], "UnsupportedClient");

    // The session must have been created before the version check, so an
    // old client is indistinguishable from an unknown one on the wire
    assert_eq!(manager.create_session_calls(), 1);

    host.dispose().await;
}

#[tokio::test]
async fn s3_unknown_request_code_gets_anonymous_401() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(manager, &[]).await;

    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION, 0xFF]).await.unwrap();
    client.flush().await.unwrap();

    let reply = read_to_eof(&mut client).await;
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "got: {text}");
    assert!(text.contains("Server: Kestrel\r\n"));
    assert!(text.contains("WWW-Authenticate: Bearer\r\n"));
    assert!(!text.contains("SessionId"));

    host.dispose().await;
}

#[tokio::test]
async fn s4_bye_with_wrong_session_key_gets_session_error() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(manager, &[]).await;

    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(
        &mut client,
        CODE_BYE,
        r#"{"SessionId":123,"SessionKey":"wrong"}"#,
    )
    .await;

    let reply = read_json_reply(&mut client).await;
    assert_eq!(reply["ErrorCode"], "SessionClosed");

    host.dispose().await;
}

#[tokio::test]
async fn s5_chunked_transport_reuses_connection_across_exchanges() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(Arc::clone(&manager), &["127.0.0.1:0".parse().unwrap()]).await;

    let mut client = tls_connect(addr).await;
    client
        .write_all(b"POST /tunnel HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();

    // First exchange: Hello, framed inside one chunk
    let mut payload = vec![CODE_HELLO];
    payload.extend_from_slice(&(HELLO_BODY.len() as u32).to_le_bytes());
    payload.extend_from_slice(HELLO_BODY.as_bytes());
    write_chunk(&mut client, &payload).await;

    let mut reader = ChunkedReader::new();
    let hello = reader.read_message(&mut client).await;
    assert_eq!(hello["ErrorCode"], "Ok");
    assert_eq!(hello["ServerProtocolVersion"], 3);
    let session_id = hello["SessionId"].as_u64().unwrap();
    let session_key = hello["SessionKey"].as_str().unwrap().to_string();

    // Second exchange on the same TLS stream: UdpChannel for that session
    let udp_body = format!(
        r#"{{"SessionId":{session_id},"SessionKey":"{session_key}","RequestId":"r-2"}}"#
    );
    let mut payload = vec![CODE_UDP_CHANNEL];
    payload.extend_from_slice(&(udp_body.len() as u32).to_le_bytes());
    payload.extend_from_slice(udp_body.as_bytes());
    write_chunk(&mut client, &payload).await;

    let udp_reply = reader.read_message(&mut client).await;
    assert_eq!(udp_reply["ErrorCode"], "Ok");
    assert_eq!(udp_reply["UdpKey"], session_key);
    let advertised_port = udp_reply["UdpPort"].as_u64().unwrap();
    assert_eq!(advertised_port, u64::from(host.udp_endpoints()[0].port()));

    // The idempotency id reaches the session manager
    assert!(manager.seen_request_ids.lock().contains(&"r-2".to_string()));

    // Third exchange still works: the stream keeps its reusability
    write_chunk(&mut client, &payload).await;
    let again = reader.read_message(&mut client).await;
    assert_eq!(again["ErrorCode"], "Ok");

    host.dispose().await;
}

async fn write_chunk(stream: &mut TlsStream<TcpStream>, payload: &[u8]) {
    stream
        .write_all(format!("{:X}\r\n", payload.len()).as_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
    stream.write_all(b"\r\n").await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn s6_udp_datagram_for_unknown_session_is_dropped() {
    let manager = MockSessionManager::new();
    let (host, _addr) = start_host(manager, &["127.0.0.1:0".parse().unwrap()]).await;
    let udp_endpoint = host.udp_endpoints()[0];

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = seal_datagram(0xDEAD_BEEF, &[1u8; INTEGRITY_TAG_SIZE], &[0u8; 48]);
    client.send_to(&datagram, udp_endpoint).await.unwrap();

    // No reply, ever
    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
    assert!(reply.is_err(), "unknown-session datagram must not be answered");

    host.dispose().await;
}

#[tokio::test]
async fn udp_datagram_for_live_session_reaches_it() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(Arc::clone(&manager), &["127.0.0.1:0".parse().unwrap()]).await;
    let udp_endpoint = host.udp_endpoints()[0];

    // Create a session over TCP first
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut client, CODE_HELLO, HELLO_BODY).await;
    let reply = read_json_reply(&mut client).await;
    let session_id = reply["SessionId"].as_u64().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = seal_datagram(session_id, &[7u8; INTEGRITY_TAG_SIZE], b"ciphertext");
    socket.send_to(&datagram, udp_endpoint).await.unwrap();

    let session = manager.session(session_id).unwrap();
    for _ in 0..100 {
        if !session.datagrams.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let datagrams = session.datagrams.lock();
    assert_eq!(datagrams.len(), 1);
    assert!(datagrams[0].0.ends_with(b"ciphertext"));
    drop(datagrams);

    host.dispose().await;
}

// ============================================================================
// Anonymity
// ============================================================================

#[tokio::test]
async fn malformed_requests_all_get_the_401_banner() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(manager, &[]).await;

    // Unknown one-byte codes outside the known set
    for code in [0x00u8, 0x06, 0x7F, 0xAB] {
        let mut client = tls_connect(addr).await;
        client.write_all(&[RAW_VERSION, code]).await.unwrap();
        client.flush().await.unwrap();
        let text = String::from_utf8_lossy(&read_to_eof(&mut client).await).into_owned();
        assert!(
            text.starts_with("HTTP/1.1 401"),
            "code 0x{code:02x} leaked: {text}"
        );
    }

    // Invalid JSON body
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut client, CODE_HELLO, "this is not json").await;
    let text = String::from_utf8_lossy(&read_to_eof(&mut client).await).into_owned();
    assert!(text.starts_with("HTTP/1.1 401"), "invalid JSON leaked: {text}");

    // Truncated body: declared length never arrives
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION, CODE_HELLO]).await.unwrap();
    client.write_all(&100u32.to_le_bytes()).await.unwrap();
    client.write_all(b"{\"Token").await.unwrap();
    client.flush().await.unwrap();
    client.shutdown().await.unwrap();
    let text = String::from_utf8_lossy(&read_to_eof(&mut client).await).into_owned();
    assert!(text.starts_with("HTTP/1.1 401"), "truncated body leaked: {text}");

    // Oversized declared length
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION, CODE_HELLO]).await.unwrap();
    client.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
    client.flush().await.unwrap();
    let text = String::from_utf8_lossy(&read_to_eof(&mut client).await).into_owned();
    assert!(text.starts_with("HTTP/1.1 401"), "oversized length leaked: {text}");

    host.dispose().await;
}

#[tokio::test]
async fn session_error_from_manager_gets_structured_reply() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(Arc::clone(&manager), &[]).await;

    let body = HELLO_BODY.replace("\"TokenId\":\"t\"", "\"TokenId\":\"expired\"");
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut client, CODE_HELLO, &body).await;

    let reply = read_json_reply(&mut client).await;
    assert_eq!(reply["ErrorCode"], "AccessExpired");
    assert_eq!(reply["ErrorMessage"], "token expired");

    host.dispose().await;
}

// ============================================================================
// Channel Handoff
// ============================================================================

#[tokio::test]
async fn tcp_datagram_channel_transfers_stream_ownership() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(Arc::clone(&manager), &[]).await;

    // Hello on one connection to obtain credentials
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut client, CODE_HELLO, HELLO_BODY).await;
    let reply = read_json_reply(&mut client).await;
    let session_id = reply["SessionId"].as_u64().unwrap();
    let session_key = reply["SessionKey"].as_str().unwrap().to_string();

    // Datagram channel on a fresh connection
    let body = format!(
        r#"{{"SessionId":{session_id},"SessionKey":"{session_key}","RequestId":"r-1"}}"#
    );
    let mut channel = tls_connect(addr).await;
    channel.write_all(&[RAW_VERSION]).await.unwrap();
    write_raw_request(&mut channel, CODE_TCP_DATAGRAM, &body).await;

    let session = manager.session(session_id).unwrap();
    for _ in 0..100 {
        if session.adopted_channels.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.adopted_channels.load(Ordering::SeqCst), 1);
    assert!(manager.seen_request_ids.lock().contains(&"r-1".to_string()));

    host.dispose().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn start_preconditions_and_restart() {
    let manager = MockSessionManager::new();
    let issued = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let certs = vec![issued.cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(issued.key_pair.serialize_der().into());
    let tls = Arc::new(TlsService::new(Arc::new(StaticCertProvider::new(certs, key))));
    let host = ConnectionHost::new(HostConfig::default(), tls, manager);

    // No TCP endpoint: refused
    let err = host.start(&[], &[]).await.unwrap_err();
    assert!(err.to_string().contains("No TcpEndPoint"));
    assert!(!host.is_started());

    // First start succeeds; second without stop is refused
    let endpoints = ["127.0.0.1:0".parse().unwrap()];
    host.start(&endpoints, &[]).await.unwrap();
    assert!(host.is_started());
    let err = host.start(&endpoints, &[]).await.unwrap_err();
    assert!(err.to_string().contains("already started"));

    // Stop, then start again
    host.stop().await;
    assert!(!host.is_started());
    assert!(host.tcp_endpoints().is_empty());
    host.start(&endpoints, &[]).await.unwrap();
    assert!(host.is_started());

    // Dispose is terminal
    host.dispose().await;
    assert!(host.is_disposed());
    let err = host.start(&endpoints, &[]).await.unwrap_err();
    assert!(err.to_string().contains("disposed"));
}

#[tokio::test]
async fn udp_port_zero_resolves_to_distinct_ports() {
    let manager = MockSessionManager::new();
    let udp = ["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()];
    let (host, _addr) = start_host(manager, &udp).await;

    let endpoints = host.udp_endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints.iter().all(|e| e.port() != 0));
    assert_ne!(endpoints[0].port(), endpoints[1].port());

    host.dispose().await;
}

#[tokio::test]
async fn stop_with_inflight_request_completes_promptly() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(manager, &[]).await;

    // Client that negotiates a transport and then stalls mid-request
    let mut client = tls_connect(addr).await;
    client.write_all(&[RAW_VERSION]).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(10), host.stop()).await;
    assert!(stopped.is_ok(), "stop must not wait out the request timeout");
    assert!(!host.is_started());

    // The stalled connection is gone
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected closed connection, got {other:?}"),
    }

    host.dispose().await;
}

#[tokio::test]
async fn closed_connection_before_first_byte_is_tolerated() {
    let manager = MockSessionManager::new();
    let (host, addr) = start_host(manager, &[]).await;

    // TLS handshake, then immediate close: the benign scanner pattern
    let client = tls_connect(addr).await;
    drop(client);

    // Host remains healthy
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(host.is_started());

    host.dispose().await;
}
