//! UDP channel transmitter
//!
//! One UDP socket per bound endpoint, owned by one transmitter. Every
//! datagram starts with a fixed envelope that is readable without
//! decryption so the transmitter can demultiplex by session id:
//!
//! ```text
//! +--------------------+---------------------+-------------------+
//! | session id (8B LE) | integrity tag (8B)  | encrypted payload |
//! +--------------------+---------------------+-------------------+
//! ```
//!
//! The integrity tag is opaque here; the transmitter only applies a
//! cheap pre-check (non-zero) before handing the datagram to the session.
//! Unknown session ids and malformed datagrams are dropped without any
//! reply and without error-level logging.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::UdpError;
use crate::session::SessionManager;

/// Size of the session id prefix
pub const SESSION_ID_SIZE: usize = 8;

/// Size of the integrity tag
pub const INTEGRITY_TAG_SIZE: usize = 8;

/// Total envelope header size
pub const UDP_HEADER_SIZE: usize = SESSION_ID_SIZE + INTEGRITY_TAG_SIZE;

/// Receive buffer size; one maximum datagram
const UDP_BUFFER_SIZE: usize = 65535;

/// Parsed envelope header of one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacketHeader {
    /// Demux key; readable without decryption
    pub session_id: u64,
    /// Opaque integrity tag verified by the session layer
    pub integrity_tag: [u8; INTEGRITY_TAG_SIZE],
}

impl UdpPacketHeader {
    /// Parse the envelope header and apply the integrity pre-check
    pub fn parse(datagram: &[u8]) -> Result<Self, UdpError> {
        if datagram.len() < UDP_HEADER_SIZE {
            return Err(UdpError::DatagramTooShort {
                len: datagram.len(),
            });
        }

        let mut id_bytes = [0u8; SESSION_ID_SIZE];
        id_bytes.copy_from_slice(&datagram[..SESSION_ID_SIZE]);
        let session_id = u64::from_le_bytes(id_bytes);

        let mut integrity_tag = [0u8; INTEGRITY_TAG_SIZE];
        integrity_tag.copy_from_slice(&datagram[SESSION_ID_SIZE..UDP_HEADER_SIZE]);

        if integrity_tag == [0u8; INTEGRITY_TAG_SIZE] {
            return Err(UdpError::IntegrityCheckFailed);
        }

        Ok(Self {
            session_id,
            integrity_tag,
        })
    }
}

/// Build one outbound datagram from its parts
#[must_use]
pub fn seal_datagram(
    session_id: u64,
    integrity_tag: &[u8; INTEGRITY_TAG_SIZE],
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(UDP_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&session_id.to_le_bytes());
    buf.extend_from_slice(integrity_tag);
    buf.extend_from_slice(payload);
    buf
}

/// Single-socket UDP demultiplexer
///
/// Inbound datagrams are delivered to their session in arrival order for
/// this socket. Outbound datagrams are serialised through [`send_to`];
/// session UDP channels hold the transmitter and never touch the socket
/// directly.
///
/// [`send_to`]: UdpChannelTransmitter::send_to
pub struct UdpChannelTransmitter {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    receive_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    send_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
}

impl UdpChannelTransmitter {
    /// Bind the socket and start the receive loop.
    ///
    /// When `addr` carries port 0 the OS assigns one; [`local_addr`]
    /// reports the resolved endpoint.
    ///
    /// [`local_addr`]: UdpChannelTransmitter::local_addr
    pub async fn bind(
        addr: SocketAddr,
        session_manager: Arc<dyn SessionManager>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, UdpError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| UdpError::bind_failed(addr, e.to_string()))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let transmitter = Arc::new(Self {
            socket: Arc::clone(&socket),
            local_addr,
            cancel: parent.child_token(),
            receive_task: parking_lot::Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        });

        let task = tokio::spawn(receive_loop(
            Arc::clone(&transmitter),
            socket,
            session_manager,
        ));
        *transmitter.receive_task.lock() = Some(task);

        debug!(local = %local_addr, "UDP channel transmitter ready");
        Ok(transmitter)
    }

    /// The bound endpoint, with the OS-resolved port
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one sealed datagram; writes are serialised per transmitter
    pub async fn send_to(
        &self,
        session_id: u64,
        integrity_tag: &[u8; INTEGRITY_TAG_SIZE],
        payload: &[u8],
        to: SocketAddr,
    ) -> Result<usize, UdpError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(UdpError::Disposed);
        }
        let datagram = seal_datagram(session_id, integrity_tag, payload);
        let _guard = self.send_lock.lock().await;
        Ok(self.socket.send_to(&datagram, to).await?)
    }

    /// Total datagrams received on this socket
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Total datagrams dropped before reaching a session
    #[must_use]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    /// Close the socket and end the receive loop. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(local = %self.local_addr, "UDP channel transmitter disposed");
    }
}

/// Receive loop: demux datagrams into sessions until cancelled
async fn receive_loop(
    transmitter: Arc<UdpChannelTransmitter>,
    socket: Arc<UdpSocket>,
    session_manager: Arc<dyn SessionManager>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    loop {
        let (len, from) = tokio::select! {
            () = transmitter.cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    if transmitter.cancel.is_cancelled() {
                        break;
                    }
                    trace!(error = %e, "UDP receive error");
                    continue;
                }
            },
        };

        transmitter.packets_received.fetch_add(1, Ordering::Relaxed);

        let header = match UdpPacketHeader::parse(&buf[..len]) {
            Ok(header) => header,
            Err(e) => {
                transmitter.packets_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(from = %from, error = %e, "Dropping malformed datagram");
                continue;
            }
        };

        let Some(session) = session_manager.find_session(header.session_id) else {
            // Unknown session: drop, never reply
            transmitter.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(
                from = %from,
                session_id = header.session_id,
                "Dropping datagram for unknown session"
            );
            continue;
        };

        let payload = Bytes::copy_from_slice(&buf[SESSION_ID_SIZE..len]);
        session.receive_udp_datagram(payload, from).await;
    }
}
