use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dtls::cert_info::CertificateInfo;
use dtls::cipher_suite::CipherSuiteId;
use dtls::ProtocolVersion;

use shared::error::Result;

use crate::transport::SipsIceTransport;

/// Transport type identifier a session registers under.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportType {
    /// Secure SIP transport (reliable + secure flags upstream).
    Tls,
}

/// Connection state notified to the transport manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Disconnected,
}

/// One decrypted chunk handed to the upstream SIP packet dispatcher. The
/// data is the accumulated plaintext so far; the dispatcher returns how
/// many leading bytes formed complete SIP messages.
#[derive(Debug)]
pub struct RxPacket<'a> {
    pub data: &'a [u8],
    pub src_addr: SocketAddr,
    pub arrival: Instant,
}

/// Snapshot of the session returned by
/// [`SipsIceTransport::get_info`](crate::transport::SipsIceTransport::get_info).
#[derive(Debug, Clone, PartialEq)]
pub struct TransportInfo {
    pub established: bool,
    pub protocol: ProtocolVersion,
    pub local_addr: SocketAddr,
    /// Remaining fields are populated once established.
    pub remote_addr: Option<SocketAddr>,
    pub cipher: Option<CipherSuiteId>,
    pub local_cert: Option<CertificateInfo>,
    pub remote_cert: Option<CertificateInfo>,
    /// Peer verification bitmask captured at handshake completion
    /// (0 = verified).
    pub verify_status: u32,
    /// Display form of the most recent engine error, tracked across state
    /// changes.
    pub last_err: Option<String>,
}

/// The upstream SIP transport manager.
///
/// It owns registered transports, routes outgoing messages to them and
/// parses inbound byte streams into SIP messages. Reference counting is
/// plain `Arc`: [`register`](Self::register) hands the manager its handle,
/// and the manager must drop that handle when it receives the
/// [`TransportState::Disconnected`] notification. That release is what
/// lets the session tear down, and it breaks the manager/transport
/// reference cycle.
pub trait TransportManager: Send + Sync {
    /// Take ownership of a new transport of the given type.
    fn register(&self, transport: Arc<SipsIceTransport>, transport_type: TransportType)
        -> Result<()>;

    /// Feed accumulated decrypted bytes to the SIP parser. Returns the
    /// number of leading bytes consumed as complete messages; the rest is
    /// offered again once more data arrived.
    fn receive_packet(&self, packet: &RxPacket<'_>) -> usize;

    /// Connection state change of a registered transport.
    fn transport_state(&self, state: TransportState, info: &TransportInfo);
}
