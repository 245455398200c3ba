use std::time::Duration;

use shared::error::{Error, Result};

use crate::cipher_suite::CipherSuiteId;
use crate::config::TlsConfig;
use crate::cookie::Prestate;

/// Peer role of a DTLS session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DtlsRole {
    Client,
    Server,
}

impl DtlsRole {
    pub fn is_server(&self) -> bool {
        *self == DtlsRole::Server
    }
}

/// Datagram transport the engine performs its record I/O through.
///
/// This is the push / pull / wait triple the session driver binds to the
/// ICE channel and its inbound buffer. The engine never touches a socket;
/// every ciphertext datagram it emits goes through [`push`](Self::push) and
/// every datagram it consumes comes out of [`pull`](Self::pull).
pub trait DatagramIo {
    /// Submit one datagram to the wire. Returns the number of bytes
    /// accepted. Never blocks.
    fn push(&mut self, data: &[u8]) -> Result<usize>;

    /// Take the head datagram, copying at most `buf.len()` bytes of it into
    /// `buf`. The entire head is consumed regardless of `buf.len()`
    /// (datagram semantics). Returns `None` when no datagram is queued.
    fn pull(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Wait up to `timeout` for a datagram to become available. Returns the
    /// size of the head datagram, or 0 on timeout or teardown.
    fn pull_timeout(&mut self, timeout: Duration) -> usize;
}

/// Outcome of one [`DtlsEngine::handshake`] step.
#[derive(Debug, PartialEq)]
pub enum HandshakeStatus {
    /// Handshake finished; the session is ready for application records.
    Complete,
    /// Not done yet; call again on the next inbound datagram. The engine is
    /// expected to have waited in [`DatagramIo::pull_timeout`] for its
    /// retransmit pacing before returning this.
    Pending,
    /// Fatal failure; the session is unusable.
    Failed(Error),
}

/// Outcome of one [`DtlsEngine::record_recv`] call.
#[derive(Debug, PartialEq)]
pub enum RecordRecv {
    /// `n` plaintext bytes were written into the caller's buffer.
    Data(usize),
    /// Orderly shutdown: the peer sent close_notify.
    Closed,
    /// No complete record available; try again after the next signal. The
    /// engine must only return this once the transport had nothing left to
    /// pull.
    WouldBlock,
    /// The peer requested renegotiation; drive the handshake again.
    Rehandshake,
    /// A record was dropped (bad MAC, replay, decode error). Non-fatal.
    Discarded(Error),
    /// Fatal session error.
    Fatal(Error),
}

/// A DTLS protocol engine bound to a [`DatagramIo`] transport.
///
/// Mirrors the record/handshake surface of a datagram TLS library: the
/// session driver owns the engine exclusively and is the only caller; the
/// engine performs all wire I/O through the `io` argument handed to each
/// call.
pub trait DtlsEngine: Send {
    /// Advance the handshake by one step.
    fn handshake(&mut self, io: &mut dyn DatagramIo) -> HandshakeStatus;

    /// Encrypt and submit one plaintext fragment, at most
    /// [`data_mtu`](Self::data_mtu) bytes. Returns the plaintext bytes
    /// consumed (the full fragment on success).
    fn record_send(&mut self, plaintext: &[u8], io: &mut dyn DatagramIo) -> Result<usize>;

    /// Receive and decrypt the next application record into `buf`.
    fn record_recv(&mut self, buf: &mut [u8], io: &mut dyn DatagramIo) -> RecordRecv;

    /// Maximum plaintext size of one record, after record-layer overhead.
    fn data_mtu(&self) -> usize;

    /// Negotiated cipher suite, once the handshake completed.
    fn cipher_suite(&self) -> Option<CipherSuiteId>;

    /// Peer verification status captured during the handshake: 0 when the
    /// chain verified (including the configured `cert_check` hook),
    /// a non-zero bitmask otherwise.
    fn verify_status(&self) -> u32;

    /// DER of the local certificate presented to the peer, if any.
    fn local_certificate(&self) -> Option<&[u8]>;

    /// DER chain presented by the peer, leaf first. Empty before the
    /// handshake completed.
    fn peer_certificates(&self) -> &[Vec<u8>];

    /// Send close_notify. Best effort; the session is torn down afterwards
    /// regardless.
    fn bye(&mut self, io: &mut dyn DatagramIo);
}

/// Opens engine sessions. The factory outlives every session it opens and
/// is shared across transports.
pub trait DtlsEngineFactory: Send + Sync {
    /// Open a session for `role` configured by `config`. Servers pass the
    /// [`Prestate`] produced by cookie verification so the session resumes
    /// at the right record and handshake sequence numbers; clients pass
    /// `None`.
    fn open(
        &self,
        role: DtlsRole,
        config: &TlsConfig,
        prestate: Option<Prestate>,
    ) -> Result<Box<dyn DtlsEngine>>;
}
