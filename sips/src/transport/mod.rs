
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use dtls::config::TlsConfig;
use dtls::cookie::{self, CookieKey};
use dtls::engine::{
    DatagramIo, DtlsEngine, DtlsEngineFactory, DtlsRole, HandshakeStatus, RecordRecv,
};
use dtls::PROTOCOL_VERSION_DTLS1_0;
use shared::error::{Error, Result};

use crate::ice::{ComponentId, IceChannel};
use crate::manager::{RxPacket, TransportInfo, TransportManager, TransportState, TransportType};
use crate::message::{SendCallback, SipMessageKind, TxMessage};

/// Scratch buffer accumulating decrypted records until the SIP parser has
/// consumed them.
pub(crate) const RX_BUFFER_SIZE: usize = 8192;

/// DTLS session lifecycle. Transitions are monotonic except
/// Cookie -> Handshaking (server only); nothing leaves Disconnected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Cookie = 0,
    Handshaking = 1,
    Established = 2,
    Disconnected = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Cookie,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Established,
            _ => ConnectionState::Disconnected,
        }
    }
}

fn role_str(is_server: bool) -> &'static str {
    if is_server {
        "server"
    } else {
        "client"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct OutboundEntry {
    msg: Arc<TxMessage>,
    deadline: Option<Instant>,
    callback: Option<SendCallback>,
}

impl OutboundEntry {
    /// Complete the operation exactly once: clear the message's op flag and
    /// hand the outcome to the caller.
    fn complete(mut self, result: Result<usize>) {
        self.msg.release();
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

#[derive(Default)]
struct SessionInfo {
    local_cert: dtls::cert_info::CertificateInfo,
    remote_cert: dtls::cert_info::CertificateInfo,
    cipher: Option<dtls::cipher_suite::CipherSuiteId>,
    verify_status: u32,
    last_err: Option<String>,
    connected_notified: bool,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("is_server", &self.is_server)
            .field("component", &self.component)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

struct Shared {
    is_server: bool,
    component: ComponentId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    default_local_addr: SocketAddr,
    config: TlsConfig,

    state: AtomicU8,
    /// Single synchronization point: signaled on datagram arrival, outbound
    /// enqueue and state transitions. Bound to `input`.
    cv: Condvar,
    input: Mutex<VecDeque<Vec<u8>>>,
    output: Mutex<VecDeque<OutboundEntry>>,
    can_write: AtomicBool,
    info: Mutex<SessionInfo>,

    ice: Arc<dyn IceChannel>,
    manager: Arc<dyn TransportManager>,
    factory: Arc<dyn DtlsEngineFactory>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Move to `new` unless already Disconnected. Returns whether the
    /// transition happened.
    fn transition(&self, new: ConnectionState) -> bool {
        let moved = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                if ConnectionState::from(cur) == ConnectionState::Disconnected {
                    None
                } else {
                    Some(new as u8)
                }
            })
            .is_ok();
        if moved {
            // Pairs with the predicate re-check of every waiter.
            drop(lock(&self.input));
            self.cv.notify_all();
        }
        moved
    }

    fn reset(&self) {
        if self.transition(ConnectionState::Disconnected) {
            debug!("[{}] reset", role_str(self.is_server));
        }
    }

    fn set_last_err(&self, err: &Error) {
        lock(&self.info).last_err = Some(err.to_string());
    }

    fn snapshot_info(&self) -> TransportInfo {
        let established = self.state() == ConnectionState::Established;
        let info = lock(&self.info);
        TransportInfo {
            established,
            protocol: PROTOCOL_VERSION_DTLS1_0,
            local_addr: self.local_addr,
            remote_addr: established.then_some(self.remote_addr),
            cipher: if established { info.cipher } else { None },
            local_cert: (established && !info.local_cert.is_empty())
                .then(|| info.local_cert.clone()),
            remote_cert: (established && !info.remote_cert.is_empty())
                .then(|| info.remote_cert.clone()),
            verify_status: if established { info.verify_status } else { 0 },
            last_err: info.last_err.clone(),
        }
    }
}

/// Push / pull / wait adapter binding the engine's record I/O to the ICE
/// channel and the inbound buffer.
struct IceShim<'a> {
    shared: &'a Shared,
}

impl DatagramIo for IceShim<'_> {
    fn push(&mut self, data: &[u8]) -> Result<usize> {
        self.shared.ice.send(self.shared.component, data)
    }

    fn pull(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut input = lock(&self.shared.input);
        let head = input.pop_front()?;
        let n = usize::min(head.len(), buf.len());
        buf[..n].copy_from_slice(&head[..n]);
        Some(n)
    }

    fn pull_timeout(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut input = lock(&self.shared.input);
        loop {
            if let Some(head) = input.front() {
                return head.len();
            }
            if self.shared.state() == ConnectionState::Disconnected {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(input, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            input = guard;
        }
    }
}

/// Secure SIP transport bound to one ICE component.
///
/// Construction registers the transport with its manager, hooks the ICE
/// receive callback and starts the session worker. The worker owns the
/// DTLS engine exclusively; callers only ever touch the outbound queue.
pub struct SipsIceTransport {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SipsIceTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipsIceTransport")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl SipsIceTransport {
    pub fn new(
        manager: Arc<dyn TransportManager>,
        ice: Arc<dyn IceChannel>,
        component: ComponentId,
        config: TlsConfig,
        factory: Arc<dyn DtlsEngineFactory>,
    ) -> Result<Arc<Self>> {
        if !ice.is_running() {
            return Err(Error::ErrIceNotRunning);
        }

        let is_server = !ice.is_initiator();
        let initial = if is_server {
            ConnectionState::Cookie
        } else {
            ConnectionState::Handshaking
        };

        let shared = Arc::new(Shared {
            is_server,
            component,
            local_addr: ice.local_address(component),
            remote_addr: ice.remote_address(component),
            default_local_addr: ice.default_local_address(),
            config,
            state: AtomicU8::new(initial as u8),
            cv: Condvar::new(),
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(VecDeque::new()),
            can_write: AtomicBool::new(false),
            info: Mutex::new(SessionInfo::default()),
            ice: Arc::clone(&ice),
            manager: Arc::clone(&manager),
            factory,
        });

        debug!(
            "SipsIceTransport [{}] {} -> {}",
            role_str(is_server),
            shared.default_local_addr,
            shared.remote_addr
        );

        let transport = Arc::new(SipsIceTransport {
            shared: Arc::clone(&shared),
            worker: Mutex::new(None),
        });

        manager.register(Arc::clone(&transport), TransportType::Tls)?;

        let recv_shared = Arc::clone(&shared);
        ice.set_on_recv(
            component,
            Some(Box::new(move |buf: &[u8]| {
                {
                    let mut input = lock(&recv_shared.input);
                    input.push_back(buf.to_vec());
                }
                recv_shared.cv.notify_all();
                buf.len()
            })),
        );

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("sips-ice-tls".to_owned())
            .spawn(move || Worker::new(worker_shared).run());

        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                // Unwind registration: the Disconnected notification is the
                // manager's release signal.
                ice.set_on_recv(component, None);
                shared.reset();
                manager.transport_state(TransportState::Disconnected, &shared.snapshot_info());
                return Err(e.into());
            }
        };
        *lock(&transport.worker) = Some(handle);

        Ok(transport)
    }

    /// Queue one serialized SIP message for transmission.
    ///
    /// Returns `Ok(())` when the message was accepted; the outcome is
    /// delivered through `callback` exactly once. Requests carry a
    /// transaction deadline and are dropped with a timeout completion when
    /// it passes before the session can send them.
    pub fn send(
        &self,
        msg: Arc<TxMessage>,
        rem_addr: SocketAddr,
        callback: SendCallback,
    ) -> Result<()> {
        if !msg.claim() {
            return Err(Error::ErrPendingTx);
        }

        debug!(
            "[{}] queuing {} bytes to {}",
            role_str(self.shared.is_server),
            msg.payload().len(),
            rem_addr
        );

        let deadline = match msg.kind() {
            SipMessageKind::Request => Some(Instant::now() + self.shared.config.txn_deadline),
            SipMessageKind::Response => None,
        };

        {
            let mut output = lock(&self.shared.output);
            // The worker drains the queue after the Disconnected
            // transition; anything later must be rejected here or its
            // callback would never fire.
            if self.shared.state() == ConnectionState::Disconnected {
                drop(output);
                msg.release();
                return Err(Error::ErrNotConnected);
            }
            output.push_back(OutboundEntry {
                msg: Arc::clone(&msg),
                deadline,
                callback: Some(callback),
            });
        }
        {
            // The worker re-checks this flag between its predicate check
            // and the wait; publishing it under the input mutex keeps the
            // wakeup from slipping through. Never taken while `output` is
            // held.
            let _input = lock(&self.shared.input);
            self.shared.can_write.store(true, Ordering::Release);
        }
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Stop the session: state goes to Disconnected, queued sends fail
    /// with NOT-CONNECTED and the manager is notified once. Idempotent.
    pub fn shutdown(&self) {
        warn!("SipsIceTransport [{}] shutdown", role_str(self.shared.is_server));
        self.shared.reset();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Session snapshot: protocol, addresses and, once established, cipher
    /// suite, certificates and the persisted verification status.
    pub fn get_info(&self) -> TransportInfo {
        self.shared.snapshot_info()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn default_local_address(&self) -> SocketAddr {
        self.shared.default_local_addr
    }

    pub fn transport_type(&self) -> TransportType {
        TransportType::Tls
    }
}

impl Drop for SipsIceTransport {
    fn drop(&mut self) {
        self.shared.reset();
        self.shared.ice.set_on_recv(self.shared.component, None);
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

/// The session driver: owns the engine, runs setup / step / clean on its
/// dedicated thread.
struct Worker {
    shared: Arc<Shared>,
    engine: Option<Box<dyn DtlsEngine>>,
    cookie_key: Option<CookieKey>,
    handshake_start: Instant,
    rx_buf: Vec<u8>,
    rx_len: usize,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> Self {
        Worker {
            shared,
            engine: None,
            cookie_key: None,
            handshake_start: Instant::now(),
            rx_buf: vec![0u8; RX_BUFFER_SIZE],
            rx_len: 0,
        }
    }

    fn run(mut self) {
        self.setup();
        while self.shared.state() != ConnectionState::Disconnected {
            self.step();
        }
        self.clean();
    }

    fn setup(&mut self) {
        debug!("[{}] starting TLS worker", role_str(self.shared.is_server));
        if self.shared.is_server {
            self.cookie_key = Some(CookieKey::generate());
            self.shared.transition(ConnectionState::Cookie);
        } else {
            self.start_tls_session(None);
        }
    }

    fn step(&mut self) {
        if !self.shared.ice.is_running() {
            self.shared.reset();
            return;
        }
        match self.shared.state() {
            ConnectionState::Cookie => self.cookie_phase(),
            ConnectionState::Handshaking => self.handshake_phase(),
            ConnectionState::Established => self.established_phase(),
            ConnectionState::Disconnected => {}
        }
    }

    /// Open the engine session and enter Handshaking.
    fn start_tls_session(&mut self, prestate: Option<cookie::Prestate>) {
        let role = if self.shared.is_server {
            DtlsRole::Server
        } else {
            DtlsRole::Client
        };
        debug!("[{}] starting TLS session", role_str(self.shared.is_server));

        match self.shared.factory.open(role, &self.shared.config, prestate) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.handshake_start = Instant::now();
                self.shared.transition(ConnectionState::Handshaking);
            }
            Err(e) => {
                warn!("[{}] can't open TLS session: {}", role_str(self.shared.is_server), e);
                self.shared.set_last_err(&e);
                self.shared.reset();
            }
        }
    }

    /// Server-side stateless cookie exchange. No engine session exists
    /// until a ClientHello echoes a valid cookie.
    fn cookie_phase(&mut self) {
        let head = {
            let mut input = lock(&self.shared.input);
            while self.shared.state() == ConnectionState::Cookie && input.is_empty() {
                input = self
                    .shared
                    .cv
                    .wait(input)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if self.shared.state() != ConnectionState::Cookie {
                return;
            }
            match input.front() {
                Some(head) => head.clone(),
                None => return,
            }
        };

        let Some(key) = self.cookie_key.as_ref() else {
            self.shared.reset();
            return;
        };

        match cookie::verify(key, &self.shared.remote_addr, &head) {
            Ok(Some(prestate)) => {
                // The verified ClientHello stays queued: the engine's first
                // pull consumes it.
                self.start_tls_session(Some(prestate));
            }
            Ok(None) => {
                debug!("cookie: challenging {}", self.shared.remote_addr);
                match cookie::respond(key, &self.shared.remote_addr, &head) {
                    Ok(hvr) => {
                        let mut shim = IceShim {
                            shared: &self.shared,
                        };
                        if let Err(e) = shim.push(&hvr) {
                            warn!("cookie: can't send verify request: {}", e);
                            self.shared.set_last_err(&e);
                        }
                    }
                    Err(e) => self.shared.set_last_err(&e),
                }
                self.pop_head();
            }
            Err(e) => {
                // Not a parseable ClientHello; drop it without a response.
                debug!("cookie: discarding datagram: {}", e);
                self.pop_head();
            }
        }
    }

    fn pop_head(&self) {
        lock(&self.shared.input).pop_front();
    }

    fn handshake_phase(&mut self) {
        if self.handshake_start.elapsed() > self.shared.config.handshake_timeout {
            self.on_handshake_complete(Err(Error::ErrTimeout));
            return;
        }

        let status = {
            let shared = Arc::clone(&self.shared);
            let mut shim = IceShim { shared: &shared };
            let Some(engine) = self.engine.as_mut() else {
                self.shared.reset();
                return;
            };
            engine.handshake(&mut shim)
        };

        match status {
            HandshakeStatus::Pending => {}
            HandshakeStatus::Complete => {
                self.shared.transition(ConnectionState::Established);
                self.on_handshake_complete(Ok(()));
            }
            HandshakeStatus::Failed(e) => self.on_handshake_complete(Err(e)),
        }
    }

    /// Handshake wrap-up: refresh certificates and notify upstream. A
    /// failed server handshake destroys the session silently (anti-probe);
    /// a failed client handshake resets and lets `clean` emit the single
    /// Disconnected notification.
    fn on_handshake_complete(&mut self, status: Result<()>) {
        debug!(
            "[{}] handshake complete: {:?}",
            role_str(self.shared.is_server),
            status
        );
        match status {
            Ok(()) => {
                self.cert_update();
                let info = self.shared.snapshot_info();
                lock(&self.shared.info).connected_notified = true;
                self.shared
                    .manager
                    .transport_state(TransportState::Connected, &info);
            }
            Err(e) => {
                warn!(
                    "[{}] handshake with {} failed: {}",
                    role_str(self.shared.is_server),
                    self.shared.remote_addr,
                    e
                );
                self.shared.set_last_err(&e);
                self.shared.reset();
            }
        }
    }

    /// Refresh the cached local and peer certificate views; skipped
    /// internally when issuer and serial are unchanged.
    fn cert_update(&mut self) {
        let Some(engine) = self.engine.as_ref() else {
            return;
        };
        let mut info = lock(&self.shared.info);

        match engine.local_certificate() {
            Some(der) => {
                if let Err(e) = info.local_cert.update_from_der(der) {
                    info.last_err = Some(e.to_string());
                }
            }
            None => info.local_cert = Default::default(),
        }

        match engine.peer_certificates().first() {
            Some(der) => {
                if let Err(e) = info.remote_cert.update_from_der(der) {
                    info.last_err = Some(e.to_string());
                }
            }
            None => info.remote_cert = Default::default(),
        }

        info.cipher = engine.cipher_suite();
        info.verify_status = engine.verify_status();
    }

    fn established_phase(&mut self) {
        {
            let mut input = lock(&self.shared.input);
            while self.shared.state() == ConnectionState::Established
                && input.is_empty()
                && !self.shared.can_write.load(Ordering::Acquire)
            {
                input = self
                    .shared
                    .cv
                    .wait(input)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        if self.shared.state() != ConnectionState::Established {
            return;
        }
        // All presently-available inbound records are handled before any
        // outbound transmission.
        self.pump_inbound();
        self.flush_output();
    }

    /// Drain decrypted records into the assembly buffer and hand them to
    /// the SIP packet dispatcher.
    fn pump_inbound(&mut self) {
        loop {
            if self.shared.state() != ConnectionState::Established {
                break;
            }
            if self.rx_len == RX_BUFFER_SIZE {
                // 8 KiB of bytes the parser refused to eat: protocol
                // garbage by now.
                warn!("rx assembly buffer full, dropping {} bytes", self.rx_len);
                self.rx_len = 0;
            }

            let outcome = {
                let shared = Arc::clone(&self.shared);
                let mut shim = IceShim { shared: &shared };
                let Some(engine) = self.engine.as_mut() else {
                    self.shared.reset();
                    return;
                };
                engine.record_recv(&mut self.rx_buf[self.rx_len..], &mut shim)
            };

            match outcome {
                RecordRecv::Data(n) => {
                    self.rx_len += n;
                    let packet = RxPacket {
                        data: &self.rx_buf[..self.rx_len],
                        src_addr: self.shared.remote_addr,
                        arrival: Instant::now(),
                    };
                    let eaten = self.shared.manager.receive_packet(&packet).min(self.rx_len);
                    let rem = self.rx_len - eaten;
                    if rem > 0 && rem != self.rx_len {
                        self.rx_buf.copy_within(eaten..self.rx_len, 0);
                    }
                    self.rx_len = rem;
                }
                RecordRecv::Closed => {
                    debug!("[{}] session closed by peer", role_str(self.shared.is_server));
                    self.shared.reset();
                    break;
                }
                RecordRecv::WouldBlock => break,
                RecordRecv::Rehandshake => {
                    debug!("[{}] rehandshake", role_str(self.shared.is_server));
                    let status = {
                        let shared = Arc::clone(&self.shared);
                        let mut shim = IceShim { shared: &shared };
                        match self.engine.as_mut() {
                            Some(engine) => engine.handshake(&mut shim),
                            None => return,
                        }
                    };
                    match status {
                        HandshakeStatus::Pending => {}
                        HandshakeStatus::Complete => self.on_handshake_complete(Ok(())),
                        HandshakeStatus::Failed(e) => {
                            self.on_handshake_complete(Err(e));
                            break;
                        }
                    }
                }
                RecordRecv::Discarded(e) => {
                    debug!("record discarded: {}", e);
                    self.shared.set_last_err(&e);
                }
                RecordRecv::Fatal(e) => {
                    warn!("record recv failed: {}", e);
                    self.shared.set_last_err(&e);
                    self.shared.reset();
                    break;
                }
            }
        }
    }

    /// Send queued messages in FIFO order, dropping expired requests with a
    /// timeout completion.
    fn flush_output(&mut self) {
        if self.shared.state() != ConnectionState::Established {
            return;
        }
        loop {
            let entry = {
                let mut output = lock(&self.shared.output);
                match output.pop_front() {
                    Some(entry) => entry,
                    None => {
                        self.shared.can_write.store(false, Ordering::Release);
                        break;
                    }
                }
            };

            if let Some(deadline) = entry.deadline {
                if deadline < Instant::now() {
                    debug!("dropping expired outbound message");
                    entry.complete(Err(Error::ErrTimeout));
                    continue;
                }
            }

            let result = self.try_send(&entry);
            let failed = result.is_err();
            if let Err(e) = &result {
                warn!("record send failed: {}", e);
                self.shared.set_last_err(e);
            }
            entry.complete(result);
            if failed {
                break;
            }
        }
    }

    /// Submit one message through the record layer, fragmenting the
    /// plaintext at the engine's data MTU. The whole message is submitted
    /// or the entry fails; plaintext is never partially written above the
    /// record layer.
    fn try_send(&mut self, entry: &OutboundEntry) -> Result<usize> {
        if self.shared.state() != ConnectionState::Established {
            return Err(Error::ErrNotConnected);
        }
        let shared = Arc::clone(&self.shared);
        let mut shim = IceShim { shared: &shared };
        let engine = self.engine.as_mut().ok_or(Error::ErrNotConnected)?;

        let payload = entry.msg.payload();
        let mtu = engine.data_mtu();
        let mut total_written = 0;
        while total_written < payload.len() {
            let tx_size = usize::min(mtu, payload.len() - total_written);
            let n = engine.record_send(&payload[total_written..total_written + tx_size], &mut shim)?;
            if n == 0 {
                return Err(Error::ErrSessionClosed);
            }
            total_written += n;
        }
        Ok(total_written)
    }

    /// Teardown: fail queued sends, drop cookie key and engine, notify
    /// upstream once, release the registration.
    fn clean(&mut self) {
        debug!("[{}] ending TLS worker", role_str(self.shared.is_server));

        lock(&self.shared.input).clear();

        let drained: Vec<OutboundEntry> = lock(&self.shared.output).drain(..).collect();
        for entry in drained {
            entry.complete(Err(Error::ErrNotConnected));
        }
        self.shared.can_write.store(false, Ordering::Release);

        self.cookie_key = None;

        if let Some(mut engine) = self.engine.take() {
            let shared = Arc::clone(&self.shared);
            let mut shim = IceShim { shared: &shared };
            engine.bye(&mut shim);
        }

        // A server whose handshake never completed is destroyed silently.
        let notify = {
            let info = lock(&self.shared.info);
            info.connected_notified || !self.shared.is_server
        };
        if notify {
            let info = self.shared.snapshot_info();
            self.shared
                .manager
                .transport_state(TransportState::Disconnected, &info);
        }
    }
}
