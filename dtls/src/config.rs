use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use x509_parser::prelude::{FromDer, X509Certificate};

use shared::error::{Error, Result};

use crate::crypto::Identity;
use crate::{ProtocolVersion, DTLS_RECORD_MTU, PROTOCOL_VERSION_DTLS1_0};

/// Application hook checking the peer chain after the built-in
/// verification ran. `status` is the engine's verification bitmask
/// (0 = verified), `chain` the DER certificates leaf first. Any error fails
/// the handshake.
pub type CertCheckFn = Arc<dyn (Fn(u32, &[Vec<u8>]) -> Result<()>) + Send + Sync>;

/// Default wall-clock limit for the whole handshake.
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of a queued outbound SIP request, matching the SIP
/// transaction timeout (64*T1).
pub(crate) const DEFAULT_TXN_DEADLINE: Duration = Duration::from_secs(32);

/// Cipher selection profile handed to the engine.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SecurityProfile {
    /// 192-bit security level suites only.
    #[default]
    Secure192,
    /// Whatever the engine considers safe defaults.
    Default,
}

/// Negotiation preferences: suite profile, protocol version, and whether
/// the server's suite order wins.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Priority {
    pub profile: SecurityProfile,
    pub version: ProtocolVersion,
    pub server_precedence: bool,
}

impl Default for Priority {
    fn default() -> Self {
        Priority {
            profile: SecurityProfile::Secure192,
            version: PROTOCOL_VERSION_DTLS1_0,
            server_precedence: true,
        }
    }
}

/// TlsConfigBuilder collects the TLS settings of one transport. After
/// `build()` the configuration is immutable.
#[derive(Default, Clone)]
pub struct TlsConfigBuilder {
    ca_list: Option<PathBuf>,
    identity: Option<Identity>,
    cert_check: Option<CertCheckFn>,
    handshake_timeout: Option<Duration>,
    txn_deadline: Option<Duration>,
    mtu: usize,
    priority: Option<Priority>,
}

impl TlsConfigBuilder {
    /// Path of the CA bundle used to verify the peer. PEM, with a raw DER
    /// fallback. Not setting it disables CA pinning.
    pub fn with_ca_list(mut self, ca_list: PathBuf) -> Self {
        self.ca_list = Some(ca_list);
        self
    }

    /// Local certificate and key presented to the peer. Servers must set
    /// this; clients should, since the server requires a client
    /// certificate.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Application verification hook, called after the engine verified the
    /// peer chain.
    pub fn with_cert_check(mut self, cert_check: CertCheckFn) -> Self {
        self.cert_check = Some(cert_check);
        self
    }

    /// Wall-clock deadline for the whole handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Lifetime of a queued outbound SIP request before it is dropped with
    /// a timeout completion.
    pub fn with_txn_deadline(mut self, deadline: Duration) -> Self {
        self.txn_deadline = Some(deadline);
        self
    }

    /// Record-layer MTU handed to the engine (default 3200).
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Load the trust anchors and freeze the configuration.
    pub fn build(self) -> Result<TlsConfig> {
        let trust_anchors = match &self.ca_list {
            Some(path) => load_trust_anchors(path)?,
            None => vec![],
        };

        Ok(TlsConfig {
            trust_anchors,
            identity: self.identity,
            cert_check: self.cert_check,
            handshake_timeout: self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            txn_deadline: self.txn_deadline.unwrap_or(DEFAULT_TXN_DEADLINE),
            mtu: if self.mtu == 0 { DTLS_RECORD_MTU } else { self.mtu },
            priority: self.priority.unwrap_or_default(),
        })
    }
}

/// Immutable TLS settings of one transport.
#[derive(Clone)]
pub struct TlsConfig {
    /// DER trust anchors the peer chain is verified against. Empty means
    /// no CA pinning.
    pub trust_anchors: Vec<Vec<u8>>,
    pub identity: Option<Identity>,
    pub cert_check: Option<CertCheckFn>,
    pub handshake_timeout: Duration,
    pub txn_deadline: Duration,
    pub mtu: usize,
    pub priority: Priority,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("trust_anchors", &self.trust_anchors.len())
            .field("identity", &self.identity.is_some())
            .field("cert_check", &self.cert_check.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("txn_deadline", &self.txn_deadline)
            .field("mtu", &self.mtu)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Read a CA bundle as PEM; fall back to treating the whole file as one
/// DER certificate.
fn load_trust_anchors(path: &PathBuf) -> Result<Vec<Vec<u8>>> {
    let raw = fs::read(path).map_err(|e| {
        warn!("can't read CA list {}: {}", path.display(), e);
        Error::ErrLoadCaList
    })?;

    let mut reader = raw.as_slice();
    let pem: Vec<Vec<u8>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .map(|c| c.to_vec())
        .collect();

    let anchors = if pem.is_empty() { vec![raw] } else { pem };

    for der in &anchors {
        if X509Certificate::from_der(der).is_err() {
            warn!("CA list {} is neither PEM nor DER", path.display());
            return Err(Error::ErrLoadCaList);
        }
    }

    Ok(anchors)
}

#[cfg(test)]
mod test {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use std::io::Write;

    fn self_signed() -> (String, Vec<u8>) {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = CertificateParams::new(vec!["ca.example.org".to_owned()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        (cert.pem(), cert.der().to_vec())
    }

    #[test]
    fn test_defaults() {
        let config = TlsConfigBuilder::default().build().unwrap();
        assert!(config.trust_anchors.is_empty());
        assert!(config.identity.is_none());
        assert_eq!(config.mtu, DTLS_RECORD_MTU);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.txn_deadline, DEFAULT_TXN_DEADLINE);
        assert_eq!(config.priority.profile, SecurityProfile::Secure192);
        assert_eq!(config.priority.version, PROTOCOL_VERSION_DTLS1_0);
        assert!(config.priority.server_precedence);
    }

    #[test]
    fn test_ca_list_pem() {
        let (pem, _) = self_signed();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(pem.as_bytes()).unwrap();

        let config = TlsConfigBuilder::default()
            .with_ca_list(file.path().to_path_buf())
            .build()
            .unwrap();
        assert_eq!(config.trust_anchors.len(), 1);
    }

    #[test]
    fn test_ca_list_der_fallback() {
        let (_, der) = self_signed();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&der).unwrap();

        let config = TlsConfigBuilder::default()
            .with_ca_list(file.path().to_path_buf())
            .build()
            .unwrap();
        assert_eq!(config.trust_anchors, vec![der]);
    }

    #[test]
    fn test_ca_list_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"neither pem nor der").unwrap();

        let err = TlsConfigBuilder::default()
            .with_ca_list(file.path().to_path_buf())
            .build()
            .unwrap_err();
        assert_eq!(err, Error::ErrLoadCaList);
    }

    #[test]
    fn test_ca_list_missing_file() {
        let err = TlsConfigBuilder::default()
            .with_ca_list(PathBuf::from("/nonexistent/ca.pem"))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::ErrLoadCaList);
    }
}
