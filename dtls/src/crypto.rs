use rcgen::{CertificateParams, KeyPair};

use shared::error::{Error, Result};

/// Local identity presented during the handshake: a DER certificate chain
/// (leaf first) and the matching PKCS#8 private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub certificate: Vec<Vec<u8>>,
    pub private_key: Vec<u8>,
}

impl Identity {
    pub fn new(certificate: Vec<Vec<u8>>, private_key: Vec<u8>) -> Result<Self> {
        if certificate.is_empty() || certificate.iter().any(|c| c.is_empty()) {
            return Err(Error::ErrNoCertificate);
        }
        Ok(Identity {
            certificate,
            private_key,
        })
    }

    /// Generate a self-signed ECDSA P-256 identity for the given subject
    /// alternative names.
    pub fn generate_self_signed(subject_alt_names: Vec<String>) -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Other(e.to_string()))?;
        let params = CertificateParams::new(subject_alt_names)
            .map_err(|e| Error::Other(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Other(e.to_string()))?;

        Ok(Identity {
            certificate: vec![cert.der().to_vec()],
            private_key: key_pair.serialize_der(),
        })
    }

    /// DER of the leaf certificate.
    pub fn leaf(&self) -> &[u8] {
        &self.certificate[0]
    }
}
