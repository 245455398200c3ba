use std::fmt;

/// IANA cipher suite identifiers the transport can negotiate.
///
/// The `secure-192` priority profile maps to the AES-256/SHA-384 class
/// suites; the AES-128 GCM suites are kept for peers that only offer the
/// baseline WebRTC set.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CipherSuiteId {
    Tls_Ecdhe_Ecdsa_With_Aes_128_Gcm_Sha256 = 0xc02b,
    Tls_Ecdhe_Rsa_With_Aes_128_Gcm_Sha256 = 0xc02f,
    Tls_Ecdhe_Ecdsa_With_Aes_256_Gcm_Sha384 = 0xc02c,
    Tls_Ecdhe_Rsa_With_Aes_256_Gcm_Sha384 = 0xc030,
    Tls_Ecdhe_Ecdsa_With_Aes_256_Cbc_Sha = 0xc00a,
    Tls_Ecdhe_Rsa_With_Aes_256_Cbc_Sha = 0xc014,
    Unsupported = 0x0000,
}

impl fmt::Display for CipherSuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_128_Gcm_Sha256 => {
                write!(f, "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256")
            }
            CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_128_Gcm_Sha256 => {
                write!(f, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256")
            }
            CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_256_Gcm_Sha384 => {
                write!(f, "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384")
            }
            CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_256_Gcm_Sha384 => {
                write!(f, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384")
            }
            CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_256_Cbc_Sha => {
                write!(f, "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA")
            }
            CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_256_Cbc_Sha => {
                write!(f, "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA")
            }
            CipherSuiteId::Unsupported => write!(f, "Unsupported CipherSuite"),
        }
    }
}

impl From<u16> for CipherSuiteId {
    fn from(val: u16) -> Self {
        match val {
            0xc02b => CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_128_Gcm_Sha256,
            0xc02f => CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_128_Gcm_Sha256,
            0xc02c => CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_256_Gcm_Sha384,
            0xc030 => CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_256_Gcm_Sha384,
            0xc00a => CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_256_Cbc_Sha,
            0xc014 => CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_256_Cbc_Sha,
            _ => CipherSuiteId::Unsupported,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cipher_suite_id_roundtrip() {
        let ids = [
            CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_128_Gcm_Sha256,
            CipherSuiteId::Tls_Ecdhe_Rsa_With_Aes_256_Gcm_Sha384,
            CipherSuiteId::Tls_Ecdhe_Ecdsa_With_Aes_256_Cbc_Sha,
        ];
        for id in ids {
            assert_eq!(CipherSuiteId::from(id as u16), id);
        }
        assert_eq!(CipherSuiteId::from(0x1234), CipherSuiteId::Unsupported);
    }
}
