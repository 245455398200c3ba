use std::net::IpAddr;

use x509_parser::prelude::*;

use shared::error::{Error, Result};

/// Width of the cached serial number, left-padded with zeros.
pub const SERIAL_LENGTH: usize = 20;

/// Kind tag of a Subject Alternative Name entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SanKind {
    Ip,
    Uri,
    Rfc822,
    Dns,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanEntry {
    pub kind: SanKind,
    pub name: String,
}

/// Cached view of one X.509 certificate, local or peer.
///
/// Populated after a successful handshake or renegotiation. Re-population
/// is skipped when the issuer DN and serial number are unchanged, so
/// renegotiations with the same credentials are cheap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateInfo {
    pub version: u32,
    pub issuer: String,
    pub issuer_cn: String,
    pub subject: String,
    pub subject_cn: String,
    pub serial: [u8; SERIAL_LENGTH],
    /// Validity bounds as UTC seconds since the epoch.
    pub not_before: i64,
    pub not_after: i64,
    pub subject_alt_names: Vec<SanEntry>,
}

impl CertificateInfo {
    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    /// Refresh from a DER certificate. Returns `false` when the cached
    /// contents were kept because issuer and serial are unchanged.
    pub fn update_from_der(&mut self, der: &[u8]) -> Result<bool> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|_| Error::ErrCertificate)?;

        let issuer = cert.issuer().to_string();
        let serial = pad_serial(cert.raw_serial());

        if !self.is_empty() && self.issuer == issuer && self.serial == serial {
            return Ok(false);
        }

        *self = CertificateInfo::default();

        // An X.509 "version 3" certificate encodes 2 on the wire.
        self.version = cert.version().0 + 1;

        self.issuer_cn = dn_common_name(&issuer).to_owned();
        self.issuer = issuer;

        self.subject = cert.subject().to_string();
        self.subject_cn = dn_common_name(&self.subject).to_owned();

        self.serial = serial;

        self.not_before = cert.validity().not_before.timestamp();
        self.not_after = cert.validity().not_after.timestamp();

        if self.version >= 3 {
            if let Ok(Some(san)) = cert.subject_alternative_name() {
                for name in &san.value.general_names {
                    let entry = match name {
                        GeneralName::IPAddress(bytes) => {
                            render_ip(bytes).map(|ip| SanEntry {
                                kind: SanKind::Ip,
                                name: ip.to_string(),
                            })
                        }
                        GeneralName::URI(uri) => Some(SanEntry {
                            kind: SanKind::Uri,
                            name: (*uri).to_owned(),
                        }),
                        GeneralName::RFC822Name(mail) => Some(SanEntry {
                            kind: SanKind::Rfc822,
                            name: (*mail).to_owned(),
                        }),
                        GeneralName::DNSName(dns) => Some(SanEntry {
                            kind: SanKind::Dns,
                            name: (*dns).to_owned(),
                        }),
                        _ => None,
                    };
                    if let Some(entry) = entry {
                        if !entry.name.is_empty() {
                            self.subject_alt_names.push(entry);
                        }
                    }
                }
            }
        }

        Ok(true)
    }
}

/// `CN=` attribute value of a DN string, terminated at the first `,`.
fn dn_common_name(dn: &str) -> &str {
    match dn.find("CN=") {
        Some(pos) => {
            let cn = &dn[pos + 3..];
            match cn.find(',') {
                Some(end) => &cn[..end],
                None => cn,
            }
        }
        None => "",
    }
}

fn pad_serial(raw: &[u8]) -> [u8; SERIAL_LENGTH] {
    let mut serial = [0u8; SERIAL_LENGTH];
    if raw.len() >= SERIAL_LENGTH {
        serial.copy_from_slice(&raw[raw.len() - SERIAL_LENGTH..]);
    } else {
        serial[SERIAL_LENGTH - raw.len()..].copy_from_slice(raw);
    }
    serial
}

fn render_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Some(IpAddr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
