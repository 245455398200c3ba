//! Stateless cookie exchange for the server side of the handshake
//! (RFC 6347 section 4.2.1).
//!
//! No session state exists while this runs: the first ClientHello is
//! answered with a HelloVerifyRequest carrying an HMAC cookie over the
//! client's address, and only a ClientHello echoing that cookie produces
//! a [`Prestate`] that seeds the real session.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use shared::error::{Error, Result};

use crate::{ProtocolVersion, PROTOCOL_VERSION_DTLS1_0, PROTOCOL_VERSION_DTLS1_2};

pub(crate) const COOKIE_LENGTH: usize = 20;
pub(crate) const COOKIE_KEY_LENGTH: usize = 32;
pub(crate) const RANDOM_LENGTH: usize = 32;

pub(crate) const CONTENT_TYPE_HANDSHAKE: u8 = 22;
pub(crate) const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;
pub(crate) const HANDSHAKE_TYPE_HELLO_VERIFY_REQUEST: u8 = 3;

pub(crate) const RECORD_LAYER_HEADER_SIZE: usize = 13;
pub(crate) const HANDSHAKE_HEADER_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Random key the cookie MAC is derived from. One per listening session,
/// generated at setup and dropped at teardown.
pub struct CookieKey([u8; COOKIE_KEY_LENGTH]);

impl CookieKey {
    pub fn generate() -> Self {
        let mut key = [0u8; COOKIE_KEY_LENGTH];
        rand::rng().fill(key.as_mut_slice());
        CookieKey(key)
    }

    fn mac(&self, remote: &SocketAddr, random: &[u8; RANDOM_LENGTH]) -> [u8; COOKIE_LENGTH] {
        let mut hmac = HmacSha256::new_from_slice(&self.0)
            .expect("hmac accepts any key length");
        match remote.ip() {
            std::net::IpAddr::V4(ip) => hmac.update(&ip.octets()),
            std::net::IpAddr::V6(ip) => hmac.update(&ip.octets()),
        }
        hmac.update(&remote.port().to_be_bytes());
        hmac.update(random);
        let digest = hmac.finalize().into_bytes();

        let mut cookie = [0u8; COOKIE_LENGTH];
        cookie.copy_from_slice(&digest[..COOKIE_LENGTH]);
        cookie
    }
}

/// Session seed produced by a successful cookie verification. The server
/// engine resumes at these sequence numbers: the HelloVerifyRequest already
/// consumed record sequence 0 and handshake sequence 0 on our side, and the
/// peer's second ClientHello fixes where its own counters stand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prestate {
    pub record_sequence: u64,
    pub handshake_sequence: u16,
    pub peer_record_sequence: u64,
    pub peer_handshake_sequence: u16,
}

/// The subset of a ClientHello the cookie exchange inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHello {
    pub record_version: ProtocolVersion,
    pub record_sequence: u64,
    pub message_sequence: u16,
    pub version: ProtocolVersion,
    pub random: [u8; RANDOM_LENGTH],
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
}

impl ClientHello {
    /// Parse the first record of a datagram as an unfragmented ClientHello.
    /// Anything else is an error; cookie-phase datagrams that fail to parse
    /// are silently discarded by the caller (RFC 6347 section 4.1.2.7).
    pub fn unmarshal(datagram: &[u8]) -> Result<Self> {
        let mut buf = datagram;

        if buf.remaining() < RECORD_LAYER_HEADER_SIZE {
            return Err(Error::ErrShortPacket);
        }
        let content_type = buf.get_u8();
        let record_version = ProtocolVersion {
            major: buf.get_u8(),
            minor: buf.get_u8(),
        };
        let _epoch = buf.get_u16();
        let record_sequence = get_u48(&mut buf);
        let record_len = buf.get_u16() as usize;

        if content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(Error::ErrUnexpectedPacket);
        }
        if record_version != PROTOCOL_VERSION_DTLS1_0 && record_version != PROTOCOL_VERSION_DTLS1_2
        {
            return Err(Error::ErrUnsupportedProtocolVersion);
        }
        if buf.remaining() < record_len || record_len < HANDSHAKE_HEADER_SIZE {
            return Err(Error::ErrShortPacket);
        }
        let mut buf = &buf[..record_len];

        let msg_type = buf.get_u8();
        let length = get_u24(&mut buf);
        let message_sequence = buf.get_u16();
        let fragment_offset = get_u24(&mut buf);
        let fragment_length = get_u24(&mut buf);

        if msg_type != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(Error::ErrUnexpectedPacket);
        }
        // A fragmented ClientHello cannot be cookie-verified statelessly.
        if fragment_offset != 0 || fragment_length != length {
            return Err(Error::ErrUnexpectedPacket);
        }
        if buf.remaining() < length as usize {
            return Err(Error::ErrShortPacket);
        }

        if buf.remaining() < 2 + RANDOM_LENGTH + 1 {
            return Err(Error::ErrShortPacket);
        }
        let version = ProtocolVersion {
            major: buf.get_u8(),
            minor: buf.get_u8(),
        };
        let mut random = [0u8; RANDOM_LENGTH];
        buf.copy_to_slice(&mut random);

        let session_id_len = buf.get_u8() as usize;
        if buf.remaining() < session_id_len + 1 {
            return Err(Error::ErrShortPacket);
        }
        let session_id = buf[..session_id_len].to_vec();
        buf.advance(session_id_len);

        let cookie_len = buf.get_u8() as usize;
        if buf.remaining() < cookie_len + 2 {
            return Err(Error::ErrShortPacket);
        }
        let cookie = buf[..cookie_len].to_vec();
        buf.advance(cookie_len);

        let suites_len = buf.get_u16() as usize;
        if suites_len % 2 != 0 || buf.remaining() < suites_len + 1 {
            return Err(Error::ErrShortPacket);
        }
        let mut cipher_suites = Vec::with_capacity(suites_len / 2);
        for _ in 0..suites_len / 2 {
            cipher_suites.push(buf.get_u16());
        }

        let compression_len = buf.get_u8() as usize;
        if buf.remaining() < compression_len {
            return Err(Error::ErrShortPacket);
        }
        let compression_methods = buf[..compression_len].to_vec();

        // Extensions, if any, are irrelevant to the cookie exchange.

        Ok(ClientHello {
            record_version,
            record_sequence,
            message_sequence,
            version,
            random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
        })
    }

    /// Serialize into a single-record datagram.
    pub fn marshal(&self) -> Vec<u8> {
        let body_len = 2
            + RANDOM_LENGTH
            + 1
            + self.session_id.len()
            + 1
            + self.cookie.len()
            + 2
            + self.cipher_suites.len() * 2
            + 1
            + self.compression_methods.len();

        let mut out = BytesMut::with_capacity(RECORD_LAYER_HEADER_SIZE + HANDSHAKE_HEADER_SIZE + body_len);
        out.put_u8(CONTENT_TYPE_HANDSHAKE);
        out.put_u8(self.record_version.major);
        out.put_u8(self.record_version.minor);
        out.put_u16(0); // epoch
        put_u48(&mut out, self.record_sequence);
        out.put_u16((HANDSHAKE_HEADER_SIZE + body_len) as u16);

        out.put_u8(HANDSHAKE_TYPE_CLIENT_HELLO);
        put_u24(&mut out, body_len as u32);
        out.put_u16(self.message_sequence);
        put_u24(&mut out, 0);
        put_u24(&mut out, body_len as u32);

        out.put_u8(self.version.major);
        out.put_u8(self.version.minor);
        out.put_slice(&self.random);
        out.put_u8(self.session_id.len() as u8);
        out.put_slice(&self.session_id);
        out.put_u8(self.cookie.len() as u8);
        out.put_slice(&self.cookie);
        out.put_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            out.put_u16(*suite);
        }
        out.put_u8(self.compression_methods.len() as u8);
        out.put_slice(&self.compression_methods);

        out.to_vec()
    }
}

/// HelloVerifyRequest answering a ClientHello whose cookie did not verify.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloVerifyRequest {
    pub version: ProtocolVersion,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn marshal(&self) -> Vec<u8> {
        let body_len = 2 + 1 + self.cookie.len();

        let mut out =
            BytesMut::with_capacity(RECORD_LAYER_HEADER_SIZE + HANDSHAKE_HEADER_SIZE + body_len);
        out.put_u8(CONTENT_TYPE_HANDSHAKE);
        out.put_u8(PROTOCOL_VERSION_DTLS1_0.major);
        out.put_u8(PROTOCOL_VERSION_DTLS1_0.minor);
        out.put_u16(0); // epoch
        put_u48(&mut out, 0);
        out.put_u16((HANDSHAKE_HEADER_SIZE + body_len) as u16);

        out.put_u8(HANDSHAKE_TYPE_HELLO_VERIFY_REQUEST);
        put_u24(&mut out, body_len as u32);
        out.put_u16(0);
        put_u24(&mut out, 0);
        put_u24(&mut out, body_len as u32);

        out.put_u8(self.version.major);
        out.put_u8(self.version.minor);
        out.put_u8(self.cookie.len() as u8);
        out.put_slice(&self.cookie);

        out.to_vec()
    }

    pub fn unmarshal(datagram: &[u8]) -> Result<Self> {
        let mut buf = datagram;

        if buf.remaining() < RECORD_LAYER_HEADER_SIZE + HANDSHAKE_HEADER_SIZE {
            return Err(Error::ErrShortPacket);
        }
        let content_type = buf.get_u8();
        buf.advance(RECORD_LAYER_HEADER_SIZE - 1);
        if content_type != CONTENT_TYPE_HANDSHAKE {
            return Err(Error::ErrUnexpectedPacket);
        }

        let msg_type = buf.get_u8();
        buf.advance(HANDSHAKE_HEADER_SIZE - 1);
        if msg_type != HANDSHAKE_TYPE_HELLO_VERIFY_REQUEST {
            return Err(Error::ErrUnexpectedPacket);
        }

        if buf.remaining() < 3 {
            return Err(Error::ErrShortPacket);
        }
        let version = ProtocolVersion {
            major: buf.get_u8(),
            minor: buf.get_u8(),
        };
        let cookie_len = buf.get_u8() as usize;
        if buf.remaining() < cookie_len {
            return Err(Error::ErrShortPacket);
        }

        Ok(HelloVerifyRequest {
            version,
            cookie: buf[..cookie_len].to_vec(),
        })
    }
}

/// Check the datagram's cookie against `key` and `remote`.
///
/// `Ok(Some(prestate))` means the cookie verified and a session may be
/// opened; `Ok(None)` means the client must first be challenged with
/// [`respond`]; `Err` means the datagram is not a parseable ClientHello and
/// must be dropped without a response.
pub fn verify(key: &CookieKey, remote: &SocketAddr, datagram: &[u8]) -> Result<Option<Prestate>> {
    let hello = ClientHello::unmarshal(datagram)?;
    let expected = key.mac(remote, &hello.random);

    if hello.cookie != expected {
        return Ok(None);
    }

    Ok(Some(Prestate {
        record_sequence: 1,
        handshake_sequence: 1,
        peer_record_sequence: hello.record_sequence,
        peer_handshake_sequence: hello.message_sequence,
    }))
}

/// Build the HelloVerifyRequest datagram challenging `datagram`'s sender.
pub fn respond(key: &CookieKey, remote: &SocketAddr, datagram: &[u8]) -> Result<Vec<u8>> {
    let hello = ClientHello::unmarshal(datagram)?;
    let hvr = HelloVerifyRequest {
        version: PROTOCOL_VERSION_DTLS1_0,
        cookie: key.mac(remote, &hello.random).to_vec(),
    };
    Ok(hvr.marshal())
}

fn get_u24(buf: &mut &[u8]) -> u32 {
    let hi = buf.get_u8() as u32;
    let lo = buf.get_u16() as u32;
    (hi << 16) | lo
}

fn put_u24(buf: &mut BytesMut, val: u32) {
    buf.put_u8((val >> 16) as u8);
    buf.put_u16(val as u16);
}

fn get_u48(buf: &mut &[u8]) -> u64 {
    let hi = buf.get_u16() as u64;
    let lo = buf.get_u32() as u64;
    (hi << 32) | lo
}

fn put_u48(buf: &mut BytesMut, val: u64) {
    buf.put_u16((val >> 32) as u16);
    buf.put_u32(val as u32);
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_hello(cookie: Vec<u8>) -> ClientHello {
        ClientHello {
            record_version: PROTOCOL_VERSION_DTLS1_0,
            record_sequence: 0,
            message_sequence: 0,
            version: PROTOCOL_VERSION_DTLS1_2,
            random: [7u8; RANDOM_LENGTH],
            session_id: vec![],
            cookie,
            cipher_suites: vec![0xc02b, 0xc02c],
            compression_methods: vec![0],
        }
    }

    fn remote() -> SocketAddr {
        "198.51.100.3:5061".parse().unwrap()
    }

    #[test]
    fn test_client_hello_roundtrip() {
        let hello = test_hello(vec![0xaa; COOKIE_LENGTH]);
        let parsed = ClientHello::unmarshal(&hello.marshal()).unwrap();
        assert_eq!(parsed, hello);
    }

    #[test]
    fn test_missing_cookie_is_challenged() {
        let key = CookieKey::generate();
        let datagram = test_hello(vec![]).marshal();

        assert_eq!(verify(&key, &remote(), &datagram).unwrap(), None);

        let hvr_bytes = respond(&key, &remote(), &datagram).unwrap();
        let hvr = HelloVerifyRequest::unmarshal(&hvr_bytes).unwrap();
        assert_eq!(hvr.cookie.len(), COOKIE_LENGTH);
    }

    #[test]
    fn test_echoed_cookie_verifies() {
        let key = CookieKey::generate();
        let first = test_hello(vec![]).marshal();
        let hvr = HelloVerifyRequest::unmarshal(&respond(&key, &remote(), &first).unwrap()).unwrap();

        let mut second = test_hello(hvr.cookie);
        second.message_sequence = 1;
        second.record_sequence = 1;

        let prestate = verify(&key, &remote(), &second.marshal())
            .unwrap()
            .expect("cookie must verify");
        assert_eq!(
            prestate,
            Prestate {
                record_sequence: 1,
                handshake_sequence: 1,
                peer_record_sequence: 1,
                peer_handshake_sequence: 1,
            }
        );
    }

    #[test]
    fn test_cookie_is_address_bound() {
        let key = CookieKey::generate();
        let first = test_hello(vec![]).marshal();
        let hvr = HelloVerifyRequest::unmarshal(&respond(&key, &remote(), &first).unwrap()).unwrap();

        let second = test_hello(hvr.cookie).marshal();
        let elsewhere: SocketAddr = "203.0.113.9:5061".parse().unwrap();
        assert_eq!(verify(&key, &elsewhere, &second).unwrap(), None);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let key = CookieKey::generate();
        assert!(verify(&key, &remote(), b"not a dtls record").is_err());
        assert!(verify(&key, &remote(), &[]).is_err());

        // Right content type, truncated handshake.
        let mut datagram = test_hello(vec![]).marshal();
        datagram.truncate(RECORD_LAYER_HEADER_SIZE + 4);
        assert!(verify(&key, &remote(), &datagram).is_err());
    }

    #[test]
    fn test_non_client_hello_is_rejected() {
        let key = CookieKey::generate();
        let hvr = HelloVerifyRequest {
            version: PROTOCOL_VERSION_DTLS1_0,
            cookie: vec![1; COOKIE_LENGTH],
        };
        assert_eq!(
            verify(&key, &remote(), &hvr.marshal()),
            Err(Error::ErrUnexpectedPacket)
        );
    }
}
