#![warn(rust_2018_idioms)]

//! Secure SIP signaling transport over an ICE datagram channel.
//!
//! One [`transport::SipsIceTransport`] binds one ICE component and owns a
//! dedicated worker that drives a DTLS engine over it: the server side runs
//! a stateless cookie exchange first, both sides then hand decrypted
//! records to the upstream SIP transport manager and flush queued outbound
//! messages through the record layer.

pub mod ice;
pub mod manager;
pub mod message;
pub mod transport;
