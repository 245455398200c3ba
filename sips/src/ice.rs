use std::net::SocketAddr;

use shared::error::Result;

/// ICE stream-component index selecting one of the parallel channels of a
/// negotiated session.
pub type ComponentId = u16;

/// Inbound datagram callback installed on a component. Returns the number
/// of bytes consumed (always the full datagram for this transport).
pub type RecvCallback = Box<dyn FnMut(&[u8]) -> usize + Send>;

/// The negotiated ICE channel the transport sends and receives datagrams
/// on. Implemented by the surrounding ICE agent; treated here as a lossy,
/// unordered datagram pipe with a component index.
pub trait IceChannel: Send + Sync {
    /// Whether negotiation completed and the channel is usable.
    fn is_running(&self) -> bool;

    /// Whether the local agent initiated the session. The non-initiator
    /// takes the DTLS server role.
    fn is_initiator(&self) -> bool;

    /// Send one datagram on `component`. Bounded blocking; returns bytes
    /// sent.
    fn send(&self, component: ComponentId, data: &[u8]) -> Result<usize>;

    fn local_address(&self, component: ComponentId) -> SocketAddr;

    fn remote_address(&self, component: ComponentId) -> SocketAddr;

    /// Local address advertised to the SIP layer before a component pair
    /// is selected.
    fn default_local_address(&self) -> SocketAddr;

    /// Install or clear the inbound callback of `component`. The callback
    /// runs on the ICE receive-dispatch thread and must not block.
    fn set_on_recv(&self, component: ComponentId, callback: Option<RecvCallback>);
}
