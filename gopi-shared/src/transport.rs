use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Transport Context with local address, peer address and the interface a
/// datagram arrived on or should leave through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Interface index; 0 means "all interfaces" on send and "unknown" on receive
    pub if_index: u32,
}

impl Default for TransportContext {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: unspecified,
            peer_addr: unspecified,
            if_index: 0,
        }
    }
}

/// A generic transmit with [TransportContext]
#[derive(Debug, Clone)]
pub struct TransportMessage<T> {
    /// Received/Sent time
    pub now: Instant,
    /// A transport context with [local_addr](TransportContext::local_addr), [peer_addr](TransportContext::peer_addr)
    /// and [if_index](TransportContext::if_index)
    pub transport: TransportContext,
    /// Message body with generic type
    pub message: T,
}

/// BytesMut type transmit with [TransportContext]
pub type TaggedBytesMut = TransportMessage<BytesMut>;
