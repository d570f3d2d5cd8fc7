use std::net::SocketAddr;
use std::sync::Arc;

use crate::cast::CastEvent;
use crate::message::Message;
use crate::record::ServiceRecord;

/// A decoded datagram together with where it came from.
#[derive(Debug)]
pub struct DnsMessageEvent {
    pub message: Message,
    /// Interface the datagram arrived on.
    pub if_index: u32,
    pub from: SocketAddr,
}

/// Everything that travels over the node's event bus.
///
/// Messages are shared behind an [`Arc`] since every subscriber sees the
/// same decoded packet.
#[derive(Debug, Clone)]
pub enum Event {
    Message(Arc<DnsMessageEvent>),
    Service(ServiceRecord),
    Cast(CastEvent),
}
