use shared::error::Result;

/// Outbound half of a transport.
///
/// `if_index == 0` sends on every bound interface of both families; any other
/// value sends only through that interface. Delivery is best-effort per
/// interface: one failing interface does not stop the others, and the
/// failures are reported together.
pub trait PacketSink: Send + Sync {
    fn send(&self, payload: &[u8], if_index: u32) -> Result<()>;
}
