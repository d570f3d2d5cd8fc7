use std::net::Ipv4Addr;

use super::*;

// An AResource is an A Resource record.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AResource {
    pub a: [u8; 4],
}

impl AResource {
    pub fn new(addr: Ipv4Addr) -> Self {
        AResource { a: addr.octets() }
    }

    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.a)
    }
}

impl fmt::Display for AResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

impl ResourceBody for AResource {
    fn real_type(&self) -> DnsType {
        DnsType::A
    }

    // pack appends the wire format of the AResource to msg.
    fn pack(
        &self,
        msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        Ok(pack_bytes(msg, &self.a))
    }

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize> {
        if length != self.a.len() {
            return Err(Error::ErrResourceLen);
        }
        unpack_bytes(msg, off, &mut self.a)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
