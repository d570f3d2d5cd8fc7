use std::net::Ipv6Addr;

use super::*;

// An AaaaResource is an AAAA Resource record.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AaaaResource {
    pub aaaa: [u8; 16],
}

impl AaaaResource {
    pub fn new(addr: Ipv6Addr) -> Self {
        AaaaResource {
            aaaa: addr.octets(),
        }
    }

    pub fn addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.aaaa)
    }
}

impl fmt::Display for AaaaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

impl ResourceBody for AaaaResource {
    fn real_type(&self) -> DnsType {
        DnsType::Aaaa
    }

    // pack appends the wire format of the AaaaResource to msg.
    fn pack(
        &self,
        msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        Ok(pack_bytes(msg, &self.aaaa))
    }

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize> {
        if length != self.aaaa.len() {
            return Err(Error::ErrResourceLen);
        }
        unpack_bytes(msg, off, &mut self.aaaa)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
