use super::*;

// An UnknownResource carries the raw RDATA of a record type this crate does
// not interpret (HINFO, NSEC, OPT, ...). It can be decoded but not encoded.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct UnknownResource {
    pub typ: u16,
    pub data: Vec<u8>,
}

impl fmt::Display for UnknownResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // RFC 3597 generic form, without the hex dump.
        write!(f, "TYPE{} \\# {}", self.typ, self.data.len())
    }
}

impl ResourceBody for UnknownResource {
    fn real_type(&self) -> DnsType {
        DnsType::Unsupported
    }

    fn pack(
        &self,
        _msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        Err(Error::ErrUnsupportedType(self.typ))
    }

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize> {
        let end = off + length;
        if end > msg.len() {
            return Err(Error::ErrResourceLen);
        }
        self.data = msg[off..end].to_vec();
        Ok(end)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
