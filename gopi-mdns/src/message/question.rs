use std::collections::HashMap;
use std::fmt;

use super::name::*;
use super::*;
use shared::error::Result;

// A question is a DNS query.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Question {
    pub name: Name,
    pub typ: DnsType,
    pub class: DnsClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.name, self.class, self.typ)
    }
}

impl Question {
    // pack appends the wire format of the question to msg.
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        msg = self.name.pack(msg, compression, compression_off)?;
        msg = self.typ.pack(msg);
        Ok(self.class.pack(msg))
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let mut new_off = self.name.unpack(msg, off)?;
        new_off = self.typ.unpack(msg, new_off)?;
        self.class.unpack(msg, new_off)
    }

    /// The top bit of the class asks for a unicast rather than a multicast
    /// answer (RFC 6762 section 5.4).
    pub fn unicast_response(&self) -> bool {
        self.class.0 & CLASS_TOP_BIT != 0
    }
}
