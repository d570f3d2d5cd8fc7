use super::*;

// A TxtResource is a TXT Resource record.
//
// Entries are decoded lossily: DNS-SD keys are ASCII, and a peer sending
// invalid UTF-8 in a value should not cost us the whole record. Zero-length
// strings are dropped; an empty list is packed as the single empty string
// RFC 6763 section 6.1 asks for.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TxtResource {
    pub txt: Vec<String>,
}

impl fmt::Display for TxtResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.txt {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{entry:?}")?;
            first = false;
        }
        Ok(())
    }
}

impl ResourceBody for TxtResource {
    fn real_type(&self) -> DnsType {
        DnsType::Txt
    }

    // pack appends the wire format of the TxtResource to msg.
    fn pack(
        &self,
        mut msg: Vec<u8>,
        _compression: &mut Option<HashMap<String, usize>>,
        _compression_off: usize,
    ) -> Result<Vec<u8>> {
        if self.txt.is_empty() {
            return pack_text(msg, &[]);
        }
        for s in &self.txt {
            msg = pack_text(msg, s.as_bytes())?;
        }
        Ok(msg)
    }

    fn unpack(&mut self, msg: &[u8], mut off: usize, length: usize) -> Result<usize> {
        let end = off + length;
        let mut txts = vec![];
        while off < end {
            let (t, new_off) = unpack_text(msg, off)?;
            // Check if we got too many bytes.
            if new_off > end {
                return Err(Error::ErrCalcLen);
            }
            off = new_off;
            if !t.is_empty() {
                txts.push(String::from_utf8_lossy(&t).into_owned());
            }
        }
        self.txt = txts;
        Ok(off)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
