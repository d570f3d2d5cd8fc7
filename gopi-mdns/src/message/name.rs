use std::collections::HashMap;
use std::fmt;

use crate::quote::{join_labels, split_labels};
use shared::error::*;

const NAME_LEN: usize = 255;
const LABEL_LEN: usize = 63;
const MAX_POINTERS: usize = 10;
const MAX_COMPRESSION_OFFSET: usize = 0x3FFF;

/// A fully qualified domain name in presentation form.
///
/// Labels are stored escaped (see [`crate::quote`]), so `data` for the
/// instance "Living Room" of `_googlecast._tcp.local.` reads
/// `Living\ Room._googlecast._tcp.local.`.
#[derive(Default, PartialEq, Eq, Debug, Clone, Hash)]
pub struct Name {
    pub data: String,
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data)
    }
}

impl Name {
    pub fn new(data: &str) -> Result<Self> {
        let labels = split_labels(data)?;
        check_labels(&labels)?;
        Ok(Name {
            data: join_labels(&labels),
        })
    }

    // pack appends the wire format of the Name to msg.
    //
    // Domain names are a sequence of counted strings split at the dots. They end
    // with a zero-length string. Compression can be used to reuse domain suffixes.
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        let labels = split_labels(&self.data)?;
        check_labels(&labels)?;

        for i in 0..labels.len() {
            let suffix = join_labels(&labels[i..]);

            // We can only compress domain suffixes we have already written.
            if let Some(comp) = compression {
                if let Some(&ptr) = comp.get(&suffix) {
                    // Hit. Emit a pointer instead of the rest of the domain.
                    return Ok(super::packer::pack_uint16(msg, (ptr | 0xC000) as u16));
                }

                // Miss. Remember this suffix for later names. Pointers can only
                // address the first 16KiB of a message.
                let off = msg.len() - compression_off;
                if off <= MAX_COMPRESSION_OFFSET {
                    comp.insert(suffix, off);
                }
            }

            msg.push(labels[i].len() as u8);
            msg.extend_from_slice(&labels[i]);
        }

        msg.push(0);
        Ok(msg)
    }

    // unpack unpacks a domain name, following compression pointers.
    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let mut labels: Vec<Vec<u8>> = vec![];
        let mut curr_off = off;
        // new_off is the offset where the next record starts: right after the
        // first pointer, or right after the terminating zero label.
        let mut new_off = off;
        let mut ptr = 0;
        let mut name_len = 1;

        loop {
            if curr_off >= msg.len() {
                return Err(Error::ErrBaseLen);
            }
            let c = msg[curr_off] as usize;
            curr_off += 1;
            match c & 0xC0 {
                0x00 => {
                    if c == 0x00 {
                        // A zero length signals the end of the name.
                        break;
                    }
                    let end_off = curr_off + c;
                    if end_off > msg.len() {
                        return Err(Error::ErrCalcLen);
                    }
                    name_len += c + 1;
                    if name_len > NAME_LEN {
                        return Err(Error::ErrNameTooLong);
                    }
                    labels.push(msg[curr_off..end_off].to_vec());
                    curr_off = end_off;
                }
                0xC0 => {
                    if curr_off >= msg.len() {
                        return Err(Error::ErrInvalidPtr);
                    }
                    let c1 = msg[curr_off] as usize;
                    curr_off += 1;
                    if ptr == 0 {
                        new_off = curr_off;
                    }
                    // Don't follow too many pointers, maybe there's a loop.
                    ptr += 1;
                    if ptr > MAX_POINTERS {
                        return Err(Error::ErrTooManyPtr);
                    }
                    curr_off = ((c ^ 0xC0) << 8) | c1;
                }
                _ => {
                    // Prefixes 0x80 and 0x40 are reserved.
                    return Err(Error::ErrReserved);
                }
            }
        }
        if ptr == 0 {
            new_off = curr_off;
        }
        self.data = join_labels(&labels);
        Ok(new_off)
    }

    pub(crate) fn skip(msg: &[u8], off: usize) -> Result<usize> {
        // new_off is the offset where the next record will start. Pointers lead
        // to data that belongs to other names and thus doesn't count towards to
        // the usage of this name.
        let mut new_off = off;

        loop {
            if new_off >= msg.len() {
                return Err(Error::ErrBaseLen);
            }
            let c = msg[new_off] as usize;
            new_off += 1;
            match c & 0xC0 {
                0x00 => {
                    if c == 0x00 {
                        break;
                    }
                    new_off += c;
                    if new_off > msg.len() {
                        return Err(Error::ErrCalcLen);
                    }
                }
                0xC0 => {
                    // A pointer to somewhere else in msg. Pointers are two bytes
                    // and always terminate the name.
                    new_off += 1;
                    break;
                }
                _ => {
                    return Err(Error::ErrReserved);
                }
            }
        }

        Ok(new_off)
    }

    /// Reports whether this name ends with `suffix` on a label boundary.
    pub fn has_suffix(&self, suffix: &str) -> bool {
        has_name_suffix(&self.data, suffix)
    }
}

fn check_labels(labels: &[Vec<u8>]) -> Result<()> {
    let mut name_len = 1;
    for label in labels {
        if label.len() > LABEL_LEN {
            return Err(Error::ErrSegTooLong);
        }
        name_len += label.len() + 1;
    }
    if name_len > NAME_LEN {
        return Err(Error::ErrNameTooLong);
    }
    Ok(())
}

/// Reports whether `name` ends with `suffix`, where the suffix starts at a
/// label boundary (an unescaped dot, or the start of the name).
pub(crate) fn has_name_suffix(name: &str, suffix: &str) -> bool {
    if !name.ends_with(suffix) {
        return false;
    }
    let head = &name[..name.len() - suffix.len()];
    if head.is_empty() {
        return true;
    }
    if !head.ends_with('.') {
        return false;
    }
    // The dot must not itself be escaped: count the backslashes before it.
    let escapes = head[..head.len() - 1]
        .bytes()
        .rev()
        .take_while(|&b| b == b'\\')
        .count();
    escapes % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_new_canonicalizes_escapes() {
        let name = Name::new("Test\\'s\\ Test._gopi._tcp.local.").unwrap();
        assert_eq!(name.data, "Test\\039s\\ Test._gopi._tcp.local.");
    }

    #[test]
    fn test_name_errors() {
        assert_eq!(Name::new("local"), Err(Error::ErrNonCanonicalName));
        let long_label = format!("{}.local.", "a".repeat(64));
        assert_eq!(Name::new(&long_label), Err(Error::ErrSegTooLong));
        let long_name = format!("{}local.", "abcdefghij.".repeat(25));
        assert_eq!(Name::new(&long_name), Err(Error::ErrNameTooLong));
    }

    #[test]
    fn test_name_compression() {
        let mut compression = Some(HashMap::new());
        let a = Name::new("_gopi._tcp.local.").unwrap();
        let b = Name::new("svc._gopi._tcp.local.").unwrap();
        let msg = a.pack(vec![], &mut compression, 0).unwrap();
        let first_len = msg.len();
        let msg = b.pack(msg, &mut compression, 0).unwrap();
        // "svc" label plus a two byte pointer
        assert_eq!(msg.len() - first_len, 1 + 3 + 2);

        let mut got = Name::default();
        let off = got.unpack(&msg, first_len).unwrap();
        assert_eq!(off, msg.len());
        assert_eq!(got, b);
        assert_eq!(Name::skip(&msg, first_len).unwrap(), msg.len());
    }

    #[test]
    fn test_name_pointer_loop() {
        // A pointer to itself.
        let msg = vec![0xC0, 0x00];
        let mut name = Name::default();
        assert_eq!(name.unpack(&msg, 0), Err(Error::ErrTooManyPtr));
    }

    #[test]
    fn test_has_suffix() {
        assert!(has_name_suffix("svc._gopi._tcp.local.", "local."));
        assert!(has_name_suffix("local.", "local."));
        assert!(!has_name_suffix("svc.xlocal.", "local."));
        assert!(!has_name_suffix("svc\\.local.", "local."));
        assert!(has_name_suffix("svc\\\\.local.", "local."));
    }
}
