pub(crate) mod a;
pub(crate) mod aaaa;
pub(crate) mod ptr;
pub(crate) mod srv;
pub(crate) mod txt;
pub(crate) mod unknown;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

pub use a::AResource;
pub use aaaa::AaaaResource;
pub use ptr::PtrResource;
pub use srv::SrvResource;
pub use txt::TxtResource;
pub use unknown::UnknownResource;

use super::name::*;
use super::packer::*;
use super::*;
use shared::error::*;

// A Resource is a DNS resource record.
#[derive(Default, Debug)]
pub struct Resource {
    pub header: ResourceHeader,
    pub body: Option<Box<dyn ResourceBody>>,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(body) => write!(f, "{}\t{body}", self.header),
            None => write!(f, "{}\t<no body>", self.header),
        }
    }
}

impl Resource {
    /// Builds a resource of class IN for `name`; the type is taken from the body.
    pub fn new(name: Name, ttl: u32, body: Box<dyn ResourceBody>) -> Self {
        Resource {
            header: ResourceHeader {
                name,
                typ: body.real_type(),
                class: DNSCLASS_INET,
                ttl,
                length: 0,
            },
            body: Some(body),
        }
    }

    // pack appends the record to msg. The header type always follows the
    // body, and RDLENGTH is patched once the body is written.
    pub(crate) fn pack(
        &mut self,
        msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>> {
        let body = self.body.as_ref().ok_or(Error::ErrNilResourceBody)?;
        self.header.typ = body.real_type();
        let (msg, len_off) = self.header.pack(msg, compression, compression_off)?;
        let rdata_start = msg.len();
        let mut msg = body.pack(msg, compression, compression_off)?;
        self.header.length = patch_rdlength(&mut msg, len_off, rdata_start)?;
        Ok(msg)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], mut off: usize) -> Result<usize> {
        let (raw_typ, _) = unpack_uint16(msg, Name::skip(msg, off)?)?;
        off = self.header.unpack(msg, off)?;
        let (rb, off) = unpack_resource_body(raw_typ, msg, off, self.header.length as usize)?;
        self.body = Some(rb);
        Ok(off)
    }

    fn body_as<T: 'static>(&self) -> Option<&T> {
        self.body.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn a(&self) -> Option<&AResource> {
        self.body_as()
    }

    pub fn aaaa(&self) -> Option<&AaaaResource> {
        self.body_as()
    }

    pub fn ptr(&self) -> Option<&PtrResource> {
        self.body_as()
    }

    pub fn srv(&self) -> Option<&SrvResource> {
        self.body_as()
    }

    pub fn txt(&self) -> Option<&TxtResource> {
        self.body_as()
    }
}

/// Header for a DNS resource record.
///
/// ```text
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                      NAME                     |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                      TYPE                     |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                     CLASS                     |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                      TTL                      |
/// |                                               |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                   RDLENGTH                    |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                     RDATA                     |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct ResourceHeader {
    /// The domain name for which this resource record pertains.
    pub name: Name,

    /// The type of DNS resource record. Set automatically during packing.
    pub typ: DnsType,

    /// The class of the record. In mDNS responses the top bit is the
    /// cache-flush flag (RFC 6762 section 10.2).
    pub class: DnsClass,

    /// Time to live in seconds. Zero announces that the record is going away.
    pub ttl: u32,

    /// Length of RDATA. Set automatically during packing.
    pub length: u16,
}

impl fmt::Display for ResourceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.name, self.ttl, self.class, self.typ
        )
    }
}

impl ResourceHeader {
    // pack appends the wire format of the ResourceHeader to msg.
    //
    // len_off is the offset in msg where the Length field was packed.
    pub(crate) fn pack(
        &self,
        mut msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<(Vec<u8>, usize)> {
        msg = self.name.pack(msg, compression, compression_off)?;
        msg = self.typ.pack(msg);
        msg = self.class.pack(msg);
        msg = pack_uint32(msg, self.ttl);
        let len_off = msg.len();
        msg = pack_uint16(msg, self.length);
        Ok((msg, len_off))
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let off = self.name.unpack(msg, off)?;
        let off = self.typ.unpack(msg, off)?;
        let off = self.class.unpack(msg, off)?;
        let (ttl, off) = unpack_uint32(msg, off)?;
        let (length, off) = unpack_uint16(msg, off)?;
        self.ttl = ttl;
        self.length = length;
        Ok(off)
    }
}

// patch_rdlength writes the size of the RDATA that starts at rdata_start
// into the two-byte RDLENGTH field at len_off and returns it.
fn patch_rdlength(msg: &mut [u8], len_off: usize, rdata_start: usize) -> Result<u16> {
    let rdlength = msg
        .len()
        .checked_sub(rdata_start)
        .and_then(|len| u16::try_from(len).ok())
        .ok_or(Error::ErrResTooLong)?;
    msg[len_off..len_off + 2].copy_from_slice(&rdlength.to_be_bytes());
    Ok(rdlength)
}

// A ResourceBody is a DNS resource record minus the header.
pub trait ResourceBody: fmt::Display + fmt::Debug + Send + Sync {
    // real_type returns the actual type of the Resource. This is used to
    // fill in the header Type field.
    fn real_type(&self) -> DnsType;

    // pack packs a Resource except for its header.
    fn pack(
        &self,
        msg: Vec<u8>,
        compression: &mut Option<HashMap<String, usize>>,
        compression_off: usize,
    ) -> Result<Vec<u8>>;

    fn unpack(&mut self, msg: &[u8], off: usize, length: usize) -> Result<usize>;

    fn as_any(&self) -> &dyn Any;
}

pub(crate) fn unpack_resource_body(
    raw_typ: u16,
    msg: &[u8],
    mut off: usize,
    length: usize,
) -> Result<(Box<dyn ResourceBody>, usize)> {
    if off + length > msg.len() {
        return Err(Error::ErrResourceLen);
    }
    let mut rb: Box<dyn ResourceBody> = match DnsType::from(raw_typ) {
        DnsType::A => Box::<AResource>::default(),
        DnsType::Ptr => Box::<PtrResource>::default(),
        DnsType::Txt => Box::<TxtResource>::default(),
        DnsType::Aaaa => Box::<AaaaResource>::default(),
        DnsType::Srv => Box::<SrvResource>::default(),
        _ => Box::new(UnknownResource {
            typ: raw_typ,
            data: vec![],
        }),
    };

    off = rb.unpack(msg, off, length)?;

    Ok((rb, off))
}
