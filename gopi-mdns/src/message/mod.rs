#[cfg(test)]
mod message_test;

pub(crate) mod header;
pub(crate) mod name;
mod packer;
pub(crate) mod parser;
pub(crate) mod question;
pub(crate) mod resource;

use std::collections::HashMap;
use std::fmt;

pub use header::Header;
use header::*;
pub use name::Name;
use packer::*;
use parser::*;
pub use question::Question;
pub use resource::*;

use shared::error::*;

// Message formats

/// The record types an mDNS node produces or interprets. Every other type
/// decodes as [`DnsType::Unsupported`] and is carried opaquely.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DnsType {
    A = 1,
    Ptr = 12,
    Txt = 16,
    Aaaa = 28,
    Srv = 33,

    // question.Type only
    All = 255,

    #[default]
    Unsupported = 0,
}

impl From<u16> for DnsType {
    fn from(v: u16) -> Self {
        match v {
            1 => DnsType::A,
            12 => DnsType::Ptr,
            16 => DnsType::Txt,
            28 => DnsType::Aaaa,
            33 => DnsType::Srv,
            255 => DnsType::All,
            _ => DnsType::Unsupported,
        }
    }
}

impl fmt::Display for DnsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DnsType::A => "A",
            DnsType::Ptr => "PTR",
            DnsType::Txt => "TXT",
            DnsType::Aaaa => "AAAA",
            DnsType::Srv => "SRV",
            DnsType::All => "ANY",
            DnsType::Unsupported => "Unsupported",
        };
        write!(f, "{s}")
    }
}

impl DnsType {
    // pack appends the wire format of field to msg.
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        pack_uint16(msg, *self as u16)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let (t, o) = unpack_uint16(msg, off)?;
        *self = DnsType::from(t);
        Ok(o)
    }
}

/// DNS class of a question or resource record.
///
/// Only [`DNSCLASS_INET`] is used on the link. The top bit is overloaded by
/// mDNS: unicast-response in questions, cache-flush in answers.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DnsClass(pub u16);

/// Internet class (IN).
pub const DNSCLASS_INET: DnsClass = DnsClass(1);

pub(crate) const CLASS_TOP_BIT: u16 = 0x8000;

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 & !CLASS_TOP_BIT {
            1 => write!(f, "IN")?,
            other => write!(f, "CLASS{other}")?,
        }
        if self.0 & CLASS_TOP_BIT != 0 {
            write!(f, "+top")?;
        }
        Ok(())
    }
}

impl DnsClass {
    // pack appends the wire format of field to msg.
    pub(crate) fn pack(&self, msg: Vec<u8>) -> Vec<u8> {
        pack_uint16(msg, self.0)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let (c, o) = unpack_uint16(msg, off)?;
        *self = DnsClass(c);
        Ok(o)
    }
}

// An OpCode is a DNS operation code.
pub type OpCode = u16;

/// A DNS response status code.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum RCode {
    #[default]
    Success = 0,
    FormatError = 1,
    ServerFailure = 2,
    NameError = 3,
    NotImplemented = 4,
    Refused = 5,
    Unsupported,
}

impl From<u8> for RCode {
    fn from(v: u8) -> Self {
        match v {
            0 => RCode::Success,
            1 => RCode::FormatError,
            2 => RCode::ServerFailure,
            3 => RCode::NameError,
            4 => RCode::NotImplemented,
            5 => RCode::Refused,
            _ => RCode::Unsupported,
        }
    }
}

impl fmt::Display for RCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RCode::Success => "NOERROR",
            RCode::FormatError => "FORMERR",
            RCode::ServerFailure => "SERVFAIL",
            RCode::NameError => "NXDOMAIN",
            RCode::NotImplemented => "NOTIMP",
            RCode::Refused => "REFUSED",
            RCode::Unsupported => "RCODE?",
        };
        write!(f, "{s}")
    }
}

// HEADER_LEN is the length (in bytes) of a DNS header.
//
// A header is comprised of 6 uint16s and no padding.
const HEADER_LEN: usize = 6 * UINT16LEN;

const HEADER_BIT_QR: u16 = 1 << 15; // query/response (response=1)
const HEADER_BIT_AA: u16 = 1 << 10; // authoritative
const HEADER_BIT_TC: u16 = 1 << 9; // truncated
const HEADER_BIT_RD: u16 = 1 << 8; // recursion desired
const HEADER_BIT_RA: u16 = 1 << 7; // recursion available

/// Message is a representation of a DNS message.
#[derive(Default, Debug)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Resource>,
    pub authorities: Vec<Resource>,
    pub additionals: Vec<Resource>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Zone-file style, one section per block, like dig prints it.
        write!(f, ";; {}", self.header)?;
        if !self.questions.is_empty() {
            write!(f, "\n;; QUESTION")?;
            for question in &self.questions {
                write!(f, "\n{question}")?;
            }
        }
        for (title, section) in [
            ("ANSWER", &self.answers),
            ("AUTHORITY", &self.authorities),
            ("ADDITIONAL", &self.additionals),
        ] {
            if section.is_empty() {
                continue;
            }
            write!(f, "\n;; {title}")?;
            for record in section {
                write!(f, "\n{record}")?;
            }
        }
        Ok(())
    }
}

impl Message {
    // unpack parses a full Message.
    pub(crate) fn unpack(&mut self, msg: &[u8]) -> Result<()> {
        let mut p = Parser::default();
        self.header = p.start(msg)?;
        self.questions = p.all_questions()?;
        self.answers = p.all_answers()?;
        self.authorities = p.all_authorities()?;
        self.additionals = p.all_additionals()?;
        Ok(())
    }

    // pack packs a full Message. Name compression is always enabled.
    pub(crate) fn pack(&mut self) -> Result<Vec<u8>> {
        let (id, bits) = self.header.pack();
        let counts = HeaderInternal {
            id,
            bits,
            questions: section_count(self.questions.len(), Error::ErrTooManyQuestions)?,
            answers: section_count(self.answers.len(), Error::ErrTooManyAnswers)?,
            authorities: section_count(self.authorities.len(), Error::ErrTooManyAuthorities)?,
            additionals: section_count(self.additionals.len(), Error::ErrTooManyAdditionals)?,
        };

        // Most mDNS packets fit a single Ethernet frame.
        let mut msg = counts.pack(Vec::with_capacity(1500));
        let mut compression = Some(HashMap::new());
        for question in &self.questions {
            msg = question.pack(msg, &mut compression, 0)?;
        }
        for record in self
            .answers
            .iter_mut()
            .chain(self.authorities.iter_mut())
            .chain(self.additionals.iter_mut())
        {
            msg = record.pack(msg, &mut compression, 0)?;
        }
        Ok(msg)
    }

    /// Iterates answers, authorities and additionals in wire order.
    pub fn records(&self) -> impl Iterator<Item = &Resource> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }
}

fn section_count(len: usize, too_many: Error) -> Result<u16> {
    u16::try_from(len).map_err(|_| too_many)
}

/// Decodes one mDNS datagram.
///
/// Messages with a non-zero opcode or rcode, or with the truncation bit set,
/// are rejected with [`Error::ErrBadMessage`]; multicast DNS never produces
/// them and multi-packet known-answer lists are not reassembled.
pub fn decode(payload: &[u8]) -> Result<Message> {
    let mut msg = Message::default();
    msg.unpack(payload)?;
    if msg.header.op_code != 0 {
        return Err(Error::ErrBadMessage(format!(
            "opcode {}",
            msg.header.op_code
        )));
    }
    if msg.header.rcode != RCode::Success {
        return Err(Error::ErrBadMessage(format!("rcode {}", msg.header.rcode)));
    }
    if msg.header.truncated {
        return Err(Error::ErrBadMessage("truncated".to_owned()));
    }
    Ok(msg)
}

/// Encodes a message for the wire.
pub fn encode(msg: &mut Message) -> Result<Vec<u8>> {
    msg.pack()
}
