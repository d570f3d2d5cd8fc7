use std::fmt;

use super::packer::*;
use super::*;
use shared::error::*;

/// Header is a representation of a DNS message header.
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub op_code: OpCode,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: RCode,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id {} opcode {} rcode {} flags", self.id, self.op_code, self.rcode)?;
        for (set, flag) in [
            (self.response, "qr"),
            (self.authoritative, "aa"),
            (self.truncated, "tc"),
            (self.recursion_desired, "rd"),
            (self.recursion_available, "ra"),
        ] {
            if set {
                write!(f, " {flag}")?;
            }
        }
        Ok(())
    }
}

impl Header {
    // pack returns the id and the packed flag bits of the header.
    pub(crate) fn pack(&self) -> (u16, u16) {
        let mut bits = ((self.op_code & 0xF) << 11) | (self.rcode as u16 & 0xF);
        if self.recursion_available {
            bits |= HEADER_BIT_RA;
        }
        if self.recursion_desired {
            bits |= HEADER_BIT_RD;
        }
        if self.truncated {
            bits |= HEADER_BIT_TC;
        }
        if self.authoritative {
            bits |= HEADER_BIT_AA;
        }
        if self.response {
            bits |= HEADER_BIT_QR;
        }

        (self.id, bits)
    }
}

#[derive(Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum Section {
    #[default]
    NotStarted = 0,
    Header = 1,
    Questions = 2,
    Answers = 3,
    Authorities = 4,
    Additionals = 5,
    Done = 6,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Section::NotStarted => "NotStarted",
            Section::Header => "Header",
            Section::Questions => "question",
            Section::Answers => "answer",
            Section::Authorities => "authority",
            Section::Additionals => "additional",
            Section::Done => "Done",
        };
        write!(f, "{s}")
    }
}

// header is the wire format for a DNS message header.
#[derive(Default, Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct HeaderInternal {
    pub(crate) id: u16,
    pub(crate) bits: u16,
    pub(crate) questions: u16,
    pub(crate) answers: u16,
    pub(crate) authorities: u16,
    pub(crate) additionals: u16,
}

impl HeaderInternal {
    pub(crate) fn count(&self, sec: Section) -> u16 {
        match sec {
            Section::Questions => self.questions,
            Section::Answers => self.answers,
            Section::Authorities => self.authorities,
            Section::Additionals => self.additionals,
            _ => 0,
        }
    }

    // pack appends the wire format of the header to msg.
    pub(crate) fn pack(&self, mut msg: Vec<u8>) -> Vec<u8> {
        msg = pack_uint16(msg, self.id);
        msg = pack_uint16(msg, self.bits);
        msg = pack_uint16(msg, self.questions);
        msg = pack_uint16(msg, self.answers);
        msg = pack_uint16(msg, self.authorities);
        pack_uint16(msg, self.additionals)
    }

    pub(crate) fn unpack(&mut self, msg: &[u8], off: usize) -> Result<usize> {
        let (id, new_off) = unpack_uint16(msg, off)?;
        self.id = id;

        let (bits, new_off) = unpack_uint16(msg, new_off)?;
        self.bits = bits;

        let (questions, new_off) = unpack_uint16(msg, new_off)?;
        self.questions = questions;

        let (answers, new_off) = unpack_uint16(msg, new_off)?;
        self.answers = answers;

        let (authorities, new_off) = unpack_uint16(msg, new_off)?;
        self.authorities = authorities;

        let (additionals, new_off) = unpack_uint16(msg, new_off)?;
        self.additionals = additionals;

        Ok(new_off)
    }

    pub(crate) fn header(&self) -> Header {
        Header {
            id: self.id,
            response: (self.bits & HEADER_BIT_QR) != 0,
            op_code: (self.bits >> 11) & 0xF,
            authoritative: (self.bits & HEADER_BIT_AA) != 0,
            truncated: (self.bits & HEADER_BIT_TC) != 0,
            recursion_desired: (self.bits & HEADER_BIT_RD) != 0,
            recursion_available: (self.bits & HEADER_BIT_RA) != 0,
            rcode: RCode::from((self.bits & 0xF) as u8),
        }
    }
}
