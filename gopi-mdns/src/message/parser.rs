use super::header::*;
use super::question::*;
use super::resource::*;
use super::*;

// A Parser walks the sections of a packed DNS message in order.
//
// Section counts come from the header; each all_* call consumes its section
// and moves on to the next one.
#[derive(Default)]
pub(crate) struct Parser<'a> {
    msg: &'a [u8],
    header: HeaderInternal,

    section: Section,
    off: usize,
    index: usize,
}

impl<'a> Parser<'a> {
    // start parses the header and enables the parsing of questions.
    pub(crate) fn start(&mut self, msg: &'a [u8]) -> Result<Header> {
        *self = Parser {
            msg,
            ..Default::default()
        };
        if msg.len() < HEADER_LEN {
            return Err(Error::ErrBaseLen);
        }
        self.off = self.header.unpack(msg, 0)?;
        self.section = Section::Questions;
        Ok(self.header.header())
    }

    fn check_advance(&mut self, sec: Section) -> Result<bool> {
        if self.section < sec {
            return Err(Error::ErrNotStarted);
        }
        if self.section > sec {
            return Err(Error::ErrSectionDone);
        }
        if self.index == self.header.count(sec) as usize {
            self.index = 0;
            self.section = next_section(self.section);
            return Ok(false);
        }
        Ok(true)
    }

    fn question(&mut self) -> Result<Option<Question>> {
        if !self.check_advance(Section::Questions)? {
            return Ok(None);
        }
        let mut q = Question::default();
        self.off = q.unpack(self.msg, self.off)?;
        self.index += 1;
        Ok(Some(q))
    }

    // all_questions parses all questions.
    pub(crate) fn all_questions(&mut self) -> Result<Vec<Question>> {
        // mDNS queriers routinely batch several questions into one packet.
        let mut qs = Vec::with_capacity(self.header.questions as usize);
        while let Some(q) = self.question()? {
            qs.push(q);
        }
        Ok(qs)
    }

    fn resource(&mut self, sec: Section) -> Result<Option<Resource>> {
        if !self.check_advance(sec)? {
            return Ok(None);
        }
        let mut r = Resource::default();
        self.off = r.unpack(self.msg, self.off)?;
        self.index += 1;
        Ok(Some(r))
    }

    fn all_resources(&mut self, sec: Section) -> Result<Vec<Resource>> {
        let mut rs = Vec::with_capacity(self.header.count(sec) as usize);
        while let Some(r) = self.resource(sec)? {
            rs.push(r);
        }
        Ok(rs)
    }

    pub(crate) fn all_answers(&mut self) -> Result<Vec<Resource>> {
        self.all_resources(Section::Answers)
    }

    pub(crate) fn all_authorities(&mut self) -> Result<Vec<Resource>> {
        self.all_resources(Section::Authorities)
    }

    pub(crate) fn all_additionals(&mut self) -> Result<Vec<Resource>> {
        self.all_resources(Section::Additionals)
    }
}

fn next_section(sec: Section) -> Section {
    match sec {
        Section::NotStarted => Section::Header,
        Section::Header => Section::Questions,
        Section::Questions => Section::Answers,
        Section::Answers => Section::Authorities,
        Section::Authorities => Section::Additionals,
        Section::Additionals | Section::Done => Section::Done,
    }
}
