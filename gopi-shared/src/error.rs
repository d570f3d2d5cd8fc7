#![allow(dead_code)]

use std::io;
use std::net;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The coarse failure classes callers act upon.
///
/// Every [`Error`] maps onto exactly one kind through [`Error::kind`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid zone or service name, malformed TXT, missing mandatory field.
    BadParameter,
    /// Decode failed, or the message violates mDNS constraints.
    BadMessage,
    /// Malformed DNS-SD escape sequence.
    Parse,
    /// Per-interface send or receive error.
    TransportFailure,
    /// No eligible interface, or an interface index that is not bound.
    BadInterface,
    /// The transport was used after shutdown.
    TransportClosed,
    /// The event bus was used after shutdown.
    BusClosed,
    /// The surrounding operation was cancelled.
    Cancelled,
    /// Two records share the same instance name.
    Duplicate,
    Other,
}

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //Parameters
    #[error("bad parameter: {0}")]
    ErrBadParameter(String),
    #[error("duplicate instance: {0}")]
    ErrDuplicate(String),
    #[error("parse error: {0}")]
    ErrParse(String),

    //Messages
    #[error("bad message: {0}")]
    ErrBadMessage(String),
    #[error("insufficient data for base length type")]
    ErrBaseLen,
    #[error("insufficient data for calculated length type")]
    ErrCalcLen,
    #[error("segment prefix is reserved")]
    ErrReserved,
    #[error("too many pointers (>10)")]
    ErrTooManyPtr,
    #[error("invalid pointer")]
    ErrInvalidPtr,
    #[error("nil resource body")]
    ErrNilResourceBody,
    #[error("insufficient data for resource body length")]
    ErrResourceLen,
    #[error("segment length too long")]
    ErrSegTooLong,
    #[error("zero length segment")]
    ErrZeroSegLen,
    #[error("resource length too long")]
    ErrResTooLong,
    #[error("too many Questions to pack (>65535)")]
    ErrTooManyQuestions,
    #[error("too many Answers to pack (>65535)")]
    ErrTooManyAnswers,
    #[error("too many Authorities to pack (>65535)")]
    ErrTooManyAuthorities,
    #[error("too many Additionals to pack (>65535)")]
    ErrTooManyAdditionals,
    #[error("name is not in canonical format (it must end with a .)")]
    ErrNonCanonicalName,
    #[error("name too long (>255 bytes)")]
    ErrNameTooLong,
    #[error("character string exceeds maximum length (255)")]
    ErrStringTooLong,
    #[error("parsing/packing of this type isn't available yet")]
    ErrNotStarted,
    #[error("parsing/packing of this section has completed")]
    ErrSectionDone,
    #[error("unsupported record type {0}")]
    ErrUnsupportedType(u16),

    //Transport
    #[error("no eligible multicast interface")]
    ErrBadInterface,
    #[error("interface index {0} is not bound")]
    ErrUnknownInterface(u32),
    #[error("transport closed")]
    ErrTransportClosed,
    #[error("transport failure: {0}")]
    ErrTransportFailure(String),

    //Runtime
    #[error("event bus closed")]
    ErrBusClosed,
    #[error("operation cancelled")]
    ErrCancelled,
    #[error("connection closed")]
    ErrConnectionClosed,

    //Third Party Error
    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("mutex poison: {0}")]
    PoisonError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classifies the error into one of the [`ErrorKind`] buckets.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrBadParameter(_) | Error::ParseIp(_) | Error::ParseInt(_) => {
                ErrorKind::BadParameter
            }
            Error::ErrDuplicate(_) => ErrorKind::Duplicate,
            Error::ErrParse(_) | Error::Utf8(_) => ErrorKind::Parse,
            Error::ErrBadMessage(_)
            | Error::ErrBaseLen
            | Error::ErrCalcLen
            | Error::ErrReserved
            | Error::ErrTooManyPtr
            | Error::ErrInvalidPtr
            | Error::ErrNilResourceBody
            | Error::ErrResourceLen
            | Error::ErrSegTooLong
            | Error::ErrZeroSegLen
            | Error::ErrResTooLong
            | Error::ErrTooManyQuestions
            | Error::ErrTooManyAnswers
            | Error::ErrTooManyAuthorities
            | Error::ErrTooManyAdditionals
            | Error::ErrNonCanonicalName
            | Error::ErrNameTooLong
            | Error::ErrStringTooLong
            | Error::ErrNotStarted
            | Error::ErrSectionDone
            | Error::ErrUnsupportedType(_) => ErrorKind::BadMessage,
            Error::ErrBadInterface | Error::ErrUnknownInterface(_) => ErrorKind::BadInterface,
            Error::ErrTransportClosed | Error::ErrConnectionClosed => ErrorKind::TransportClosed,
            Error::ErrTransportFailure(_) | Error::Io(_) => ErrorKind::TransportFailure,
            Error::ErrBusClosed => ErrorKind::BusClosed,
            Error::ErrCancelled => ErrorKind::Cancelled,
            Error::PoisonError(_) | Error::Other(_) => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

#[cfg(not(windows))]
impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(IoError(io::Error::from(e)))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}

/// flatten_errs flattens multiple per-interface errors into one transport failure
pub fn flatten_errs(errs: Vec<impl Into<Error>>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.into().to_string()).collect();
        Err(Error::ErrTransportFailure(errs_strs.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_errs() {
        assert_eq!(flatten_errs(Vec::<Error>::new()), Ok(()));

        let err = flatten_errs(vec![
            Error::ErrUnknownInterface(3),
            Error::from(io::Error::from(io::ErrorKind::PermissionDenied)),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert!(err.to_string().contains("interface index 3 is not bound"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::ErrTooManyPtr.kind(), ErrorKind::BadMessage);
        assert_eq!(Error::ErrDuplicate("a".into()).kind(), ErrorKind::Duplicate);
        assert_eq!(Error::ErrBusClosed.kind(), ErrorKind::BusClosed);
        assert_eq!(Error::ErrParse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(Error::ErrCancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::ErrTransportClosed.kind(), ErrorKind::TransportClosed);
    }

    #[test]
    fn test_io_error_eq_by_kind() {
        let a = Error::from(io::Error::new(io::ErrorKind::WouldBlock, "a"));
        let b = Error::from(io::Error::new(io::ErrorKind::WouldBlock, "b"));
        assert_eq!(a, b);
    }
}
