#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(all(feature = "ifaces", not(windows)))]
pub mod ifaces;

pub mod error;
pub(crate) mod transport;

pub use transport::{TaggedBytesMut, TransportContext, TransportMessage};
