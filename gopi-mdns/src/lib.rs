//! # gopi-mdns
//!
//! A link-local mDNS / DNS-SD node for Rust: a service browser, a responder
//! for locally registered services and a Chromecast discovery layer, all
//! sharing one multicast transport and one event bus.
//!
//! ## Architecture
//!
//! ```text
//!  interfaces ──► MulticastTransport ──► Listener ──► EventBus ──┬─► Responder ──┐
//!                        ▲                                       ├─► Query(s)  ──┤
//!                        │                                       ├─► CastManager │
//!                        │                                       └─► your code   │
//!                        └──────────────────── PacketSink ◄──────────────────────┘
//! ```
//!
//! - The [`MulticastTransport`] joins 224.0.0.251 / ff02::fb on every
//!   multicast-capable interface and tags each datagram with the index of
//!   the interface it arrived on.
//! - The [`Listener`] decodes datagrams and publishes them as
//!   [`Event::Message`]. Malformed packets are counted and dropped.
//! - A [`Query`] is a sans-I/O [`sansio::Protocol`]: it retransmits a PTR
//!   question on a linear backoff and assembles [`ServiceRecord`]s from the
//!   answers. [`Discovery`] drives queries against the bus.
//! - The [`Responder`] answers questions for registered services on the
//!   interface they came in on, announces on registration and sends
//!   goodbyes on withdrawal.
//! - The [`CastManager`] folds `_googlecast._tcp` records into
//!   [`CastDevice`]s and reports changes as [`CastEvent`]s.
//!
//! [`MdnsNode`] wires everything together.
//!
//! ## Quick Start
//!
//! ### Browse for a service type
//!
//! ```rust,ignore
//! use gopi_mdns::{MdnsConfig, MdnsNode};
//! use std::time::Duration;
//!
//! let node = MdnsNode::start(MdnsConfig::default())?;
//! for record in node.lookup("_googlecast._tcp", Duration::from_secs(2)).await? {
//!     println!("{} at {}:{} {:?}", record.instance, record.host, record.port, record.addrs);
//! }
//! node.stop().await?;
//! ```
//!
//! ### Drive a query by hand
//!
//! ```rust
//! use gopi_mdns::{MdnsConfig, Query};
//! use sansio::Protocol;
//! use std::time::{Duration, Instant};
//!
//! let now = Instant::now();
//! let config = MdnsConfig::default();
//! let mut query = Query::new(
//!     "_googlecast._tcp.local.",
//!     "local.",
//!     &config,
//!     now,
//!     now + Duration::from_secs(1),
//! )
//! .unwrap();
//!
//! // The first question is due immediately.
//! let packet = query.poll_write().expect("should have a query packet");
//! assert_eq!(packet.transport.peer_addr.to_string(), "224.0.0.251:5353");
//!
//! // The next one after the configured backoff.
//! assert_eq!(query.poll_timeout(), Some(now + Duration::from_millis(200)));
//! ```
//!
//! ### Escape a label
//!
//! ```rust
//! use gopi_mdns::{quote, unquote};
//!
//! assert_eq!(quote("Living Room.TV"), "Living\\ Room\\.TV");
//! assert_eq!(unquote("Living\\ Room\\.TV").unwrap(), "Living Room.TV");
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod bus;
pub mod cast;
pub(crate) mod config;
pub mod discovery;
pub(crate) mod event;
pub(crate) mod listener;
pub mod message;
pub(crate) mod node;
pub(crate) mod quote;
pub(crate) mod record;
pub mod responder;
pub(crate) mod sink;
#[cfg(not(windows))]
pub(crate) mod socket;
#[cfg(not(windows))]
pub(crate) mod transport;

pub use bus::{Delivery, EventBus, Subscription, SubscriptionId};
pub use cast::{CAST_SERVICE, CastDevice, CastEvent, CastFlags, CastManager};
pub use config::{MDNS_MULTICAST_IPV4, MDNS_MULTICAST_IPV6, MDNS_PORT, MdnsConfig};
pub use discovery::{Discovery, Query, QueryError};
pub use event::{DnsMessageEvent, Event};
pub use listener::{Listener, ListenerStats};
pub use node::MdnsNode;
pub use quote::{quote, unquote};
pub use record::{SERVICE_TYPE_ENUMERATION, ServiceRecord, is_global_unicast};
pub use responder::{Responder, ResponderState};
pub use sink::PacketSink;
#[cfg(not(windows))]
pub use shared::ifaces;
#[cfg(not(windows))]
pub use socket::MulticastSocket;
#[cfg(not(windows))]
pub use transport::MulticastTransport;
