//! Configuration for an mDNS node.
//!
//! This module provides the [`MdnsConfig`] struct shared by the transport,
//! the event bus, the query engine and the responder.
//!
//! # Examples
//!
//! ## Browsing only
//!
//! ```rust
//! use gopi_mdns::MdnsConfig;
//! use std::time::Duration;
//!
//! let config = MdnsConfig::default()
//!     .with_query_backoff(Duration::from_millis(100)); // Faster retransmits
//! ```
//!
//! ## Restricting to one interface
//!
//! ```rust
//! use gopi_mdns::MdnsConfig;
//!
//! let config = MdnsConfig::new()
//!     .with_zone("lan")
//!     .with_interface("eth0");
//! assert_eq!(config.zone, "lan");
//! assert_eq!(config.canonical_zone().unwrap(), "lan.");
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::message::name::Name;
use shared::error::{Error, Result};

/// Default domain suffix.
pub(crate) const DEFAULT_ZONE: &str = "local.";

/// Default number of query transmissions (first send included).
pub(crate) const DEFAULT_QUERY_RETRANSMIT: usize = 3;

/// Default retransmission step; send `c` goes out at `c` times this value.
pub(crate) const DEFAULT_QUERY_BACKOFF: Duration = Duration::from_millis(200);

/// Default TTL of records we announce (120 seconds).
pub(crate) const DEFAULT_ANNOUNCE_TTL: Duration = Duration::from_secs(120);

pub(crate) const DEFAULT_EMIT_RETRY_COUNT: usize = 3;
pub(crate) const DEFAULT_EMIT_RETRY_DURATION: Duration = Duration::from_millis(100);

/// Default capacity of each subscriber channel on the event bus.
pub(crate) const DEFAULT_BUS_CAPACITY: usize = 64;

/// The well-known mDNS port.
pub const MDNS_PORT: u16 = 5353;

/// The IPv4 mDNS group, 224.0.0.251.
pub const MDNS_MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The link-local IPv6 mDNS group, ff02::fb.
pub const MDNS_MULTICAST_IPV6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Configuration for an [`MdnsNode`](crate::MdnsNode).
///
/// Use the builder pattern to construct a configuration:
///
/// ```rust
/// use gopi_mdns::MdnsConfig;
/// use std::time::Duration;
///
/// let config = MdnsConfig::new()
///     .with_query_retransmit(2)
///     .with_announce_ttl(Duration::from_secs(60));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct MdnsConfig {
    /// Domain suffix for every name the node publishes or looks up.
    ///
    /// Accepted with or without the trailing dot; see
    /// [`MdnsConfig::canonical_zone`].
    ///
    /// Default: `local.`
    pub zone: String,

    /// When set, only the named interface is bound.
    ///
    /// Default: None (every eligible interface)
    pub interface: Option<String>,

    /// Total number of transmissions of a query, first one included.
    ///
    /// Default: 3
    pub query_retransmit: usize,

    /// Retransmission schedule multiplier. With the defaults queries leave at
    /// 0 ms, 200 ms and 400 ms.
    ///
    /// Default: 200 ms
    pub query_backoff: Duration,

    /// TTL applied to announced and answered records.
    ///
    /// Default: 120 s
    pub announce_ttl: Duration,

    /// How many times a blocking bus delivery waits for a full subscriber
    /// before the event is dropped for that subscriber.
    ///
    /// Default: 3
    pub emit_retry_count: usize,

    /// How long each of those waits lasts.
    ///
    /// Default: 100 ms
    pub emit_retry_duration: Duration,

    /// Capacity of each subscriber channel.
    ///
    /// Default: 64
    pub bus_capacity: usize,

    /// UDP port to bind and to send to.
    ///
    /// Default: 5353
    pub port: u16,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            zone: DEFAULT_ZONE.to_owned(),
            interface: None,
            query_retransmit: DEFAULT_QUERY_RETRANSMIT,
            query_backoff: DEFAULT_QUERY_BACKOFF,
            announce_ttl: DEFAULT_ANNOUNCE_TTL,
            emit_retry_count: DEFAULT_EMIT_RETRY_COUNT,
            emit_retry_duration: DEFAULT_EMIT_RETRY_DURATION,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            port: MDNS_PORT,
        }
    }
}

impl MdnsConfig {
    /// Create a new configuration with default values.
    ///
    /// Equivalent to [`MdnsConfig::default()`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_query_retransmit(mut self, count: usize) -> Self {
        self.query_retransmit = count;
        self
    }

    pub fn with_query_backoff(mut self, backoff: Duration) -> Self {
        self.query_backoff = backoff;
        self
    }

    pub fn with_announce_ttl(mut self, ttl: Duration) -> Self {
        self.announce_ttl = ttl;
        self
    }

    /// Set the back-pressure bound for blocking bus delivery.
    pub fn with_emit_retry(mut self, count: usize, duration: Duration) -> Self {
        self.emit_retry_count = count;
        self.emit_retry_duration = duration;
        self
    }

    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The zone with exactly one trailing dot.
    pub fn canonical_zone(&self) -> Result<String> {
        canonical_zone(&self.zone)
    }

    /// Checks the configuration before a node is started.
    ///
    /// # Errors
    ///
    /// [`Error::ErrBadParameter`] for an empty or malformed zone, a zero
    /// retransmit count, or a zero bus capacity.
    pub fn validate(&self) -> Result<()> {
        self.canonical_zone()?;
        if self.query_retransmit == 0 {
            return Err(Error::ErrBadParameter(
                "query_retransmit must be at least 1".to_owned(),
            ));
        }
        if self.bus_capacity == 0 {
            return Err(Error::ErrBadParameter(
                "bus_capacity must be at least 1".to_owned(),
            ));
        }
        if let Some(name) = &self.interface
            && name.is_empty()
        {
            return Err(Error::ErrBadParameter("empty interface name".to_owned()));
        }
        Ok(())
    }

    // TTL in whole seconds, as carried on the wire.
    pub(crate) fn announce_ttl_secs(&self) -> u32 {
        u32::try_from(self.announce_ttl.as_secs()).unwrap_or(u32::MAX)
    }
}

/// Canonicalizes a zone to end with a single dot: `local`, `local.` and
/// `.local..` all become `local.`.
pub fn canonical_zone(zone: &str) -> Result<String> {
    let trimmed = zone.trim().trim_matches('.');
    if trimmed.is_empty() {
        return Err(Error::ErrBadParameter(format!("invalid zone {zone:?}")));
    }
    let name = Name::new(&format!("{trimmed}."))
        .map_err(|err| Error::ErrBadParameter(format!("invalid zone {zone:?}: {err}")))?;
    Ok(name.data)
}
