//! Socket utilities for mDNS.
//!
//! This module provides [`MulticastSocket`], a builder for UDP sockets joined
//! to the mDNS groups on a chosen set of interfaces.
//!
//! # Example
//!
//! ```rust,ignore
//! use gopi_mdns::{MulticastSocket, MDNS_PORT};
//!
//! let (std_socket, joined) = MulticastSocket::v4(MDNS_PORT)
//!     .with_interfaces(vec![2, 3])
//!     .into_std()?;
//! let socket = tokio::net::UdpSocket::from_std(std_socket)?;
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use log::{debug, warn};
use nix::sys::socket::{setsockopt, sockopt};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};

use crate::config::{MDNS_MULTICAST_IPV4, MDNS_MULTICAST_IPV6};
use shared::error::{Error, Result};

/// Address family of a [`MulticastSocket`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// A builder for multicast UDP sockets suitable for mDNS.
///
/// The resulting socket is:
///
/// - bound to the mDNS port with `SO_REUSEADDR` (and `SO_REUSEPORT` where
///   available), so other responders on the host keep working,
/// - non-blocking,
/// - joined to the family's mDNS group on every requested interface,
/// - set to report the arrival interface of each datagram
///   (`IP_PKTINFO` / `IPV6_RECVPKTINFO`),
/// - sending with hop limit 255 and multicast loopback on.
#[derive(Debug, Clone)]
pub struct MulticastSocket {
    family: Family,
    port: u16,
    interfaces: Vec<u32>,
}

impl MulticastSocket {
    pub fn v4(port: u16) -> Self {
        Self {
            family: Family::V4,
            port,
            interfaces: vec![],
        }
    }

    pub fn v6(port: u16) -> Self {
        Self {
            family: Family::V6,
            port,
            interfaces: vec![],
        }
    }

    /// Interface indexes to join the group on.
    pub fn with_interfaces(mut self, interfaces: Vec<u32>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn group(&self) -> IpAddr {
        match self.family {
            Family::V4 => IpAddr::V4(MDNS_MULTICAST_IPV4),
            Family::V6 => IpAddr::V6(MDNS_MULTICAST_IPV6),
        }
    }

    fn bind_addr(&self) -> SocketAddr {
        let ip = match self.family {
            // Binding the group address filters out unrelated unicast traffic
            // on Linux; other platforms only deliver multicast to a wildcard
            // bind.
            Family::V4 if cfg!(target_os = "linux") => IpAddr::V4(MDNS_MULTICAST_IPV4),
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, self.port)
    }

    /// Creates the socket and joins the group on each requested interface.
    ///
    /// Returns the socket together with the interfaces actually joined; an
    /// interface that refuses the membership is logged and left out.
    ///
    /// # Errors
    ///
    /// I/O errors from socket setup, or [`Error::ErrBadInterface`] when the
    /// group could not be joined anywhere.
    pub fn into_std(self) -> Result<(UdpSocket, Vec<u32>)> {
        let domain = match self.family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Enable address reuse for multiple processes
        socket.set_reuse_address(true)?;

        // Enable port reuse on supported platforms
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true)?;

        socket.set_nonblocking(true)?;

        match self.family {
            Family::V4 => {
                socket.set_multicast_ttl_v4(255)?;
                socket.set_multicast_loop_v4(true)?;
                setsockopt(socket.as_raw_fd(), sockopt::Ipv4PacketInfo, &true)?;
            }
            Family::V6 => {
                socket.set_only_v6(true)?;
                socket.set_multicast_hops_v6(255)?;
                socket.set_multicast_loop_v6(true)?;
                setsockopt(socket.as_raw_fd(), sockopt::Ipv6RecvPacketInfo, &true)?;
            }
        }

        socket.bind(&self.bind_addr().into())?;

        let mut joined = vec![];
        for &index in &self.interfaces {
            let res = match self.family {
                Family::V4 => socket.join_multicast_v4_n(
                    &MDNS_MULTICAST_IPV4,
                    &InterfaceIndexOrAddress::Index(index),
                ),
                Family::V6 => socket.join_multicast_v6(&MDNS_MULTICAST_IPV6, index),
            };
            match res {
                Ok(()) => {
                    debug!("joined {} on interface {index}", self.group());
                    joined.push(index);
                }
                Err(err) => warn!("failed to join {} on interface {index}: {err}", self.group()),
            }
        }
        if joined.is_empty() {
            return Err(Error::ErrBadInterface);
        }

        Ok((socket.into(), joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_constants() {
        assert_eq!(MDNS_MULTICAST_IPV4, Ipv4Addr::new(224, 0, 0, 251));
        assert_eq!(MDNS_MULTICAST_IPV6.to_string(), "ff02::fb");
    }

    #[test]
    fn test_multicast_socket_builder() {
        let builder = MulticastSocket::v6(5353).with_interfaces(vec![2, 3]);
        assert_eq!(builder.family, Family::V6);
        assert_eq!(builder.interfaces, vec![2, 3]);
        assert_eq!(builder.group(), IpAddr::V6(MDNS_MULTICAST_IPV6));
        assert_eq!(
            builder.bind_addr(),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 5353)
        );
    }

    #[test]
    fn test_multicast_socket_without_interfaces() {
        // Nothing to join is a configuration error, not a silent success.
        let err = MulticastSocket::v4(0).into_std().unwrap_err();
        assert_eq!(err, Error::ErrBadInterface);
    }

    // Note: joining real interfaces needs a multicast capable host and may
    // conflict with a running responder, so it is left to the demos.
}
