//! Network interface enumeration.
//!
//! Groups the per-address entries returned by `getifaddrs(3)` into one
//! [`Interface`] per name, keeping the flags the multicast layer cares about.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::{InterfaceFlags, if_nametoindex};

use crate::error::Result;

/// A network interface together with its assigned addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub up: bool,
    pub multicast: bool,
    pub loopback: bool,
    pub addrs: Vec<IpAddr>,
}

impl Interface {
    /// An interface can carry mDNS traffic when it is up, multicast capable
    /// and has at least one address to join the groups with.
    pub fn is_multicast_eligible(&self) -> bool {
        self.up && self.multicast && !self.loopback && !self.addrs.is_empty()
    }

    pub fn has_ipv4(&self) -> bool {
        self.addrs.iter().any(|a| a.is_ipv4())
    }

    pub fn has_ipv6(&self) -> bool {
        self.addrs.iter().any(|a| a.is_ipv6())
    }
}

/// Returns every interface of the host, ordered by name.
pub fn ifaces() -> Result<Vec<Interface>> {
    let mut by_name: BTreeMap<String, Interface> = BTreeMap::new();

    for ifaddr in getifaddrs()? {
        let entry = match by_name.get_mut(&ifaddr.interface_name) {
            Some(entry) => entry,
            None => {
                let index = match if_nametoindex(ifaddr.interface_name.as_str()) {
                    Ok(index) => index,
                    Err(err) => {
                        log::debug!("skip interface {}: {err}", ifaddr.interface_name);
                        continue;
                    }
                };
                by_name
                    .entry(ifaddr.interface_name.clone())
                    .or_insert_with(|| Interface {
                        name: ifaddr.interface_name.clone(),
                        index,
                        up: ifaddr.flags.contains(InterfaceFlags::IFF_UP),
                        multicast: ifaddr.flags.contains(InterfaceFlags::IFF_MULTICAST),
                        loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                        addrs: vec![],
                    })
            }
        };

        let Some(address) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            entry.addrs.push(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            entry.addrs.push(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
        }
    }

    Ok(by_name.into_values().collect())
}

/// Returns the interfaces mDNS should bind, optionally restricted to one name.
pub fn multicast_ifaces(only: Option<&str>) -> Result<Vec<Interface>> {
    Ok(ifaces()?
        .into_iter()
        .filter(|iface| only.is_none_or(|name| iface.name == name))
        .filter(Interface::is_multicast_eligible)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn iface(up: bool, multicast: bool, loopback: bool, addrs: Vec<IpAddr>) -> Interface {
        Interface {
            name: "eth0".to_owned(),
            index: 2,
            up,
            multicast,
            loopback,
            addrs,
        }
    }

    #[test]
    fn test_multicast_eligible() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        assert!(iface(true, true, false, vec![addr]).is_multicast_eligible());
        assert!(!iface(false, true, false, vec![addr]).is_multicast_eligible());
        assert!(!iface(true, false, false, vec![addr]).is_multicast_eligible());
        assert!(!iface(true, true, true, vec![addr]).is_multicast_eligible());
        assert!(!iface(true, true, false, vec![]).is_multicast_eligible());
    }

    #[test]
    fn test_ifaces_lists_loopback() {
        // Every unix host has a loopback device with an index.
        let all = ifaces().unwrap();
        assert!(all.iter().any(|i| i.loopback && i.index > 0));
    }
}
