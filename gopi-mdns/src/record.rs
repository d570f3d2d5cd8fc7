use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::config::{DEFAULT_ANNOUNCE_TTL, canonical_zone};
use crate::message::name::{Name, has_name_suffix};
use crate::quote::{quote, unquote};
use shared::error::{Error, Result};

/// One DNS-SD service instance: the logical aggregate of its PTR, SRV, TXT,
/// A and AAAA records.
///
/// All names are fully qualified and escaped, e.g. service
/// `_googlecast._tcp.local.`, instance `Living\ Room._googlecast._tcp.local.`,
/// host `chromecast.local.`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub service: String,
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub addrs: Vec<IpAddr>,
    /// Raw `key=value` entries, in wire order.
    pub txt: Vec<String>,
    /// Zero means the instance is leaving (goodbye).
    pub ttl: Duration,
    /// Interface the record was observed on; 0 for locally authored records.
    pub if_index: u32,
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{} {:?} txt={:?} ttl={}s",
            self.instance,
            self.host,
            self.port,
            self.addrs,
            self.txt,
            self.ttl.as_secs()
        )
    }
}

impl ServiceRecord {
    /// Builds a record for `name` (an unescaped instance label such as
    /// `Living Room`) of `service` in `zone`.
    ///
    /// `service` may be given as `_name._proto` or fully qualified; `host`
    /// may be a bare host name, which is then qualified with the zone.
    ///
    /// ```rust
    /// use gopi_mdns::ServiceRecord;
    ///
    /// let r = ServiceRecord::new("local", "_gopi._tcp", "Test's Test", "h", 9999).unwrap();
    /// assert_eq!(r.service, "_gopi._tcp.local.");
    /// assert_eq!(r.instance, "Test\\039s\\ Test._gopi._tcp.local.");
    /// assert_eq!(r.host, "h.local.");
    /// assert_eq!(r.label().unwrap(), "Test's Test");
    /// ```
    pub fn new(zone: &str, service: &str, name: &str, host: &str, port: u16) -> Result<Self> {
        let zone = canonical_zone(zone)?;
        let service = qualify_service(&zone, service)?;
        if name.is_empty() {
            return Err(Error::ErrBadParameter("empty instance name".to_owned()));
        }
        let instance = format!("{}.{service}", quote(name));
        let host = qualify(&zone, host)?;

        let record = ServiceRecord {
            service,
            instance,
            host,
            port,
            addrs: vec![],
            txt: vec![],
            ttl: DEFAULT_ANNOUNCE_TTL,
            if_index: 0,
        };
        record.validate(&zone)?;
        Ok(record)
    }

    pub fn with_txt<I, S>(mut self, txt: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.txt = txt.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the addresses; only global unicast ones are kept.
    pub fn with_addrs<I: IntoIterator<Item = IpAddr>>(mut self, addrs: I) -> Self {
        self.addrs = addrs.into_iter().filter(is_global_unicast).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Value of the first TXT entry for `key`. A bare `key` yields `""`.
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt.iter().find_map(|entry| match entry.split_once('=') {
            Some((k, v)) if k == key => Some(v),
            None if entry == key => Some(""),
            _ => None,
        })
    }

    /// The unescaped instance label, e.g. `Living Room`.
    pub fn label(&self) -> Result<String> {
        let label = self
            .instance
            .strip_suffix(&self.service)
            .and_then(|head| head.strip_suffix('.'))
            .ok_or_else(|| {
                Error::ErrBadParameter(format!(
                    "instance {} is not part of {}",
                    self.instance, self.service
                ))
            })?;
        unquote(label)
    }

    pub fn is_goodbye(&self) -> bool {
        self.ttl.is_zero()
    }

    /// The `(service, instance)` pair identifying this record.
    pub fn key(&self) -> (String, String) {
        (self.service.clone(), self.instance.clone())
    }

    /// Checks the zone discipline, mandatory fields and that every address
    /// is global unicast.
    ///
    /// `zone` must already be canonical.
    pub fn validate(&self, zone: &str) -> Result<()> {
        for (field, value) in [
            ("service", &self.service),
            ("instance", &self.instance),
            ("host", &self.host),
        ] {
            if value.is_empty() {
                return Err(Error::ErrBadParameter(format!("missing {field}")));
            }
            Name::new(value)
                .map_err(|err| Error::ErrBadParameter(format!("{field} {value:?}: {err}")))?;
            if !has_name_suffix(value, zone) || value == zone {
                return Err(Error::ErrBadParameter(format!(
                    "{field} {value:?} is outside zone {zone}"
                )));
            }
        }
        if !has_name_suffix(&self.instance, &self.service) || self.instance == self.service {
            return Err(Error::ErrBadParameter(format!(
                "instance {:?} is not part of {:?}",
                self.instance, self.service
            )));
        }
        if self.port == 0 {
            return Err(Error::ErrBadParameter(format!(
                "missing port for {}",
                self.instance
            )));
        }
        if let Some(entry) = self.txt.iter().find(|entry| entry.len() > u8::MAX as usize) {
            return Err(Error::ErrBadParameter(format!(
                "txt entry of {} bytes",
                entry.len()
            )));
        }
        if let Some(addr) = self.addrs.iter().find(|addr| !is_global_unicast(addr)) {
            return Err(Error::ErrBadParameter(format!(
                "address {addr} of {} is not global unicast",
                self.instance
            )));
        }
        Ok(())
    }
}

/// Reports whether `addr` may be published or accepted: not loopback,
/// link-local, multicast, unspecified or broadcast.
pub fn is_global_unicast(addr: &IpAddr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() || addr.is_multicast() {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_broadcast(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// The DNS-SD meta-query name, relative to the zone (RFC 6763 section 9).
pub const SERVICE_TYPE_ENUMERATION: &str = "_services._dns-sd._udp.";

/// Removes `zone` from a fully qualified name: `TestSvc._gopi._tcp.local.`
/// becomes `TestSvc._gopi._tcp.`. Returns None outside the zone.
pub(crate) fn strip_zone<'a>(name: &'a str, zone: &str) -> Option<&'a str> {
    if name == zone || !has_name_suffix(name, zone) {
        return None;
    }
    Some(&name[..name.len() - zone.len()])
}

// qualify appends the zone to a bare name, or keeps a name already in it.
fn qualify(zone: &str, name: &str) -> Result<String> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(Error::ErrBadParameter(format!("invalid name {name:?}")));
    }
    let fqdn = format!("{trimmed}.");
    if has_name_suffix(&fqdn, zone) && fqdn != zone {
        Ok(fqdn)
    } else {
        Ok(format!("{fqdn}{zone}"))
    }
}

pub(crate) fn qualify_service(zone: &str, service: &str) -> Result<String> {
    let fqdn = qualify(zone, service)?;
    let bare = strip_zone(&fqdn, zone).unwrap_or(&fqdn);
    let labels: Vec<&str> = bare.trim_end_matches('.').split('.').collect();
    match labels.as_slice() {
        [name, proto]
            if name.len() > 1
                && name.starts_with('_')
                && (*proto == "_tcp" || *proto == "_udp") =>
        {
            Ok(fqdn)
        }
        _ => Err(Error::ErrBadParameter(format!(
            "service {service:?} is not of the form _name._tcp or _name._udp"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_new_qualifies_names() {
        let r = ServiceRecord::new("local.", "_gopi._tcp.local.", "TestSvc", "h.local.", 9999)
            .unwrap();
        assert_eq!(r.service, "_gopi._tcp.local.");
        assert_eq!(r.instance, "TestSvc._gopi._tcp.local.");
        assert_eq!(r.host, "h.local.");
        assert_eq!(r.ttl, Duration::from_secs(120));
        assert!(!r.is_goodbye());
        assert_eq!(r.label().unwrap(), "TestSvc");
    }

    #[test]
    fn test_new_rejects_bad_input() {
        for (service, name, host, port) in [
            ("gopi._tcp", "x", "h", 1),
            ("_gopi._sctp", "x", "h", 1),
            ("_gopi", "x", "h", 1),
            ("_gopi._tcp", "", "h", 1),
            ("_gopi._tcp", "x", "", 1),
            ("_gopi._tcp", "x", "h", 0),
        ] {
            let err = ServiceRecord::new("local", service, name, host, port).unwrap_err();
            assert_eq!(
                err.kind(),
                shared::error::ErrorKind::BadParameter,
                "{service} {name} {host} {port}"
            );
        }
    }

    #[test]
    fn test_validate_zone_discipline() {
        let mut r = ServiceRecord::new("local", "_gopi._tcp", "a", "h", 1).unwrap();
        assert!(r.validate("local.").is_ok());
        assert!(r.validate("lan.").is_err());

        r.instance = "a._other._tcp.local.".to_owned();
        assert!(r.validate("local.").is_err());

        let mut r = ServiceRecord::new("local", "_gopi._tcp", "a", "h", 1).unwrap();
        r.txt = vec!["k=".to_owned() + &"v".repeat(254)];
        assert!(r.validate("local.").is_err());
    }

    #[test]
    fn test_validate_rejects_local_addresses() {
        let global = ServiceRecord::new("local", "_gopi._tcp", "a", "h", 1)
            .unwrap()
            .with_addrs([IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))]);
        assert!(global.validate("local.").is_ok());

        for addr in [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1)),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        ] {
            let mut r = global.clone();
            r.addrs.push(addr);
            assert_eq!(
                r.validate("local.").unwrap_err().kind(),
                shared::error::ErrorKind::BadParameter,
                "{addr}"
            );
        }
    }

    #[test]
    fn test_txt_value() {
        let r = ServiceRecord::new("local", "_googlecast._tcp", "tv", "tv", 8009)
            .unwrap()
            .with_txt(["id=abc", "fn=Living Room", "flag", "rs="]);
        assert_eq!(r.txt_value("id"), Some("abc"));
        assert_eq!(r.txt_value("fn"), Some("Living Room"));
        assert_eq!(r.txt_value("flag"), Some(""));
        assert_eq!(r.txt_value("rs"), Some(""));
        assert_eq!(r.txt_value("md"), None);
    }

    #[test]
    fn test_with_addrs_filters() {
        let r = ServiceRecord::new("local", "_gopi._tcp", "a", "h", 1)
            .unwrap()
            .with_addrs([
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)),
                IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            ]);
        assert_eq!(
            r.addrs,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            ]
        );
    }

    #[test]
    fn test_strip_zone() {
        assert_eq!(
            strip_zone("TestSvc._gopi._tcp.local.", "local."),
            Some("TestSvc._gopi._tcp.")
        );
        assert_eq!(strip_zone("local.", "local."), None);
        assert_eq!(strip_zone("x.lan.", "local."), None);
    }
}
