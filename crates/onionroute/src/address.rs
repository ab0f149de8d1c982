//! Types and code for the addresses a stream can target.

use crate::Error;
use or_hsclient::HsId;
use std::fmt;
use std::net::IpAddr;

/// An address (and port) to which a client can open an anonymized
/// stream.
///
/// The hostname case is deliberately *not* resolved locally: leaving
/// resolution to the exit relay is what keeps DNS anonymous.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TorAddr {
    /// The host part of the address.
    host: Host,
    /// The target port.
    port: u16,
}

/// The host part of a target address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Host {
    /// A DNS name, to be resolved by the exit.
    Hostname(String),
    /// A literal IP address.
    Ip(IpAddr),
    /// A hidden service.
    Onion(HsId),
}

impl TorAddr {
    /// Construct a TorAddr from an address string and a port.
    ///
    /// Returns an error for syntactically invalid addresses, for
    /// port zero, and for the ".exit" notation (which would let a
    /// remote site choose our path).
    pub fn new(addr: &str, port: u16) -> crate::Result<Self> {
        if port == 0 {
            return Err(Error::Address("port must be nonzero".into()));
        }
        let addr = addr.trim().trim_end_matches('.');
        let lower = addr.to_ascii_lowercase();

        if lower.ends_with(".exit") {
            // The .exit notation is long deprecated: it lets the
            // target pick our exit relay.
            return Err(Error::Address(".exit addresses are not allowed".into()));
        }

        let host = if let Ok(ip) = addr.parse::<IpAddr>() {
            Host::Ip(ip)
        } else if HsId::looks_like_onion_addr(&lower) {
            let hsid: HsId = lower
                .parse()
                .map_err(|_| Error::Address("invalid onion address".into()))?;
            Host::Onion(hsid)
        } else {
            if !is_valid_hostname(&lower) {
                return Err(Error::Address(format!("invalid hostname {:?}", addr)));
            }
            Host::Hostname(lower)
        };
        Ok(TorAddr { host, port })
    }

    /// Return the port of this address.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return true if this address names a hidden service.
    pub fn is_onion(&self) -> bool {
        matches!(self.host, Host::Onion(_))
    }

    /// Return the host part.
    pub(crate) fn host(&self) -> &Host {
        &self.host
    }

    /// Return the string to place in a BEGIN cell for this address.
    pub(crate) fn begin_host(&self) -> String {
        match &self.host {
            Host::Hostname(s) => s.clone(),
            Host::Ip(ip) => ip.to_string(),
            // On a joined rendezvous circuit the service already
            // knows who it is; only the port matters.
            Host::Onion(_) => String::new(),
        }
    }
}

impl fmt::Display for TorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Hostname(s) => write!(f, "{}:{}", s, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Onion(id) => write!(f, "{}:{}", id, self.port),
        }
    }
}

/// Return true if `name` is a syntactically valid hostname to hand
/// to an exit.
fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn hostnames() {
        let a = TorAddr::new("www.Example.Com", 443).unwrap();
        assert_eq!(a.begin_host(), "www.example.com");
        assert_eq!(a.port(), 443);
        assert!(!a.is_onion());
        assert_eq!(a.to_string(), "www.example.com:443");
    }

    #[test]
    fn ips() {
        let a = TorAddr::new("192.0.2.7", 80).unwrap();
        assert!(matches!(a.host(), Host::Ip(_)));
        let a = TorAddr::new("2001:db8::1", 80).unwrap();
        assert_eq!(a.to_string(), "[2001:db8::1]:80");
    }

    #[test]
    fn onions() {
        let a = TorAddr::new("duskgytldkxiuqc6.onion", 80).unwrap();
        assert!(a.is_onion());
        // The BEGIN host for a rendezvous stream is empty.
        assert_eq!(a.begin_host(), "");
    }

    #[test]
    fn rejected() {
        assert!(TorAddr::new("www.example.com", 0).is_err());
        assert!(TorAddr::new("relayname.exit", 80).is_err());
        assert!(TorAddr::new("not a hostname", 80).is_err());
        assert!(TorAddr::new("", 80).is_err());
        assert!(TorAddr::new("badonionaddr.onion", 80).is_err());
    }
}
