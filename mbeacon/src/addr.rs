//! Transport endpoint addresses used as keys in the source and membership maps.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Default UDP port for probe and report exchange.
pub const DEFAULT_PORT: u16 = 10000;

/// A beacon endpoint: IP address plus port.
///
/// Ordering and equality derive over (family, address bytes, port), so maps
/// keyed by `Address` group IPv4 before IPv6 and sort addresses bytewise.
/// Where the port must not participate in a key, use [`Address::strip_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The all-zeroes IPv4 address, used as a "not configured" sentinel.
    pub fn unspecified() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The same endpoint with the port zeroed, for port-insensitive keying.
    pub fn strip_port(&self) -> Self {
        Self {
            ip: self.ip,
            port: 0,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip, IpAddr::V6(_))
    }

    pub fn is_multicast(&self) -> bool {
        self.ip.is_multicast()
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// True when both addresses name the same host, ignoring ports.
    pub fn same_host(&self, other: &Address) -> bool {
        self.ip == other.ip
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Self {
            ip: sa.ip(),
            port: sa.port(),
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(a: Address) -> Self {
        SocketAddr::new(a.ip, a.port)
    }
}

impl fmt::Display for Address {
    /// Prints `addr/port`, the notation used in logs, dumps and on the
    /// command line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.port)
    }
}

/// Error parsing an `addr` or `addr/port` literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError(String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad address format: {}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parses `addr` or `addr/port`; a missing port defaults to
    /// [`DEFAULT_PORT`]. The `/` separator keeps IPv6 literals unambiguous.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.split_once('/') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressParseError(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| AddressParseError(s.to_string()))?;
        Ok(Self { ip, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_port() {
        let a: Address = "224.0.23.10/4444".parse().unwrap();
        assert_eq!(a.port(), 4444);
        assert!(a.is_multicast());

        let b: Address = "ff3e::beac".parse().unwrap();
        assert_eq!(b.port(), DEFAULT_PORT);
        assert!(b.is_ipv6());
        assert!(b.is_multicast());

        assert!("not-an-addr/99".parse::<Address>().is_err());
        assert!("10.0.0.1/notaport".parse::<Address>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let a: Address = "10.1.2.3/7777".parse().unwrap();
        assert_eq!(a.to_string(), "10.1.2.3/7777");
        assert_eq!(a.to_string().parse::<Address>().unwrap(), a);
    }

    #[test]
    fn test_strip_port_and_same_host() {
        let a: Address = "10.0.0.1/5000".parse().unwrap();
        let b: Address = "10.0.0.1/6000".parse().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.strip_port(), b.strip_port());
        assert!(a.same_host(&b));
    }

    #[test]
    fn test_ordering_groups_by_family() {
        let v4: Address = "255.255.255.255/1".parse().unwrap();
        let v6: Address = "::1/1".parse().unwrap();
        assert!(v4 < v6);
    }
}
