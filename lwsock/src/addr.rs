//! Address families, socket types and conversions onto the engine's
//! address types.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};

use crate::error::{Errno, Result};

/// Protocol family of a socket or lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// Any family (lookups only)
    #[default]
    Unspec,
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Family of an address.
    pub fn of(addr: &IpAddress) -> AddressFamily {
        match addr {
            IpAddress::Ipv4(_) => AddressFamily::Inet,
            IpAddress::Ipv6(_) => AddressFamily::Inet6,
        }
    }

    /// Whether `addr` may be used with a socket of this family.
    pub fn admits(self, addr: &IpAddress) -> bool {
        self == AddressFamily::Unspec || self == AddressFamily::of(addr)
    }

    /// Wildcard address of this family.
    pub fn unspecified(self) -> IpAddress {
        match self {
            AddressFamily::Inet6 => IpAddress::Ipv6(Ipv6Addr::UNSPECIFIED.into()),
            _ => IpAddress::Ipv4(Ipv4Addr::UNSPECIFIED.into()),
        }
    }

    /// Loopback address of this family.
    pub fn loopback(self) -> IpAddress {
        match self {
            AddressFamily::Inet6 => IpAddress::Ipv6(Ipv6Addr::LOCALHOST.into()),
            _ => IpAddress::Ipv4(Ipv4Addr::LOCALHOST.into()),
        }
    }
}

/// Kind of socket requested from `socket()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Datagram,
    /// Raw IP; the protocol number is passed separately
    Raw,
}

/// Reject an endpoint whose family does not match the socket.
pub fn check_family(family: AddressFamily, endpoint: &IpEndpoint) -> Result<()> {
    if family.admits(&endpoint.addr) {
        Ok(())
    } else {
        Err(Errno::EAFNOSUPPORT)
    }
}

/// Listen endpoint for a bind; the wildcard address binds every interface.
pub fn listen_endpoint(endpoint: &IpEndpoint) -> IpListenEndpoint {
    IpListenEndpoint {
        addr: if endpoint.addr.is_unspecified() {
            None
        } else {
            Some(endpoint.addr)
        },
        port: endpoint.port,
    }
}

pub fn to_ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4.into()),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6.into()),
    }
}

pub fn to_std_addr(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6)),
    }
}

/// Convert a std socket address into an engine endpoint.
pub fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(to_ip_address(addr.ip()), addr.port())
}

/// Convert an engine endpoint into a std socket address.
pub fn to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(to_std_addr(endpoint.addr), endpoint.port)
}

/// Parse a numeric host, as `AI_NUMERICHOST` requires.
pub fn parse_numeric(host: &str) -> Option<IpAddress> {
    host.parse::<IpAddr>().ok().map(to_ip_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_admits() {
        let v4 = parse_numeric("10.0.2.15").unwrap();
        let v6 = parse_numeric("::1").unwrap();
        assert!(AddressFamily::Inet.admits(&v4));
        assert!(!AddressFamily::Inet.admits(&v6));
        assert!(AddressFamily::Unspec.admits(&v6));
        assert_eq!(AddressFamily::of(&v6), AddressFamily::Inet6);
    }

    #[test]
    fn test_endpoint_round_trip() {
        let sa: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let ep = to_endpoint(sa);
        assert_eq!(ep.port, 8080);
        assert_eq!(to_socket_addr(ep), sa);
    }

    #[test]
    fn test_wildcard_listen_endpoint() {
        let ep = IpEndpoint::new(AddressFamily::Inet.unspecified(), 80);
        assert_eq!(listen_endpoint(&ep).addr, None);
        let ep = IpEndpoint::new(AddressFamily::Inet.loopback(), 80);
        assert!(listen_endpoint(&ep).addr.is_some());
        assert_eq!(check_family(AddressFamily::Inet6, &ep), Err(Errno::EAFNOSUPPORT));
    }

    #[test]
    fn test_parse_numeric_rejects_names() {
        assert!(parse_numeric("localhost").is_none());
    }
}
