//! Mapping of host strings to socket families and bind addresses.
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use log::debug;

const UNIX_PREFIX: &str = "unix://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
    Unix,
}

/// A concrete address to bind a listening socket to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddress {
    Inet(SocketAddr),
    Unix(PathBuf),
    /// Resolution failed and the host is not an IP literal; binding it will
    /// fail with a descriptive error.
    Unresolved(String, u16),
}

impl BindAddress {
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Inet(addr) => Some(addr.port()),
            Self::Unix(_) => None,
            Self::Unresolved(_, port) => Some(*port),
        }
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{}", addr),
            Self::Unix(path) => write!(f, "{}{}", UNIX_PREFIX, path.display()),
            Self::Unresolved(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Socket family for a host string: `unix://` prefix means a Unix domain
/// socket, any `:` means IPv6, anything else IPv4.
pub fn select_family(host: &str) -> Family {
    if host.starts_with(UNIX_PREFIX) {
        Family::Unix
    } else if host.contains(':') {
        Family::Ipv6
    } else {
        Family::Ipv4
    }
}

/// Resolve `host` and `port` to a socket family and bind address.
///
/// For Unix sockets the address is the path after the `unix://` prefix.
/// Otherwise the host is resolved and the first address of the selected
/// family is used; if resolution fails the literal host is used as is.
pub fn resolve(host: &str, port: u16) -> (Family, BindAddress) {
    let family = select_family(host);
    if family == Family::Unix {
        return (family, BindAddress::Unix(PathBuf::from(&host[UNIX_PREFIX.len()..])));
    }
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let resolved = (literal, port).to_socket_addrs().ok().and_then(|mut addrs| {
        addrs.find(|addr| match family {
            Family::Ipv6 => addr.is_ipv6(),
            _ => addr.is_ipv4(),
        })
    });
    let address = match resolved {
        Some(addr) => BindAddress::Inet(addr),
        None => {
            debug!("could not resolve {}, using it literally", host);
            match literal_ip(literal, family) {
                Some(ip) => BindAddress::Inet(SocketAddr::new(ip, port)),
                None => BindAddress::Unresolved(host.to_string(), port),
            }
        }
    };
    (family, address)
}

fn literal_ip(host: &str, family: Family) -> Option<IpAddr> {
    match host {
        "" | "*" => Some(match family {
            Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }),
        _ => host.parse().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unix_socket() {
        let (family, address) = resolve("unix:///tmp/x.sock", 0);
        assert_eq!(family, Family::Unix);
        assert_eq!(address, BindAddress::Unix(PathBuf::from("/tmp/x.sock")));
        assert_eq!(address.port(), None);
    }

    #[test]
    fn test_ipv6() {
        let (family, address) = resolve("::1", 8080);
        assert_eq!(family, Family::Ipv6);
        assert_eq!(address, BindAddress::Inet("[::1]:8080".parse().unwrap()));
    }

    #[test]
    fn test_ipv4() {
        let (family, address) = resolve("127.0.0.1", 8080);
        assert_eq!(family, Family::Ipv4);
        assert_eq!(address, BindAddress::Inet("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_wildcard_falls_back_to_literal() {
        let (family, address) = resolve("", 5000);
        assert_eq!(family, Family::Ipv4);
        assert_eq!(address, BindAddress::Inet("0.0.0.0:5000".parse().unwrap()));
    }

    #[test]
    fn test_unresolvable_host_is_kept() {
        let (family, address) = resolve("no-such-host.invalid", 80);
        assert_eq!(family, Family::Ipv4);
        assert_eq!(address, BindAddress::Unresolved("no-such-host.invalid".to_string(), 80));
    }

    #[test]
    fn test_family_is_pure() {
        assert_eq!(select_family("unix://relative.sock"), Family::Unix);
        assert_eq!(select_family("fe80::1"), Family::Ipv6);
        assert_eq!(select_family("localhost"), Family::Ipv4);
    }
}
