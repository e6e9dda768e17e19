//! Source address access lists
//!
//! An [`AccessList`] is parsed from a comma separated list of IPv4 addresses
//! and CIDR blocks (e.g. `"10.0.0.0/24, 192.168.1.7"`). A bare address is
//! treated as a `/32`. An empty string yields no list at all, which allows
//! every peer.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AclError {
    #[error("{0} is not IPv4 address")]
    NotIpv4(String),

    #[error("Invalid IP address or CIDR: {0}")]
    Invalid(String),

    #[error("0.0.0.0 would allow access to everyone. If that's what you want, do not set the ACL")]
    AllowsEveryone,
}

/// Parsed IPv4 allow-list
#[derive(Debug, Clone, Eq)]
pub struct AccessList {
    networks: Vec<Ipv4Net>,
}

impl AccessList {
    /// Parse an ACL string. Returns `Ok(None)` for an empty string.
    pub fn parse(input: &str) -> Result<Option<Self>, AclError> {
        if input.trim().is_empty() {
            return Ok(None);
        }

        let mut networks = Vec::new();
        for entry in input.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            networks.push(parse_network(entry)?);
        }

        if networks.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { networks }))
    }

    /// True if any network of the list contains `ip`.
    ///
    /// IPv6 peers are only matched through their IPv4-mapped form.
    pub fn check_access(&self, ip: IpAddr) -> bool {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        self.networks.iter().any(|net| net.contains(&v4))
    }

    pub fn networks(&self) -> &[Ipv4Net] {
        &self.networks
    }
}

/// Check a peer against an optional list; no list means allow-all.
pub fn is_permitted(acl: Option<&AccessList>, peer: &SocketAddr) -> bool {
    acl.map_or(true, |acl| acl.check_access(peer.ip()))
}

fn parse_network(entry: &str) -> Result<Ipv4Net, AclError> {
    let (addr_part, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => {
            let prefix = prefix
                .parse::<u8>()
                .map_err(|_| AclError::Invalid(entry.to_string()))?;
            (addr, Some(prefix))
        }
        None => (entry, None),
    };

    let ip: IpAddr = addr_part
        .parse()
        .map_err(|_| AclError::Invalid(entry.to_string()))?;
    let v4 = match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(AclError::NotIpv4(entry.to_string())),
    };

    if v4 == Ipv4Addr::UNSPECIFIED {
        return Err(AclError::AllowsEveryone);
    }

    let net = Ipv4Net::new(v4, prefix.unwrap_or(32))
        .map_err(|_| AclError::Invalid(entry.to_string()))?;
    Ok(net.trunc())
}

impl fmt::Display for AccessList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.networks.iter().map(|n| n.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Lists compare equal when their normalized forms match.
impl PartialEq for AccessList {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_allows_all() {
        let acl = AccessList::parse("").unwrap();
        assert!(acl.is_none());

        let peer: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        assert!(is_permitted(acl.as_ref(), &peer));
    }

    #[test]
    fn test_cidr_containment() {
        let acl = AccessList::parse("10.0.0.0/24").unwrap().unwrap();
        assert!(acl.check_access(ip("10.0.0.5")));
        assert!(!acl.check_access(ip("10.0.1.5")));
    }

    #[test]
    fn test_bare_address_is_single_host() {
        let acl = AccessList::parse("192.168.1.7").unwrap().unwrap();
        assert!(acl.check_access(ip("192.168.1.7")));
        assert!(!acl.check_access(ip("192.168.1.8")));
        assert_eq!(acl.to_string(), "192.168.1.7/32");
    }

    #[test]
    fn test_multiple_entries_with_whitespace() {
        let acl = AccessList::parse(" 10.0.0.1 , 172.16.0.0/12").unwrap().unwrap();
        assert_eq!(acl.networks().len(), 2);
        assert!(acl.check_access(ip("10.0.0.1")));
        assert!(acl.check_access(ip("172.20.1.1")));
        assert!(!acl.check_access(ip("10.0.0.2")));
    }

    #[test]
    fn test_rejects_zero_address() {
        assert_eq!(
            AccessList::parse("0.0.0.0").unwrap_err(),
            AclError::AllowsEveryone
        );
        assert_eq!(
            AccessList::parse("10.0.0.1,0.0.0.0/0").unwrap_err(),
            AclError::AllowsEveryone
        );
    }

    #[test]
    fn test_rejects_ipv6() {
        let err = AccessList::parse("::1").unwrap_err();
        assert_eq!(err.to_string(), "::1 is not IPv4 address");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            AccessList::parse("10.0.0/24"),
            Err(AclError::Invalid(_))
        ));
        assert!(matches!(
            AccessList::parse("10.0.0.0/33"),
            Err(AclError::Invalid(_))
        ));
        assert!(matches!(
            AccessList::parse("10.0.0.0/abc"),
            Err(AclError::Invalid(_))
        ));
    }

    #[test]
    fn test_ipv4_mapped_peer() {
        let acl = AccessList::parse("127.0.0.1").unwrap().unwrap();
        assert!(acl.check_access(ip("::ffff:127.0.0.1")));
        assert!(!acl.check_access(ip("::1")));
    }

    #[test]
    fn test_equality_uses_normalized_form() {
        let a = AccessList::parse("10.0.0.5/24").unwrap().unwrap();
        let b = AccessList::parse("10.0.0.0/24").unwrap().unwrap();
        assert_eq!(a, b);
    }
}
