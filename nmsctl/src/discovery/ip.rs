//! Turning a discovery's `(ip, ip_type)` into the concrete addresses to probe.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::types::IpType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    #[error("'{0}' is not a valid IP address")]
    InvalidAddress(String),
    #[error("range '{0}' must be written as start-end")]
    InvalidRange(String),
    #[error("range start and end must be the same address family")]
    MixedFamilies,
    #[error("range start must not be greater than range end")]
    Reversed,
    #[error("CIDR '{0}' must be an IPv4 address and a prefix between 0 and 32")]
    InvalidCidr(String),
    #[error("{count} addresses exceeds the limit of {max}")]
    TooMany { count: u128, max: usize },
}

/// Expand, treating any invalid or oversized input as "nothing to probe".
pub fn expand(ip: &str, ip_type: IpType, max_ip_count: usize) -> Vec<IpAddr> {
    try_expand(ip, ip_type, max_ip_count).unwrap_or_default()
}

/// Expand to a deduplicated list in ascending order. Never returns more than `max_ip_count`
/// addresses; an oversized request is an error rather than a truncated list.
pub fn try_expand(ip: &str, ip_type: IpType, max_ip_count: usize) -> Result<Vec<IpAddr>, ExpandError> {
    let ip = ip.trim();
    let addresses = match ip_type {
        IpType::Single => vec![parse_addr(ip)?],
        IpType::Range => expand_range(ip, max_ip_count)?,
        IpType::Cidr => expand_cidr(ip, max_ip_count)?,
    };

    let mut seen = HashSet::with_capacity(addresses.len());
    Ok(addresses.into_iter().filter(|a| seen.insert(*a)).collect())
}

fn parse_addr(s: &str) -> Result<IpAddr, ExpandError> {
    s.trim().parse().map_err(|_| ExpandError::InvalidAddress(s.trim().to_string()))
}

fn check_size(count: u128, max: usize) -> Result<(), ExpandError> {
    if count > max as u128 {
        return Err(ExpandError::TooMany { count, max });
    }
    Ok(())
}

fn expand_range(spec: &str, max: usize) -> Result<Vec<IpAddr>, ExpandError> {
    let (start, end) = spec.split_once('-').ok_or_else(|| ExpandError::InvalidRange(spec.to_string()))?;
    let (start, end) = (parse_addr(start)?, parse_addr(end)?);

    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => {
            let (s, e) = (u32::from(s), u32::from(e));
            if s > e {
                return Err(ExpandError::Reversed);
            }
            check_size(u128::from(e - s) + 1, max)?;
            Ok((s..=e).map(|n| IpAddr::V4(Ipv4Addr::from(n))).collect())
        }
        (IpAddr::V6(s), IpAddr::V6(e)) => {
            let (s, e) = (u128::from(s), u128::from(e));
            if s > e {
                return Err(ExpandError::Reversed);
            }
            // e - s + 1 overflows only for the full address space
            check_size((e - s).saturating_add(1), max)?;
            Ok((s..=e).map(|n| IpAddr::V6(Ipv6Addr::from(n))).collect())
        }
        _ => Err(ExpandError::MixedFamilies),
    }
}

fn expand_cidr(spec: &str, max: usize) -> Result<Vec<IpAddr>, ExpandError> {
    let invalid = || ExpandError::InvalidCidr(spec.to_string());
    let (addr, prefix) = spec.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.trim().parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let size = 1u64 << (32 - prefix);
    check_size(u128::from(size), max)?;

    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let network = u64::from(u32::from(addr) & mask);
    // Network and broadcast addresses are included
    Ok((network..network + size)
        .filter_map(|n| u32::try_from(n).ok())
        .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(ips: Vec<IpAddr>) -> Vec<String> {
        ips.into_iter().map(|ip| ip.to_string()).collect()
    }

    #[test]
    fn single_address() {
        assert_eq!(strings(expand(" 10.0.0.7 ", IpType::Single, 1024)), vec!["10.0.0.7"]);
        assert_eq!(strings(expand("fe80::1", IpType::Single, 1024)), vec!["fe80::1"]);
        assert!(expand("10.0.0.256", IpType::Single, 1024).is_empty());
    }

    #[test]
    fn inclusive_range() {
        assert_eq!(
            strings(expand("10.0.0.1-10.0.0.3", IpType::Range, 1024)),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
        assert_eq!(expand("10.0.0.254-10.0.1.1", IpType::Range, 1024).len(), 4);
        assert_eq!(expand("10.0.0.5-10.0.0.5", IpType::Range, 1024).len(), 1);
        assert_eq!(strings(expand("2001:db8::1-2001:db8::2", IpType::Range, 1024)), vec!["2001:db8::1", "2001:db8::2"]);
    }

    #[test]
    fn invalid_ranges_are_empty() {
        assert!(expand("10.0.0.3-10.0.0.1", IpType::Range, 1024).is_empty());
        assert!(expand("10.0.0.1", IpType::Range, 1024).is_empty());
        assert!(expand("10.0.0.1-::1", IpType::Range, 1024).is_empty());
        assert_eq!(try_expand("10.0.0.3-10.0.0.1", IpType::Range, 1024), Err(ExpandError::Reversed));
    }

    #[test]
    fn cidr_includes_network_and_broadcast() {
        let ips = strings(expand("192.168.1.77/30", IpType::Cidr, 1024));
        assert_eq!(ips, vec!["192.168.1.76", "192.168.1.77", "192.168.1.78", "192.168.1.79"]);
        assert_eq!(expand("192.168.1.0/24", IpType::Cidr, 1024).len(), 256);
        assert_eq!(strings(expand("10.1.2.3/32", IpType::Cidr, 1024)), vec!["10.1.2.3"]);
    }

    #[test]
    fn invalid_cidrs_are_empty() {
        assert!(expand("10.0.0.0/33", IpType::Cidr, 1024).is_empty());
        assert!(expand("10.0.0.0", IpType::Cidr, 1024).is_empty());
        assert!(expand("2001:db8::/126", IpType::Cidr, 1024).is_empty());
    }

    #[test]
    fn oversized_requests_are_empty_not_truncated() {
        assert_eq!(expand("10.0.0.0/22", IpType::Cidr, 1024).len(), 1024);
        assert!(expand("10.0.0.0/21", IpType::Cidr, 1024).is_empty());
        assert!(expand("0.0.0.0/0", IpType::Cidr, 1024).is_empty());

        assert_eq!(expand("10.0.0.0-10.0.3.255", IpType::Range, 1024).len(), 1024);
        assert!(expand("10.0.0.0-10.0.4.0", IpType::Range, 1024).is_empty());
        assert!(expand("::-ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff", IpType::Range, 1024).is_empty());

        assert_eq!(
            try_expand("10.0.0.0/21", IpType::Cidr, 1024),
            Err(ExpandError::TooMany { count: 2048, max: 1024 })
        );
    }

    #[test]
    fn expansion_never_exceeds_limit() {
        for prefix in 0..=32 {
            let ips = expand(&format!("172.16.0.0/{prefix}"), IpType::Cidr, 300);
            assert!(ips.len() <= 300);
            assert!(ips.is_empty() || ips.len() == 1usize << (32 - prefix));
        }
    }
}
