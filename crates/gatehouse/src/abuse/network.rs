//! Address-level network heuristics.

use std::net::IpAddr;

/// Whether `a` and `b` share a /24 (IPv4) or /64 (IPv6) prefix.
/// IPv4-mapped IPv6 addresses compare as IPv4.
pub fn same_subnet(a: IpAddr, b: IpAddr) -> bool {
    match (a.to_canonical(), b.to_canonical()) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
        _ => false,
    }
}

/// Crude proxy/VPN signal: RFC 1918 space, or IPv6 unique-local (fc00::/7).
///
/// A public faucet should never see these behind a correctly configured
/// proxy, so their presence hints at tunnelling or header spoofing.
pub fn likely_proxy(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_slash_24() {
        assert!(same_subnet(ip("203.0.113.7"), ip("203.0.113.250")));
        assert!(!same_subnet(ip("203.0.113.7"), ip("203.0.114.7")));
        assert!(same_subnet(ip("203.0.113.7"), ip("::ffff:203.0.113.9")));
    }

    #[test]
    fn test_ipv6_slash_64() {
        assert!(same_subnet(ip("2001:db8:1:2::1"), ip("2001:db8:1:2:ffff::9")));
        assert!(!same_subnet(ip("2001:db8:1:2::1"), ip("2001:db8:1:3::1")));
        assert!(!same_subnet(ip("2001:db8::1"), ip("203.0.113.7")));
    }

    #[test]
    fn test_private_ranges_flagged() {
        for addr in ["10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.1.1", "fd00::1"] {
            assert!(likely_proxy(ip(addr)), "{addr}");
        }
        for addr in ["172.32.0.1", "8.8.8.8", "2001:db8::1"] {
            assert!(!likely_proxy(ip(addr)), "{addr}");
        }
    }
}
