//! Complement planning for firewall subnet blocking.
//!
//! Given the allowlist of trusted addresses and subnets, computes the rest
//! of the public-unicast IPv4 space as a minimal set of CIDRs. The result
//! feeds one big `Chess-Block-Other` firewall rule, so everything except
//! the trusted peers is blocked at the OS level.

use std::net::Ipv4Addr;

use ipnet::{Ipv4Net, Ipv4Subnets};

/// Public-unicast IPv4 space. Collectively excludes RFC1918, CGNAT,
/// loopback, link-local, documentation and multicast/reserved ranges.
const PUBLIC_UNICAST_RANGES: [(Ipv4Addr, u8); 13] = [
    (Ipv4Addr::new(1, 0, 0, 0), 8),
    (Ipv4Addr::new(2, 0, 0, 0), 7),
    (Ipv4Addr::new(4, 0, 0, 0), 6),
    (Ipv4Addr::new(8, 0, 0, 0), 7),
    (Ipv4Addr::new(11, 0, 0, 0), 8),
    (Ipv4Addr::new(12, 0, 0, 0), 6),
    (Ipv4Addr::new(16, 0, 0, 0), 4),
    (Ipv4Addr::new(32, 0, 0, 0), 3),
    (Ipv4Addr::new(64, 0, 0, 0), 2),
    (Ipv4Addr::new(128, 0, 0, 0), 2),
    (Ipv4Addr::new(192, 0, 0, 0), 9),
    (Ipv4Addr::new(208, 0, 0, 0), 4),
    (Ipv4Addr::new(224, 0, 0, 0), 3),
];

pub fn public_ranges() -> impl Iterator<Item = Ipv4Net> {
    PUBLIC_UNICAST_RANGES
        .iter()
        .filter_map(|(addr, prefix)| Ipv4Net::new(*addr, *prefix).ok())
}

/// Compute the public-unicast space minus every avoided address and subnet.
///
/// Pure and deterministic for a given input order. CPU-bound but small;
/// callers on the accept path run it through `spawn_blocking`.
pub fn plan(avoid_ips: &[Ipv4Addr], avoid_subnets: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let avoid: Vec<Ipv4Net> = avoid_ips
        .iter()
        .filter_map(|ip| Ipv4Net::new(*ip, 32).ok())
        .chain(avoid_subnets.iter().map(|net| net.trunc()))
        .collect();

    let mut subnets = Vec::new();
    for range in public_ranges() {
        let mut current = vec![range];
        for avoided in &avoid {
            current = current
                .into_iter()
                .flat_map(|r| exclude(r, *avoided))
                .collect();
        }
        subnets.extend(current);
    }
    subnets
}

/// Minimal CIDR partition of `range \ avoid` when `avoid` is a subrange;
/// `range` unchanged otherwise (partial overlap counts as no overlap here,
/// matching address-exclusion semantics).
fn exclude(range: Ipv4Net, avoid: Ipv4Net) -> Vec<Ipv4Net> {
    let range_lo = u32::from(range.network());
    let range_hi = u32::from(range.broadcast());
    let avoid_lo = u32::from(avoid.network());
    let avoid_hi = u32::from(avoid.broadcast());

    if avoid_lo < range_lo || avoid_hi > range_hi {
        return vec![range];
    }

    let mut out = Vec::new();
    if avoid_lo > range_lo {
        out.extend(cover(range_lo, avoid_lo - 1));
    }
    if avoid_hi < range_hi {
        out.extend(cover(avoid_hi + 1, range_hi));
    }
    out
}

fn cover(lo: u32, hi: u32) -> Ipv4Subnets {
    Ipv4Subnets::new(Ipv4Addr::from(lo), Ipv4Addr::from(hi), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn address_count(nets: &[Ipv4Net]) -> u64 {
        nets.iter().map(|n| 1u64 << (32 - n.prefix_len())).sum()
    }

    fn covers(nets: &[Ipv4Net], addr: Ipv4Addr) -> bool {
        nets.iter().any(|n| n.contains(&addr))
    }

    #[test]
    fn private_avoid_leaves_public_ranges_unchanged() {
        // 10.0.0.5 lies in no public range, so every range passes through
        let plan = plan(&[ip("10.0.0.5")], &[]);
        let expected: Vec<Ipv4Net> = public_ranges().collect();
        assert_eq!(plan, expected);
    }

    #[rstest]
    #[case(net("16.0.0.0/4"), net("16.0.0.0/5"), vec![net("24.0.0.0/5")])]
    #[case(net("16.0.0.0/4"), net("24.0.0.0/5"), vec![net("16.0.0.0/5")])]
    #[case(net("16.0.0.0/4"), net("16.0.0.0/4"), vec![])]
    #[case(net("16.0.0.0/4"), net("10.0.0.0/8"), vec![net("16.0.0.0/4")])]
    #[case(net("16.0.0.0/4"), net("0.0.0.0/0"), vec![net("16.0.0.0/4")])]
    fn exclusion_cases(
        #[case] range: Ipv4Net,
        #[case] avoid: Ipv4Net,
        #[case] expected: Vec<Ipv4Net>,
    ) {
        assert_eq!(exclude(range, avoid), expected);
    }

    #[test]
    fn excluding_single_address_splits_minimally() {
        let out = exclude(net("1.0.0.0/8"), net("1.2.3.4/32"));
        assert_eq!(address_count(&out), (1u64 << 24) - 1);
        assert!(!covers(&out, ip("1.2.3.4")));
        assert!(covers(&out, ip("1.2.3.3")));
        assert!(covers(&out, ip("1.2.3.5")));
        assert!(covers(&out, ip("1.0.0.0")));
        assert!(covers(&out, ip("1.255.255.255")));
    }

    #[test]
    fn plan_complement_is_exact() {
        // one avoided address inside 8.0.0.0/7, one avoided /8 inside 64.0.0.0/2
        let out = plan(&[ip("8.8.4.4")], &[net("64.0.0.0/8")]);

        let full = address_count(&public_ranges().collect::<Vec<_>>());
        assert_eq!(address_count(&out), full - 1 - (1u64 << 24));
        assert!(!covers(&out, ip("8.8.4.4")));
        assert!(covers(&out, ip("8.8.4.5")));
        assert!(!covers(&out, ip("64.1.2.3")));
        assert!(covers(&out, ip("65.0.0.1")));
        assert!(covers(&out, ip("1.1.1.1")));
    }

    #[test]
    fn plan_is_deterministic() {
        let ips = [ip("5.5.5.5"), ip("9.9.9.9")];
        let nets = [net("32.0.0.0/8")];
        assert_eq!(plan(&ips, &nets), plan(&ips, &nets));
    }

    #[test]
    fn host_bits_in_avoided_subnet_are_masked() {
        // 8.1.2.3/8 means 8.0.0.0/8 for exclusion purposes
        let out = plan(&[], &[net("8.1.2.3/8")]);
        assert!(!covers(&out, ip("8.8.8.8")));
        assert!(covers(&out, ip("9.9.9.9")));
    }
}
