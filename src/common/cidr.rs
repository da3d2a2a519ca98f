use std::fmt;
use std::net::Ipv4Addr;

/// An IPv4 network in `base/prefix` form. A bare address is a `/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub base: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    /// Parse `a.b.c.d[/n]`. Returns `None` for bad octets or `n > 32`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().ok()?),
            None => (s, 32),
        };
        if prefix > 32 {
            return None;
        }
        let base = addr.parse::<Ipv4Addr>().ok()?;
        Some(Self { base, prefix })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip4_in_network(ip, self.base, self.prefix)
    }

    /// True when every address of `other` lies inside `self`.
    pub fn covers(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && self.contains(other.base)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// Check if an IPv4 address falls within a network/prefix.
/// prefix=0 matches all. prefix>32 matches none.
pub fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = !0u32 << (32 - prefix);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

/// `true` if `address` lies in `cidr`. Anything unparseable (bad octets,
/// octets with leading zeros, prefix outside 0..=32, IPv6) is `false`,
/// never an error.
pub fn ip_in_range(address: &str, cidr: &str) -> bool {
    let Ok(ip) = address.trim().parse::<Ipv4Addr>() else {
        return false;
    };
    Ipv4Cidr::parse(cidr).is_some_and(|net| net.contains(ip))
}

/// `true` if the network `inner` (address or CIDR) is fully contained in `outer`.
pub fn cidr_within(inner: &str, outer: &str) -> bool {
    match (Ipv4Cidr::parse(inner), Ipv4Cidr::parse(outer)) {
        (Some(inner), Some(outer)) => outer.covers(&inner),
        _ => false,
    }
}
