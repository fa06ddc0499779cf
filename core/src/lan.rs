//! LAN predicate: decides whether two peers' private endpoints are
//! plausibly on the same local network, and whether they sit behind the
//! same public IP (hairpin NAT).

use std::net::{IpAddr, Ipv4Addr};

use crate::mapping::NetworkInfo;

/// RFC 1918 private ranges paired with the subnet mask granularity at which
/// two addresses in that range are considered "the same LAN".
const RFC1918_RANGES: &[(Ipv4Addr, u8, u8)] = &[
    (Ipv4Addr::new(10, 0, 0, 0), 8, 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12, 16),
    (Ipv4Addr::new(192, 168, 0, 0), 16, 24),
];

fn mask(addr: u32, prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        addr & (u32::MAX << (32 - prefix))
    }
}

fn same_rfc1918_subnet(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    let a_bits = u32::from(a);
    let b_bits = u32::from(b);

    for &(base, range_prefix, match_prefix) in RFC1918_RANGES {
        let base_bits = u32::from(base);
        if mask(a_bits, range_prefix) == mask(base_bits, range_prefix)
            && mask(b_bits, range_prefix) == mask(base_bits, range_prefix)
        {
            return mask(a_bits, match_prefix) == mask(b_bits, match_prefix);
        }
    }
    false
}

/// True when `local` and `remote` are close enough to attempt a LAN-direct
/// handshake: either their private endpoints fall in the same RFC 1918
/// subnet (at the granularity appropriate to that range), or they already
/// share a public IP (same NAT box, hairpin routing applies).
pub fn is_lan(local: &NetworkInfo, remote: &NetworkInfo) -> bool {
    if local.public_endpoint.ip() == remote.public_endpoint.ip() {
        return true;
    }

    match (local.private_endpoint.ip(), remote.private_endpoint.ip()) {
        (IpAddr::V4(a), IpAddr::V4(b)) => same_rfc1918_subnet(a, b),
        _ => false,
    }
}
