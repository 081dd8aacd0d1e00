use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use rand::RngCore;

/// Network address of the subnet (`ip & mask`).
pub fn first_addr(n: Ipv4Net) -> Ipv4Addr {
    n.network()
}

/// Broadcast address of the subnet (`ip | !mask`).
pub fn last_addr(n: Ipv4Net) -> Ipv4Addr {
    n.broadcast()
}

/// Number of addresses in the subnet, network and broadcast included.
pub fn total_addresses(n: Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(n.prefix_len()))
}

/// Uniformly random address inside the subnet. The host bits come from
/// the OS random source; no bias correction is needed because the host
/// range is a power of two.
pub fn random_addr(n: Ipv4Net) -> Ipv4Addr {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    let r = u32::from(Ipv4Addr::from(bytes));
    let base = u32::from(n.network());
    let host_mask = !u32::from(n.netmask());
    Ipv4Addr::from(base | (host_mask & r))
}

/// Offset an address by a signed number of steps.
pub fn ip_add(ip: Ipv4Addr, offset: i64) -> Ipv4Addr {
    let v = (i64::from(u32::from(ip)) + offset) as u32;
    Ipv4Addr::from(v)
}

/// Bind a host address to a subnet's prefix length, e.g. to carry
/// "10.1.6.50/24" around as a single value.
pub fn host(n: Ipv4Net, ip: Ipv4Addr) -> Ipv4Net {
    // prefix_len comes from an existing Ipv4Net, so this cannot fail
    Ipv4Net::new(ip, n.prefix_len()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn first_and_last() {
        let n = net("10.1.6.77/24");
        assert_eq!(first_addr(n), Ipv4Addr::new(10, 1, 6, 0));
        assert_eq!(last_addr(n), Ipv4Addr::new(10, 1, 6, 255));

        let n = net("10.1.6.4/30");
        assert_eq!(first_addr(n), Ipv4Addr::new(10, 1, 6, 4));
        assert_eq!(last_addr(n), Ipv4Addr::new(10, 1, 6, 7));
    }

    #[test]
    fn first_is_mask_complement_of_last() {
        for s in ["10.1.6.0/24", "192.168.0.0/16", "10.0.0.0/8", "10.1.6.4/30"] {
            let n = net(s);
            let host_mask = !u32::from(n.netmask());
            let first = u32::from(first_addr(n));
            assert_eq!(Ipv4Addr::from(first | host_mask), last_addr(n));
        }
    }

    #[test]
    fn totals() {
        assert_eq!(total_addresses(net("10.1.6.0/24")), 256);
        assert_eq!(total_addresses(net("10.1.6.0/30")), 4);
        assert_eq!(total_addresses(net("10.1.6.1/32")), 1);
    }

    #[test]
    fn random_stays_inside_subnet() {
        let n = net("10.1.6.0/24");
        for _ in 0..256 {
            let ip = random_addr(n);
            assert!(n.contains(&ip), "{ip} outside {n}");
        }
    }

    #[test]
    fn random_covers_host_range() {
        // On a /30 all four host patterns should show up quickly.
        let n = net("10.1.6.4/30");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..512 {
            seen.insert(random_addr(n));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn offsets() {
        assert_eq!(
            ip_add(Ipv4Addr::new(10, 1, 6, 0), 3),
            Ipv4Addr::new(10, 1, 6, 3)
        );
        assert_eq!(
            ip_add(Ipv4Addr::new(10, 1, 6, 255), -2),
            Ipv4Addr::new(10, 1, 6, 253)
        );
    }

    #[test]
    fn host_binding() {
        let n = net("10.1.6.0/24");
        let h = host(n, Ipv4Addr::new(10, 1, 6, 50));
        assert_eq!(h.to_string(), "10.1.6.50/24");
    }
}
