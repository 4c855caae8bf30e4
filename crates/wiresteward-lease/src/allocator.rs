//! IP address allocation over a managed subnet.
//!
//! Everything here is pure address arithmetic: callers pass the subnet, the
//! reserved set and the currently allocated set explicitly, and get back the
//! lowest eligible address. Nothing is remembered between calls.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;

/// The subnet has no eligible address left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no address available in subnet")]
pub struct NoAddressAvailable;

/// A CIDR block leases are drawn from, plus the addresses that are never leased.
#[derive(Debug, Clone)]
pub struct ManagedSubnet {
    /// Network CIDR.
    network: Ipv4Net,
    /// Server's own address inside the network.
    server_ip: Ipv4Addr,
    /// Network address, broadcast address (when the prefix has one), server
    /// address and any extra reservations.
    reserved: HashSet<Ipv4Addr>,
}

impl ManagedSubnet {
    /// Create a managed subnet.
    ///
    /// If `server_ip` is None the server takes the first host address (e.g. `.1`).
    pub fn new(network: Ipv4Net, server_ip: Option<Ipv4Addr>) -> Result<Self, String> {
        let network = network.trunc();
        let server_ip = server_ip.unwrap_or_else(|| increment(network.network()));

        if !network.contains(&server_ip) {
            return Err(format!(
                "server IP {} is not within subnet {}",
                server_ip, network
            ));
        }
        if server_ip == network.network() {
            return Err(format!(
                "server IP {} is the network address of {}",
                server_ip, network
            ));
        }

        let mut reserved = HashSet::new();
        reserved.insert(network.network());
        if has_broadcast(&network) {
            if server_ip == network.broadcast() {
                return Err(format!(
                    "server IP {} is the broadcast address of {}",
                    server_ip, network
                ));
            }
            reserved.insert(network.broadcast());
        }
        reserved.insert(server_ip);

        Ok(Self {
            network,
            server_ip,
            reserved,
        })
    }

    /// Reserve an additional address so it is never leased.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> Result<(), String> {
        if !self.network.contains(&ip) {
            return Err(format!("{} is not within subnet {}", ip, self.network));
        }
        self.reserved.insert(ip);
        Ok(())
    }

    /// Get the network CIDR.
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Get the server's address.
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// Addresses never handed out.
    pub fn reserved(&self) -> &HashSet<Ipv4Addr> {
        &self.reserved
    }

    /// Lowest eligible address given what is already allocated.
    pub fn next_available(
        &self,
        allocated: &HashSet<Ipv4Addr>,
    ) -> Result<Ipv4Addr, NoAddressAvailable> {
        next_available(&self.network, &self.reserved, allocated)
    }

    /// Number of addresses that can ever be leased.
    pub fn capacity(&self) -> usize {
        candidates(&self.network)
            .filter(|ip| !self.reserved.contains(ip))
            .count()
    }
}

/// /31 and /32 networks have no broadcast address (RFC 3021).
fn has_broadcast(network: &Ipv4Net) -> bool {
    network.prefix_len() < 31
}

/// Increment an address by one, carrying across octets from right to left.
///
/// `10.10.10.255` becomes `10.10.11.0`; `255.255.255.255` wraps to `0.0.0.0`.
pub fn increment(addr: Ipv4Addr) -> Ipv4Addr {
    let mut octets = addr.octets();
    for octet in octets.iter_mut().rev() {
        let (next, overflow) = octet.overflowing_add(1);
        *octet = next;
        if !overflow {
            break;
        }
    }
    Ipv4Addr::from(octets)
}

/// Every address of `network` after the base address, in ascending order.
///
/// Iteration ends as soon as the increment leaves the CIDR or wraps past the
/// top of the address space, so addresses outside `network` are never produced.
fn candidates(network: &Ipv4Net) -> impl Iterator<Item = Ipv4Addr> + '_ {
    let base = network.network();
    let mut current = base;
    std::iter::from_fn(move || {
        let next = increment(current);
        if next == base || !network.contains(&next) || next == Ipv4Addr::UNSPECIFIED {
            return None;
        }
        current = next;
        Some(next)
    })
}

/// All eligible addresses of `network`, ascending.
pub fn available_addresses(
    network: &Ipv4Net,
    reserved: &HashSet<Ipv4Addr>,
    allocated: &HashSet<Ipv4Addr>,
) -> Vec<Ipv4Addr> {
    candidates(network)
        .filter(|ip| !reserved.contains(ip) && !allocated.contains(ip))
        .collect()
}

/// The lowest eligible address of `network`.
///
/// Fails with [`NoAddressAvailable`] when every address is reserved or
/// allocated; it never retries, so the caller decides whether to reclaim.
pub fn next_available(
    network: &Ipv4Net,
    reserved: &HashSet<Ipv4Addr>,
    allocated: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr, NoAddressAvailable> {
    candidates(network)
        .find(|ip| !reserved.contains(ip) && !allocated.contains(ip))
        .ok_or(NoAddressAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    fn set(ips: &[Ipv4Addr]) -> HashSet<Ipv4Addr> {
        ips.iter().copied().collect()
    }

    #[test]
    fn test_increment_carries_octets() {
        assert_eq!(increment(ip(10, 10, 10, 0)), ip(10, 10, 10, 1));
        assert_eq!(increment(ip(10, 10, 10, 255)), ip(10, 10, 11, 0));
        assert_eq!(increment(ip(10, 255, 255, 255)), ip(11, 0, 0, 0));
        assert_eq!(increment(ip(255, 255, 255, 255)), ip(0, 0, 0, 0));
    }

    #[test]
    fn test_available_addresses_skip_allocated() {
        let network: Ipv4Net = "10.10.10.0/29".parse().unwrap();
        let reserved = set(&[network.network(), network.broadcast()]);
        let allocated = set(&[ip(10, 10, 10, 1), ip(10, 10, 10, 3)]);

        let available = available_addresses(&network, &reserved, &allocated);
        assert_eq!(
            available,
            vec![
                ip(10, 10, 10, 2),
                ip(10, 10, 10, 4),
                ip(10, 10, 10, 5),
                ip(10, 10, 10, 6)
            ]
        );
    }

    #[test]
    fn test_next_available_is_lowest_eligible() {
        let network: Ipv4Net = "10.10.10.0/29".parse().unwrap();
        let reserved = set(&[network.network(), network.broadcast(), ip(10, 10, 10, 1)]);
        let allocated = set(&[ip(10, 10, 10, 2)]);
        assert_eq!(
            next_available(&network, &reserved, &allocated),
            Ok(ip(10, 10, 10, 3))
        );
    }

    #[test]
    fn test_next_available_exhausted() {
        let network: Ipv4Net = "10.0.0.0/30".parse().unwrap();
        let reserved = set(&[network.network(), network.broadcast()]);
        let allocated = set(&[ip(10, 0, 0, 1), ip(10, 0, 0, 2)]);
        assert_eq!(
            next_available(&network, &reserved, &allocated),
            Err(NoAddressAvailable)
        );
    }

    #[test]
    fn test_never_leaves_subnet() {
        // Subnet crossing an octet boundary; the last address must not spill over.
        let network: Ipv4Net = "10.0.0.128/25".parse().unwrap();
        let all = available_addresses(&network, &HashSet::new(), &HashSet::new());
        assert_eq!(all.first(), Some(&ip(10, 0, 0, 129)));
        assert_eq!(all.last(), Some(&ip(10, 0, 0, 255)));
        assert!(all.iter().all(|a| network.contains(a)));

        let top: Ipv4Net = "255.255.255.252/30".parse().unwrap();
        let all = available_addresses(&top, &HashSet::new(), &HashSet::new());
        assert_eq!(all, vec![ip(255, 255, 255, 253), ip(255, 255, 255, 254), ip(255, 255, 255, 255)]);
    }

    #[test]
    fn test_never_returns_reserved_or_allocated() {
        let network: Ipv4Net = "192.168.4.0/27".parse().unwrap();
        let reserved = set(&[network.network(), network.broadcast(), ip(192, 168, 4, 1)]);
        let mut allocated = HashSet::new();
        while let Ok(next) = next_available(&network, &reserved, &allocated) {
            assert!(!reserved.contains(&next));
            assert!(allocated.insert(next), "{} returned twice", next);
        }
        // 32 addresses minus network, broadcast and server.
        assert_eq!(allocated.len(), 29);
    }

    #[test]
    fn test_managed_subnet_defaults() {
        let subnet = ManagedSubnet::new("10.0.0.0/24".parse().unwrap(), None).unwrap();
        assert_eq!(subnet.server_ip(), ip(10, 0, 0, 1));
        assert!(subnet.reserved().contains(&ip(10, 0, 0, 0)));
        assert!(subnet.reserved().contains(&ip(10, 0, 0, 255)));
        assert!(subnet.reserved().contains(&ip(10, 0, 0, 1)));
        assert_eq!(subnet.capacity(), 253);
        assert_eq!(subnet.next_available(&HashSet::new()), Ok(ip(10, 0, 0, 2)));
    }

    #[test]
    fn test_managed_subnet_normalizes_host_bits() {
        let subnet = ManagedSubnet::new("10.0.0.77/24".parse().unwrap(), None).unwrap();
        assert_eq!(subnet.network().to_string(), "10.0.0.0/24");
        assert_eq!(subnet.server_ip(), ip(10, 0, 0, 1));
    }

    #[test]
    fn test_managed_subnet_rejects_bad_server_ip() {
        let network: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert!(ManagedSubnet::new(network, Some(ip(10, 0, 1, 1))).is_err());
        assert!(ManagedSubnet::new(network, Some(ip(10, 0, 0, 0))).is_err());
        assert!(ManagedSubnet::new(network, Some(ip(10, 0, 0, 255))).is_err());
    }

    #[test]
    fn test_point_to_point_subnet_has_no_broadcast() {
        let subnet = ManagedSubnet::new("10.0.0.0/31".parse().unwrap(), None).unwrap();
        assert_eq!(subnet.server_ip(), ip(10, 0, 0, 1));
        assert_eq!(subnet.capacity(), 0);
    }
}
