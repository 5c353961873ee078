//! Peer address allocation
//!
//! Picks the lowest free host address of the interface subnet. The used set
//! is rebuilt from the live dump on every call, so allocation has no side
//! effects: only writing the peer into the config marks an address as taken.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{ProtocolError, Result};

/// Address allocator for one interface subnet
#[derive(Debug, Clone)]
pub struct IpAllocator {
    /// Interface subnet
    network: Ipv4Net,
    /// Addresses currently held by peers
    used: HashSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Create an allocator for the given CIDR
    ///
    /// # Example
    /// ```
    /// use awg_protocol::allocator::IpAllocator;
    ///
    /// let allocator = IpAllocator::new("10.8.0.0/24").unwrap();
    /// assert_eq!(allocator.next_available().unwrap().to_string(), "10.8.0.2");
    /// ```
    pub fn new(cidr: &str) -> Result<Self> {
        let network: Ipv4Net = cidr
            .parse()
            .map_err(|e| ProtocolError::ConfigFormat(format!("invalid CIDR {cidr}: {e}")))?;
        Ok(Self::from_network(network))
    }

    pub fn from_network(network: Ipv4Net) -> Self {
        Self {
            network: network.trunc(),
            used: HashSet::new(),
        }
    }

    /// Mark addresses from `AllowedIPs` entries (`a.b.c.d/n` or bare) as used.
    ///
    /// Entries outside the subnet or that are not IPv4 are ignored.
    pub fn mark_used<'a, I>(&mut self, allowed_ips: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for entry in allowed_ips {
            let host = entry.split('/').next().unwrap_or(entry).trim();
            if let Ok(ip) = host.parse::<Ipv4Addr>() {
                if self.network.contains(&ip) {
                    self.used.insert(ip);
                }
            }
        }
    }

    /// The server's own address: network address + 1
    pub fn reserved(&self) -> Option<Ipv4Addr> {
        u32::from(self.network.network())
            .checked_add(1)
            .map(Ipv4Addr::from)
    }

    /// Lowest host address that is neither used nor reserved
    pub fn next_available(&self) -> Result<Ipv4Addr> {
        let reserved = self.reserved();
        self.network
            .hosts()
            .find(|ip| Some(*ip) != reserved && !self.used.contains(ip))
            .ok_or_else(|| ProtocolError::SubnetExhausted(self.network.to_string()))
    }

    /// Validate a caller-chosen address
    pub fn check_available(&self, ip: Ipv4Addr) -> Result<()> {
        if !self.network.contains(&ip) || !self.network.hosts().any(|host| host == ip) {
            return Err(ProtocolError::AddressNotInSubnet(
                ip,
                self.network.to_string(),
            ));
        }
        if Some(ip) == self.reserved() {
            return Err(ProtocolError::AddressReserved(ip));
        }
        if self.used.contains(&ip) {
            return Err(ProtocolError::AddressInUse(ip));
        }
        Ok(())
    }

    pub fn is_used(&self, ip: Ipv4Addr) -> bool {
        self.used.contains(&ip)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(&ip)
    }

    /// Number of addresses in use
    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Number of host addresses peers can get (reserved address excluded)
    pub fn capacity(&self) -> u32 {
        let reserved = self.reserved();
        self.network.hosts().filter(|ip| Some(*ip) != reserved).count() as u32
    }

    pub fn cidr(&self) -> String {
        self.network.to_string()
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }
}

/// Parse a requested peer address: IPv4, optionally suffixed with `/32`
pub fn parse_requested(address: &str) -> Result<Ipv4Addr> {
    let trimmed = address.trim();
    let host = match trimmed.split_once('/') {
        Some((host, "32")) => host,
        Some(_) => return Err(ProtocolError::InvalidAddress(address.to_string())),
        None => trimmed,
    };
    host.parse()
        .map_err(|_| ProtocolError::InvalidAddress(address.to_string()))
}

/// `a.b.c.d/32`
pub fn host_cidr(ip: Ipv4Addr) -> String {
    format!("{ip}/32")
}
