//! Networks and the addresses allocated inside them.
//!
//! A network is described by its router addresses and a subnet mask. A
//! network may be multihomed onto several routers, but every router combined
//! with the mask must denote the same CIDR block.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::options::{OptionId, parse_address_list};

pub const DEFAULT_DOMAIN: &str = "local";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: Option<String>,
    pub routers: Vec<Ipv4Addr>,
    pub prefix_len: u8,
    pub name_servers: Vec<Ipv4Addr>,
    pub domain: String,
    pub options: Vec<OptionId>,
}

impl Network {
    /// Builds a network from its textual description.
    ///
    /// `routers` and `name_servers` are `separator`-delimited address lists;
    /// `mask` is a dotted netmask or a prefix length (`"/16"` or `"16"`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if any address is malformed or the
    /// routers do not all resolve to one block.
    pub fn parse(routers: &str, mask: &str, name_servers: &str, separator: &str) -> Result<Self> {
        let network = Self {
            id: NetworkId::default(),
            name: None,
            routers: parse_address_list(routers, separator)?,
            prefix_len: parse_prefix_len(mask)?,
            name_servers: parse_address_list(name_servers, separator)?,
            domain: DEFAULT_DOMAIN.to_string(),
            options: Vec::new(),
        };
        network.validate()?;
        Ok(network)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Checks the single-block invariant.
    pub fn validate(&self) -> Result<()> {
        if self.routers.is_empty() {
            return Err(Error::Validation("network needs at least one router".to_string()));
        }
        if self.name_servers.is_empty() {
            return Err(Error::Validation(
                "network needs at least one name server".to_string(),
            ));
        }

        let blocks = router_blocks(&self.routers, self.prefix_len)?;
        if blocks.len() != 1 {
            return Err(Error::Validation(format!(
                "routers {} span {} networks, only one is allowed",
                join(&self.routers),
                blocks.len()
            )));
        }
        Ok(())
    }

    /// The CIDR block every router of this network lives in.
    pub fn block(&self) -> Result<Ipv4Net> {
        let router = self
            .routers
            .first()
            .ok_or_else(|| Error::Validation("network has no routers".to_string()))?;
        block_of(*router, self.prefix_len)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Net::new(Ipv4Addr::UNSPECIFIED, self.prefix_len)
            .map(|net| net.netmask())
            .unwrap_or(Ipv4Addr::BROADCAST)
    }

    pub fn is_router(&self, ip: Ipv4Addr) -> bool {
        self.routers.contains(&ip)
    }

    /// Checks that `ip` may be stored as an address of this network.
    pub fn check_member(&self, ip: Ipv4Addr) -> Result<()> {
        if self.is_router(ip) {
            return Err(Error::Validation(format!("router IP {} is not allowed", ip)));
        }
        if !self.block()?.contains(&ip) {
            return Err(Error::Validation(format!("{} is outside the network {}", ip, self)));
        }
        Ok(())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", join(&self.routers), self.prefix_len)
    }
}

/// An address that belongs to exactly one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub network: NetworkId,
    pub ip: Ipv4Addr,
}

/// Parses a dotted netmask, `/N` or `N` into a prefix length.
pub fn parse_prefix_len(mask: &str) -> Result<u8> {
    let trimmed = mask.trim();
    let digits = trimmed.strip_prefix('/').unwrap_or(trimmed);

    if let Ok(prefix) = digits.parse::<u8>() {
        if prefix > 32 {
            return Err(Error::Validation(format!("prefix length {} exceeds 32", prefix)));
        }
        return Ok(prefix);
    }

    let netmask: Ipv4Addr = trimmed
        .parse()
        .map_err(|_| Error::Validation(format!("{:?} is not a subnet mask", mask)))?;
    ipnet::ipv4_mask_to_prefix(netmask)
        .map_err(|_| Error::Validation(format!("{} is not a contiguous netmask", netmask)))
}

/// The block `ip/prefix_len`, truncated to its network address.
pub fn block_of(ip: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Net> {
    Ipv4Net::new(ip, prefix_len)
        .map(|net| net.trunc())
        .map_err(|_| Error::Validation(format!("invalid prefix length {}", prefix_len)))
}

/// Distinct blocks derived from `routers`, in first-seen order.
pub fn router_blocks(routers: &[Ipv4Addr], prefix_len: u8) -> Result<Vec<Ipv4Net>> {
    let mut seen = BTreeSet::new();
    let mut blocks = Vec::new();
    for router in routers {
        let block = block_of(*router, prefix_len)?;
        if seen.insert(block) {
            blocks.push(block);
        }
    }
    Ok(blocks)
}

/// The block with the lowest base address; ties go to the wider block.
pub fn smallest_block(blocks: &[Ipv4Net]) -> Option<Ipv4Net> {
    blocks
        .iter()
        .copied()
        .min_by_key(|block| (u32::from(block.network()), block.prefix_len()))
}

/// Host addresses of `block` in ascending order.
///
/// Network and broadcast addresses are skipped unless `include_boundaries`
/// is set; /31 and /32 blocks have no boundary addresses to skip.
pub fn scan_hosts(block: Ipv4Net, include_boundaries: bool) -> impl Iterator<Item = Ipv4Addr> {
    let start = u32::from(block.network());
    let end = u32::from(block.broadcast());
    let (first, last) = if include_boundaries || block.prefix_len() >= 31 {
        (start, end)
    } else {
        (start + 1, end - 1)
    };
    (first..=last).map(Ipv4Addr::from)
}

fn join(addresses: &[Ipv4Addr]) -> String {
    addresses
        .iter()
        .map(|address| address.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefix_len() {
        assert_eq!(parse_prefix_len("/16").unwrap(), 16);
        assert_eq!(parse_prefix_len("24").unwrap(), 24);
        assert_eq!(parse_prefix_len("255.255.255.0").unwrap(), 24);
        assert!(parse_prefix_len("255.0.255.0").is_err());
        assert!(parse_prefix_len("/33").is_err());
        assert!(parse_prefix_len("mask").is_err());
    }

    #[test]
    fn test_multihomed_network_in_one_block() {
        let network = Network::parse("10.0.0.1,10.0.1.1", "/16", "10.0.0.1", ",").unwrap();
        assert_eq!(network.block().unwrap(), "10.0.0.0/16".parse().unwrap());
        assert_eq!(network.netmask(), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(network.domain, "local");
    }

    #[test]
    fn test_routers_in_different_blocks_rejected() {
        let result = Network::parse("10.0.0.1,10.1.0.1", "/16", "8.8.8.8", ",");
        assert!(matches!(result, Err(Error::Validation(_))));

        let result = Network::parse("10.0.0.1,10.0.1.1", "/24", "8.8.8.8", ",");
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_malformed_network_rejected() {
        assert!(Network::parse("10.0.0.1", "/24", "dns.example", ",").is_err());
        assert!(Network::parse("router", "/24", "8.8.8.8", ",").is_err());
    }

    #[test]
    fn test_check_member() {
        let network = Network::parse("192.168.1.1", "255.255.255.0", "192.168.1.1", ",").unwrap();
        assert!(network.check_member(Ipv4Addr::new(192, 168, 1, 50)).is_ok());
        assert!(network.check_member(Ipv4Addr::new(192, 168, 1, 1)).is_err());
        assert!(network.check_member(Ipv4Addr::new(192, 168, 2, 50)).is_err());
    }

    #[test]
    fn test_router_blocks_deduplicate() {
        let routers = [
            Ipv4Addr::new(10, 0, 1, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 1, 254),
        ];
        let blocks = router_blocks(&routers, 24).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            smallest_block(&blocks).unwrap(),
            "10.0.0.0/24".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn test_scan_hosts_boundaries() {
        let block: Ipv4Net = "10.0.0.0/30".parse().unwrap();
        let hosts: Vec<_> = scan_hosts(block, false).collect();
        assert_eq!(hosts, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);

        let hosts: Vec<_> = scan_hosts(block, true).collect();
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 0));

        let single: Ipv4Net = "10.0.0.7/32".parse().unwrap();
        assert_eq!(scan_hosts(single, false).count(), 1);
    }
}
