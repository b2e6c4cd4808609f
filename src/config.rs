use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_LEASE_SECONDS: u32 = 43200;
pub const DEFAULT_DNS_PORT: u16 = 5353;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_file: String,
    pub dhcp: DhcpConfig,
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub lease_time_seconds: u32,
    pub list_separator: String,
    pub discovery_host: String,
    pub discovery_port: u16,
    pub discovery_timeout_ms: u64,
    pub server_ip: Option<Ipv4Addr>,
    pub default_network: Option<String>,
    pub scan_boundary_addresses: bool,
    pub dispatch: Dispatch,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    pub packet_size: PacketSize,
    pub upstream_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub cached_ttl: u32,
    pub transport: Transport,
    pub dispatch: Dispatch,
}

/// How received datagrams/connections are handed to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// One task per request.
    Spawn,
    /// Requests are handled one after another on the accept loop.
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

/// Maximum DNS message size, either a named profile or a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PacketSize {
    Profile(PacketProfile),
    Bytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketProfile {
    /// RFC 1035 UDP limit.
    Standard,
    Extended,
    /// EDNS size recommended by RFC 3226.
    Large,
}

impl PacketSize {
    pub fn bytes(self) -> usize {
        match self {
            Self::Profile(PacketProfile::Standard) => 512,
            Self::Profile(PacketProfile::Extended) => 2048,
            Self::Profile(PacketProfile::Large) => 4000,
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: "casanet.json".to_string(),
            dhcp: DhcpConfig::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            lease_time_seconds: DEFAULT_LEASE_SECONDS,
            list_separator: ",".to_string(),
            discovery_host: "github.com".to_string(),
            discovery_port: 80,
            discovery_timeout_ms: 2000,
            server_ip: None,
            default_network: None,
            scan_boundary_addresses: false,
            dispatch: Dispatch::Spawn,
            request_timeout_ms: 5000,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_DNS_PORT),
            upstream: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            packet_size: PacketSize::Profile(PacketProfile::Standard),
            upstream_timeout_ms: 2000,
            request_timeout_ms: 5000,
            cached_ttl: 60,
            transport: Transport::Udp,
            dispatch: Dispatch::Spawn,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dhcp.list_separator.is_empty() {
            return Err(Error::InvalidConfig(
                "dhcp.list_separator must not be empty".to_string(),
            ));
        }

        if self.dhcp.lease_time_seconds == 0 {
            return Err(Error::InvalidConfig(
                "dhcp.lease_time_seconds must be greater than 0".to_string(),
            ));
        }

        if self.dhcp.discovery_timeout_ms == 0
            || self.dhcp.request_timeout_ms == 0
            || self.dns.upstream_timeout_ms == 0
            || self.dns.request_timeout_ms == 0
        {
            return Err(Error::InvalidConfig(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if self.dns.packet_size.bytes() < 512 {
            return Err(Error::InvalidConfig(format!(
                "dns.packet_size {} is below the 512 byte minimum",
                self.dns.packet_size.bytes()
            )));
        }

        Ok(())
    }
}

impl DhcpConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DnsConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Parses a listen argument of the form `port`, `ipv4:port` or `[ipv6]:port`.
///
/// A bare port binds the loopback address of the selected family.
pub fn parse_listen(addrport: &str, use_ipv6: bool) -> Result<SocketAddr> {
    if let Ok(port) = addrport.parse::<u16>() {
        let ip = if use_ipv6 {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        return Ok(SocketAddr::new(ip, port));
    }

    let addr: SocketAddr = addrport.parse().map_err(|_| {
        Error::InvalidConfig(format!(
            "\"{}\" is not a valid port number or address:port pair",
            addrport
        ))
    })?;

    if use_ipv6 && addr.is_ipv4() {
        return Err(Error::InvalidConfig(format!(
            "\"{}\" is not a valid IPv6 address",
            addr.ip()
        )));
    }

    Ok(addr)
}
