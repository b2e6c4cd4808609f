//! Outbound address discovery.
//!
//! A UDP socket "connected" to a public host reveals which local address the
//! kernel routes through; no packet is sent. The server announces that
//! address as its server id when neither the configuration nor any option
//! names one.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::{UdpSocket, lookup_host};
use tracing::debug;

use crate::config::DhcpConfig;
use crate::error::{Error, Result};

/// Finds the local IPv4 address used to reach `discovery_host`.
///
/// # Errors
///
/// Returns [`Error::UpstreamTimeout`] if resolution does not finish within
/// `discovery_timeout_ms`, or [`Error::Transport`] if the host has no IPv4
/// address or the socket cannot be set up.
pub async fn discover_outbound_address(config: &DhcpConfig) -> Result<Ipv4Addr> {
    let target = format!("{}:{}", config.discovery_host, config.discovery_port);
    let timeout = config.discovery_timeout();

    let local = tokio::time::timeout(timeout, local_address_towards(&target))
        .await
        .map_err(|_| Error::UpstreamTimeout(target.clone()))??;
    debug!("Outbound address via {} is {}", target, local);
    Ok(local)
}

async fn local_address_towards(target: &str) -> Result<Ipv4Addr> {
    let remote = lookup_host(target)
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| Error::Transport(format!("{} has no IPv4 address", target)))?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(remote).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(address) if !address.is_unspecified() => Ok(address),
        other => Err(Error::Transport(format!(
            "no usable local address towards {} (got {})",
            target, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_discovery() {
        let config = DhcpConfig {
            discovery_host: "127.0.0.1".to_string(),
            discovery_port: 9,
            ..DhcpConfig::default()
        };
        let address = discover_outbound_address(&config).await.unwrap();
        assert_eq!(address, Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_ipv6_only_host_rejected() {
        let config = DhcpConfig {
            discovery_host: "[::1]".to_string(),
            discovery_port: 9,
            ..DhcpConfig::default()
        };
        assert!(discover_outbound_address(&config).await.is_err());
    }
}
