//! Address allocation.
//!
//! [`ensure_address`] decides which address a client may use, searching the
//! client's lease history and then the configured networks when its current
//! address is no longer usable. The whole decision, including creating a new
//! [`Address`](crate::network::Address) and recording the lease, runs inside
//! one [`Store::write`] critical section, so two concurrent requests can
//! never claim the same address.
//!
//! # Search order
//!
//! 1. The client's current address, if it is static, still held by the
//!    client, or available.
//! 2. Each address from the client's history, most recent first. The
//!    client's `router` option and the candidate network's routers are
//!    combined with the client's mask into router blocks. A candidate inside
//!    one of those blocks is reused when available. Otherwise, if the routers
//!    span several blocks, the lowest block is scanned for a host that has
//!    no address record yet, falling back to the first available one.
//! 3. The default network (or every network, oldest first) is scanned the
//!    same way.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use tracing::{debug, warn};

use crate::client::{Client, MacAddress};
use crate::config::DhcpConfig;
use crate::error::{Error, Result};
use crate::ledger::{self, Ledger};
use crate::network::{AddressId, Network, router_blocks, scan_hosts, smallest_block};
use crate::options::OptionCode;
use crate::store::{Records, Store};

/// Ensures `mac` has a usable address, assigning one if needed.
///
/// # Errors
///
/// Returns [`Error::NoAddressAvailable`] when every candidate is taken. The
/// client row is kept even then.
pub async fn ensure_address(store: &Store, mac: &MacAddress) -> Result<AddressId> {
    let config = store.config().dhcp.clone();
    store
        .write(|records| {
            records.get_or_create_client(mac);
            Ok(())
        })
        .await?;
    store
        .write(|records| ensure_address_at(records, &config, mac, Utc::now()))
        .await
}

/// Synchronous core of [`ensure_address`], evaluated at `now`.
pub fn ensure_address_at(
    records: &mut Records,
    config: &DhcpConfig,
    mac: &MacAddress,
    now: DateTime<Utc>,
) -> Result<AddressId> {
    let mut client = records.get_or_create_client(mac);

    if let Some(current) = client.address
        && is_usable(records, config, &client, current, now)
    {
        ledger::record(records, current, mac, now);
        return Ok(current);
    }

    let history = Ledger::new(records, config).history(mac);
    let found = match search_history(records, config, &client, &history, now)? {
        Some(found) => Some(found),
        None => search_networks(records, config, &client, now)?,
    };

    let Some(address) = found else {
        warn!("No address available for {}", mac);
        return Err(Error::NoAddressAvailable(mac.to_string()));
    };

    client.address = Some(address);
    records.save_client(client, &config.list_separator)?;
    ledger::record(records, address, mac, now);
    Ok(address)
}

fn is_usable(
    records: &Records,
    config: &DhcpConfig,
    client: &Client,
    address: AddressId,
    now: DateTime<Utc>,
) -> bool {
    if client.is_static {
        return true;
    }
    let holds_it = Ledger::new(records, config)
        .last_grant(address)
        .is_some_and(|lease| lease.client == client.mac);
    holds_it || is_free(records, config, &client.mac, address, now)
}

/// Available per the ledger and not pinned to another static client.
fn is_free(
    records: &Records,
    config: &DhcpConfig,
    mac: &MacAddress,
    address: AddressId,
    now: DateTime<Utc>,
) -> bool {
    let pinned = records
        .clients()
        .any(|other| other.mac != *mac && other.is_static && other.address == Some(address));
    !pinned && Ledger::new(records, config).is_available_at(address, now)
}

/// The client's `router` option followed by the network's routers.
fn effective_routers(records: &Records, config: &DhcpConfig, client: &Client, network: &Network) -> Vec<Ipv4Addr> {
    let mut routers = records
        .client_option(client, OptionCode::Router)
        .and_then(|option| option.parse_value(&config.list_separator).ok())
        .and_then(|value| value.as_addresses())
        .unwrap_or_default();
    routers.extend(network.routers.iter().copied());
    routers
}

fn fits_client(records: &Records, config: &DhcpConfig, client: &Client, network: &Network, ip: Ipv4Addr) -> bool {
    network.check_member(ip).is_ok()
        && records
            .check_client_address(client, network, ip, &config.list_separator)
            .is_ok()
}

fn search_history(
    records: &mut Records,
    config: &DhcpConfig,
    client: &Client,
    history: &[AddressId],
    now: DateTime<Utc>,
) -> Result<Option<AddressId>> {
    for candidate in history {
        let Some(address) = records.address(*candidate).cloned() else {
            continue;
        };
        let Some(network) = records.network(address.network).cloned() else {
            continue;
        };

        let routers = effective_routers(records, config, client, &network);
        let prefix_len = records
            .client_prefix_len(client, &config.list_separator)
            .unwrap_or(network.prefix_len);
        let blocks = router_blocks(&routers, prefix_len)?;

        let reusable = blocks.iter().any(|block| block.contains(&address.ip))
            && is_free(records, config, &client.mac, address.id, now)
            && fits_client(records, config, client, &network, address.ip);
        if reusable {
            debug!("Reusing {} from the history of {}", address.ip, client.mac);
            return Ok(Some(address.id));
        }

        if blocks.len() > 1
            && let Some(block) = smallest_block(&blocks)
            && let Some(found) = scan_block(records, config, client, &network, block, &routers, now)?
        {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn search_networks(
    records: &mut Records,
    config: &DhcpConfig,
    client: &Client,
    now: DateTime<Utc>,
) -> Result<Option<AddressId>> {
    let networks: Vec<Network> = match &config.default_network {
        Some(name) => match records.network_by_name(name) {
            Some(network) => vec![network.clone()],
            None => {
                warn!("Default network {:?} does not exist", name);
                Vec::new()
            }
        },
        None => records.networks().cloned().collect(),
    };

    for network in networks {
        let routers = effective_routers(records, config, client, &network);
        let block = network.block()?;
        if let Some(found) = scan_block(records, config, client, &network, block, &routers, now)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

/// First host of `block` without an address record, else the first
/// existing available one.
fn scan_block(
    records: &mut Records,
    config: &DhcpConfig,
    client: &Client,
    network: &Network,
    block: Ipv4Net,
    routers: &[Ipv4Addr],
    now: DateTime<Utc>,
) -> Result<Option<AddressId>> {
    let mut fallback = None;

    for ip in scan_hosts(block, config.scan_boundary_addresses) {
        if routers.contains(&ip) || !fits_client(records, config, client, network, ip) {
            continue;
        }

        match records.find_address(network.id, ip).map(|address| address.id) {
            None => {
                debug!("Creating address {} in {}", ip, network);
                return records.create_address(network.id, ip).map(Some);
            }
            Some(existing) => {
                if fallback.is_none() && is_free(records, config, &client.mac, existing, now) {
                    fallback = Some(existing);
                }
            }
        }
    }

    Ok(fallback)
}
