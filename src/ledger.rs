//! Lease history.
//!
//! The ledger is an ordered history of (address, client) grants. It answers
//! who holds an address and whether the address may be handed to someone
//! else. Each (client, address) pair appears once; recording the pair again
//! moves it to "now", which is how a renewal extends a lease.
//!
//! # Expiry
//!
//! A grant expires `lease_time` seconds after it was recorded. The lease time
//! is resolved as the client's own `lease_time` option, then the address's
//! network `lease_time` option, then the configured default.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::cascade::cascade;
use crate::client::{Client, MacAddress};
use crate::config::DhcpConfig;
use crate::network::AddressId;
use crate::options::OptionCode;
use crate::store::Records;

/// One grant of an address to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub address: AddressId,
    pub client: MacAddress,
    pub timestamp: DateTime<Utc>,
}

/// Appends a grant, or refreshes the timestamp of an existing pair.
pub fn record(records: &mut Records, address: AddressId, client: &MacAddress, now: DateTime<Utc>) {
    let leases = records.leases_mut();
    leases.retain(|lease| !(lease.address == address && lease.client == *client));
    leases.push(LeaseRecord {
        address,
        client: client.clone(),
        timestamp: now,
    });
    leases.sort_by_key(|lease| lease.timestamp);
}

/// Read-only queries over the lease history.
pub struct Ledger<'a> {
    records: &'a Records,
    config: &'a DhcpConfig,
}

impl<'a> Ledger<'a> {
    pub fn new(records: &'a Records, config: &'a DhcpConfig) -> Self {
        Self { records, config }
    }

    /// The most recent grant of `address`, if any.
    pub fn last_grant(&self, address: AddressId) -> Option<&'a LeaseRecord> {
        self.records
            .leases()
            .iter()
            .rev()
            .find(|lease| lease.address == address)
    }

    /// The client from the most recent grant of `address`.
    pub fn current_holder(&self, address: AddressId) -> Option<&'a Client> {
        self.last_grant(address)
            .and_then(|lease| self.records.client(&lease.client))
    }

    /// Seconds a grant of `address` to `client` lasts.
    pub fn lease_time(&self, client: &Client, address: AddressId) -> u32 {
        let separator = self.config.list_separator.as_str();
        let from_option = |option: Option<&crate::options::DhcpOption>| {
            option
                .and_then(|option| option.parse_value(separator).ok())
                .and_then(|value| value.as_unsigned())
        };

        cascade(&[
            &|| from_option(self.records.client_option(client, OptionCode::LeaseTime)),
            &|| {
                let network = self.records.network_of(address)?;
                from_option(self.records.network_option(network, OptionCode::LeaseTime))
            },
        ])
        .unwrap_or(self.config.lease_time_seconds)
    }

    pub fn is_expired(&self, lease: &LeaseRecord) -> bool {
        self.is_expired_at(lease, Utc::now())
    }

    pub fn is_expired_at(&self, lease: &LeaseRecord, now: DateTime<Utc>) -> bool {
        let Some(client) = self.records.client(&lease.client) else {
            return true;
        };
        let lease_time = TimeDelta::seconds(self.lease_time(client, lease.address) as i64);
        now > lease.timestamp + lease_time
    }

    pub fn is_available(&self, address: AddressId) -> bool {
        self.is_available_at(address, Utc::now())
    }

    /// Whether `address` may be granted to a new client at `now`.
    ///
    /// It may when its last holder has since moved to another address, or
    /// when the last grant has expired and the holder is not static.
    pub fn is_available_at(&self, address: AddressId, now: DateTime<Utc>) -> bool {
        let Some(lease) = self.last_grant(address) else {
            return true;
        };
        let Some(holder) = self.records.client(&lease.client) else {
            return true;
        };

        if holder.address != Some(address) {
            return true;
        }

        !holder.is_static && self.is_expired_at(lease, now)
    }

    /// Distinct addresses once granted to `mac`, most recent first.
    pub fn history(&self, mac: &MacAddress) -> Vec<AddressId> {
        let mut seen = Vec::new();
        for lease in self.records.leases().iter().rev() {
            if lease.client == *mac && !seen.contains(&lease.address) {
                seen.push(lease.address);
            }
        }
        seen
    }
}
