//! Repository of every persisted entity and its async handle.
//!
//! [`Records`] holds the entity tables (options, networks, addresses,
//! clients, lease history, DNS records and filters). Entities refer to each
//! other by key only; relationships are resolved through lookups here. Every
//! `create_*`/`save_*` method validates before it mutates, so a rejected save
//! leaves the tables untouched.
//!
//! [`Store`] shares one `Records` between request tasks:
//!
//! - [`RwLock`] around the tables; [`Store::write`] is the critical section
//!   for check-then-assign sequences
//! - [`Mutex`] around file writes
//! - debounced JSON snapshots to `data_file`, forced by [`Store::save`]

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::client::{Client, MacAddress};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::{DnsKey, DnsRecord, RootFilter};
use crate::ledger::LeaseRecord;
use crate::network::{Address, AddressId, Network, NetworkId, router_blocks};
use crate::options::{DhcpOption, OptionCode, OptionId};

/// Minimum interval between snapshot writes (5 seconds).
const SAVE_INTERVAL_MILLIS: u64 = 5000;

/// Entities stored in a keyed table.
pub trait Keyed {
    type Key: Ord;

    fn key(&self) -> Self::Key;
}

impl Keyed for DhcpOption {
    type Key = OptionId;

    fn key(&self) -> OptionId {
        self.id
    }
}

impl Keyed for Network {
    type Key = NetworkId;

    fn key(&self) -> NetworkId {
        self.id
    }
}

impl Keyed for Address {
    type Key = AddressId;

    fn key(&self) -> AddressId {
        self.id
    }
}

impl Keyed for Client {
    type Key = MacAddress;

    fn key(&self) -> MacAddress {
        self.mac.clone()
    }
}

impl Keyed for DnsRecord {
    type Key = DnsKey;

    fn key(&self) -> DnsKey {
        self.key.clone()
    }
}

impl Keyed for RootFilter {
    type Key = String;

    fn key(&self) -> String {
        self.pattern.clone()
    }
}

/// Tables are written as plain arrays and re-keyed on load.
mod table {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Keyed;

    pub fn serialize<K, V, S>(table: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(table.values())
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        V: Keyed + Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let rows = Vec::<V>::deserialize(deserializer)?;
        Ok(rows.into_iter().map(|row| (row.key(), row)).collect())
    }
}

/// All persisted entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Records {
    #[serde(with = "table")]
    options: BTreeMap<OptionId, DhcpOption>,
    #[serde(with = "table")]
    networks: BTreeMap<NetworkId, Network>,
    #[serde(with = "table")]
    addresses: BTreeMap<AddressId, Address>,
    #[serde(with = "table")]
    clients: BTreeMap<MacAddress, Client>,
    leases: Vec<LeaseRecord>,
    #[serde(with = "table")]
    dns_records: BTreeMap<DnsKey, DnsRecord>,
    #[serde(with = "table")]
    filters: BTreeMap<String, RootFilter>,
    #[serde(skip)]
    address_index: HashMap<(NetworkId, Ipv4Addr), AddressId>,
}

fn next_key<K: Copy, V>(table: &BTreeMap<K, V>, raw: impl Fn(K) -> u32) -> u32 {
    table.keys().next_back().map(|key| raw(*key) + 1).unwrap_or(1)
}

fn validate_dns_key(key: &DnsKey) -> Result<()> {
    if key.qname.is_empty() {
        return Err(Error::Validation("DNS record needs a name".to_string()));
    }
    Ok(())
}

impl Records {
    /// Parses a snapshot and rebuilds the lookup indexes.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut records: Records = serde_json::from_str(content)?;
        records.address_index = records
            .addresses
            .values()
            .map(|address| ((address.network, address.ip), address.id))
            .collect();
        Ok(records)
    }

    // Options

    pub fn option(&self, id: OptionId) -> Option<&DhcpOption> {
        self.options.get(&id)
    }

    pub fn options(&self) -> impl Iterator<Item = &DhcpOption> {
        self.options.values()
    }

    pub fn create_option(&mut self, mut option: DhcpOption, separator: &str) -> Result<OptionId> {
        option.validate(separator)?;
        option.id = OptionId(next_key(&self.options, |id| id.0));
        let id = option.id;
        self.options.insert(id, option);
        Ok(id)
    }

    /// Removes an option nobody references.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] while a client or network still lists
    /// the option; call [`Records::detach_option`] first.
    pub fn delete_option(&mut self, id: OptionId) -> Result<DhcpOption> {
        let referenced = self.clients.values().any(|client| client.options.contains(&id))
            || self.networks.values().any(|network| network.options.contains(&id));
        if referenced {
            return Err(Error::Validation(format!(
                "option {} is still attached to a client or network",
                id.0
            )));
        }
        self.options
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("option {}", id.0)))
    }

    /// Drops every reference to the option.
    pub fn detach_option(&mut self, id: OptionId) {
        for client in self.clients.values_mut() {
            client.options.retain(|option| *option != id);
        }
        for network in self.networks.values_mut() {
            network.options.retain(|option| *option != id);
        }
    }

    fn check_options_exist(&self, ids: &[OptionId]) -> Result<()> {
        match ids.iter().find(|id| !self.options.contains_key(id)) {
            Some(missing) => Err(Error::Validation(format!("unknown option {}", missing.0))),
            None => Ok(()),
        }
    }

    fn find_in<'a>(&'a self, ids: &[OptionId], code: OptionCode) -> Option<&'a DhcpOption> {
        ids.iter()
            .filter_map(|id| self.options.get(id))
            .find(|option| option.code == code)
    }

    /// The client's own option with `code`, if attached.
    pub fn client_option(&self, client: &Client, code: OptionCode) -> Option<&DhcpOption> {
        self.find_in(&client.options, code)
    }

    pub fn network_option(&self, network: &Network, code: OptionCode) -> Option<&DhcpOption> {
        self.find_in(&network.options, code)
    }

    // Networks

    pub fn network(&self, id: NetworkId) -> Option<&Network> {
        self.networks.get(&id)
    }

    pub fn network_by_name(&self, name: &str) -> Option<&Network> {
        self.networks
            .values()
            .find(|network| network.name.as_deref() == Some(name))
    }

    /// Networks in creation order.
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn network_of(&self, address: AddressId) -> Option<&Network> {
        self.addresses
            .get(&address)
            .and_then(|address| self.networks.get(&address.network))
    }

    pub fn create_network(&mut self, mut network: Network) -> Result<NetworkId> {
        network.id = NetworkId(next_key(&self.networks, |id| id.0));
        self.check_network(&network)?;
        let id = network.id;
        self.networks.insert(id, network);
        Ok(id)
    }

    pub fn save_network(&mut self, network: Network) -> Result<()> {
        if !self.networks.contains_key(&network.id) {
            return Err(Error::NotFound(format!("network {}", network.id.0)));
        }
        self.check_network(&network)?;
        self.networks.insert(network.id, network);
        Ok(())
    }

    fn check_network(&self, network: &Network) -> Result<()> {
        network.validate()?;
        self.check_options_exist(&network.options)?;

        for other in self.networks.values().filter(|other| other.id != network.id) {
            if other.routers == network.routers && other.prefix_len == network.prefix_len {
                return Err(Error::Validation(format!("network {} already exists", network)));
            }
            if network.name.is_some() && other.name == network.name {
                return Err(Error::Validation(format!(
                    "network name {:?} is taken",
                    network.name.as_deref().unwrap_or_default()
                )));
            }
        }

        for address in self.addresses.values().filter(|a| a.network == network.id) {
            network.check_member(address.ip)?;
        }
        Ok(())
    }

    // Addresses

    pub fn address(&self, id: AddressId) -> Option<&Address> {
        self.addresses.get(&id)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.addresses.values()
    }

    pub fn find_address(&self, network: NetworkId, ip: Ipv4Addr) -> Option<&Address> {
        self.address_index
            .get(&(network, ip))
            .and_then(|id| self.addresses.get(id))
    }

    /// Stores `ip` as a new address of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the address is a router, lies outside
    /// the network's block or already exists.
    pub fn create_address(&mut self, network: NetworkId, ip: Ipv4Addr) -> Result<AddressId> {
        let owner = self
            .networks
            .get(&network)
            .ok_or_else(|| Error::NotFound(format!("network {}", network.0)))?;
        owner.check_member(ip)?;
        if self.address_index.contains_key(&(network, ip)) {
            return Err(Error::Validation(format!("{} already exists in {}", ip, owner)));
        }

        let id = AddressId(next_key(&self.addresses, |id| id.0));
        self.addresses.insert(id, Address { id, network, ip });
        self.address_index.insert((network, ip), id);
        Ok(id)
    }

    // Clients

    pub fn client(&self, mac: &MacAddress) -> Option<&Client> {
        self.clients.get(mac)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn create_client(&mut self, client: Client, separator: &str) -> Result<()> {
        if self.clients.contains_key(&client.mac) {
            return Err(Error::Validation(format!("client {} already exists", client.mac)));
        }
        self.save_client(client, separator)
    }

    /// Returns the stored client, registering a blank one on first sight.
    pub fn get_or_create_client(&mut self, mac: &MacAddress) -> Client {
        self.clients
            .entry(mac.clone())
            .or_insert_with(|| Client::new(mac.clone()))
            .clone()
    }

    /// Validates and upserts a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a static client has no address, or
    /// the address violates the client's effective router/mask geometry.
    pub fn save_client(&mut self, client: Client, separator: &str) -> Result<()> {
        self.check_options_exist(&client.options)?;

        if client.is_static && client.address.is_none() {
            return Err(Error::Validation(format!(
                "static client {} must have an address",
                client.mac
            )));
        }

        if let Some(id) = client.address {
            let address = self
                .addresses
                .get(&id)
                .ok_or_else(|| Error::Validation(format!("unknown address {}", id.0)))?;
            let network = self
                .networks
                .get(&address.network)
                .ok_or_else(|| Error::NotFound(format!("network {}", address.network.0)))?;
            self.check_client_address(&client, network, address.ip, separator)?;
        }

        self.clients.insert(client.mac.clone(), client);
        Ok(())
    }

    /// Checks `ip` against the client's routers and mask, falling back to the
    /// network's when the client has no override.
    pub fn check_client_address(
        &self,
        client: &Client,
        network: &Network,
        ip: Ipv4Addr,
        separator: &str,
    ) -> Result<()> {
        let routers = match self.client_option(client, OptionCode::Router) {
            Some(option) => option
                .parse_value(separator)?
                .as_addresses()
                .unwrap_or_default(),
            None => network.routers.clone(),
        };
        let prefix_len = self
            .client_prefix_len(client, separator)
            .unwrap_or(network.prefix_len);

        if routers.contains(&ip) {
            return Err(Error::Validation(format!("router IP {} is not allowed", ip)));
        }
        let blocks = router_blocks(&routers, prefix_len)?;
        if !blocks.iter().any(|block| block.contains(&ip)) {
            return Err(Error::Validation(format!(
                "{} is outside the client's network",
                ip
            )));
        }
        Ok(())
    }

    /// Prefix length from the client's own `subnet_mask` option.
    pub fn client_prefix_len(&self, client: &Client, separator: &str) -> Option<u8> {
        let option = self.client_option(client, OptionCode::SubnetMask)?;
        let mask = option.parse_value(separator).ok()?.as_addresses()?;
        mask.first()
            .and_then(|mask| ipnet::ipv4_mask_to_prefix(*mask).ok())
    }

    // Lease history

    pub fn leases(&self) -> &[LeaseRecord] {
        &self.leases
    }

    pub(crate) fn leases_mut(&mut self) -> &mut Vec<LeaseRecord> {
        &mut self.leases
    }

    // DNS

    pub fn dns_record(&self, key: &DnsKey) -> Option<&DnsRecord> {
        self.dns_records.get(key)
    }

    pub fn dns_records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.dns_records.values()
    }

    /// Fetches the record for `key`, stamping `last_query`, or creates it.
    ///
    /// Returns the record and whether it was created by this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for the root name, which is never cached.
    pub fn lookup_or_create_dns(
        &mut self,
        key: &DnsKey,
        now: DateTime<Utc>,
    ) -> Result<(DnsRecord, bool)> {
        validate_dns_key(key)?;
        match self.dns_records.get_mut(key) {
            Some(record) => {
                record.last_query = now;
                Ok((record.clone(), false))
            }
            None => {
                let record = DnsRecord::new(key.clone(), now);
                self.dns_records.insert(key.clone(), record.clone());
                Ok((record, true))
            }
        }
    }

    pub fn save_dns_record(&mut self, record: DnsRecord) -> Result<()> {
        validate_dns_key(&record.key)?;
        self.dns_records.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn filter(&self, pattern: &str) -> Option<&RootFilter> {
        self.filters.get(pattern)
    }

    pub fn filters(&self) -> impl Iterator<Item = &RootFilter> {
        self.filters.values()
    }

    pub fn save_filter(&mut self, filter: RootFilter) -> Result<()> {
        if filter.pattern.is_empty() {
            return Err(Error::Validation("filter pattern must not be empty".to_string()));
        }
        self.filters.insert(filter.pattern.clone(), filter);
        Ok(())
    }

    pub fn delete_filter(&mut self, pattern: &str) -> Option<RootFilter> {
        self.filters.remove(pattern)
    }
}

#[derive(Debug)]
struct InternalState {
    records: Records,
    dirty: bool,
    last_save: Instant,
}

/// Shared, persisted repository handle.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use casanet::{Config, Store};
///
/// # async fn example() -> casanet::Result<()> {
/// let store = Store::new(Arc::new(Config::default())).await?;
/// let networks = store.read(|records| records.networks().count()).await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Store {
    state: Arc<RwLock<InternalState>>,
    config: Arc<Config>,
    data_path: String,
    save_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Opens the repository, loading `data_file` if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let data_path = config.data_file.clone();
        let records = Self::load_records(&data_path).await?;

        let state = InternalState {
            records,
            dirty: false,
            last_save: Instant::now(),
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            config,
            data_path,
            save_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn load_records<P: AsRef<Path>>(path: P) -> Result<Records> {
        let path = path.as_ref();
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Records::from_json(&content)
        } else {
            Ok(Records::default())
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Runs `f` against a consistent view of the tables.
    pub async fn read<R>(&self, f: impl FnOnce(&Records) -> R) -> R {
        let state = self.state.read().await;
        f(&state.records)
    }

    /// Runs `f` with exclusive access to the tables.
    ///
    /// No other reader or writer observes the tables until `f` returns, so
    /// a lookup followed by a create inside `f` cannot race. `f` works on a
    /// draft that replaces the tables only when it returns `Ok`.
    pub async fn write<R>(&self, f: impl FnOnce(&mut Records) -> Result<R>) -> Result<R> {
        let mut state = self.state.write().await;
        let mut draft = state.records.clone();
        let value = f(&mut draft)?;
        state.records = draft;
        state.dirty = true;
        self.maybe_save(&mut state).await?;
        Ok(value)
    }

    pub async fn snapshot(&self) -> Records {
        self.read(Records::clone).await
    }

    async fn maybe_save(&self, state: &mut InternalState) -> Result<()> {
        if state.dirty && state.last_save.elapsed().as_millis() >= SAVE_INTERVAL_MILLIS as u128 {
            let records = state.records.clone();
            state.dirty = false;
            state.last_save = Instant::now();

            let _lock = self.save_lock.lock().await;
            let content = serde_json::to_string_pretty(&records)?;
            tokio::fs::write(&self.data_path, content).await?;
            debug!("Saved records to {}", self.data_path);
        }
        Ok(())
    }

    /// Forces an immediate snapshot to disk.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.read().await;
        let records = state.records.clone();
        drop(state);

        let _lock = self.save_lock.lock().await;
        let content = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(&self.data_path, content).await?;

        let mut state = self.state.write().await;
        state.dirty = false;
        state.last_save = Instant::now();

        Ok(())
    }
}
