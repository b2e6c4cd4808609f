//! # casanet
//!
//! A home-network DHCP lease allocator and a policy-driven caching DNS relay
//! sharing one persisted repository.
//!
//! ## Features
//!
//! - DHCP DISCOVER/REQUEST handling with OFFER, ACK and NAK replies
//! - Lease history per address, with expiry and static clients
//! - Multi-router networks scanned block by block
//! - Options cascading from client to network to built-in defaults
//! - DNS answers served from cache, relayed upstream or silently refused
//!   according to suffix filters
//! - JSON persistence across restarts
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use casanet::{Config, DhcpServer, Store};
//!
//! #[tokio::main]
//! async fn main() -> casanet::Result<()> {
//!     let config = Arc::new(Config::load_or_create("casanet-config.json")?);
//!     let store = Arc::new(Store::new(config).await?);
//!     let server = DhcpServer::new(store).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Store`] - repository of networks, addresses, clients, options, leases
//!   and DNS records
//! - [`allocation::ensure_address`] - picks the address a client may use
//! - [`Ledger`] - lease history and availability
//! - [`OptionResolver`] - option lists for replies
//! - [`DhcpServer`] - listens on UDP port 67
//! - [`FilterHierarchy`] - lock and relay policy for a query name
//! - [`DnsResolver`] / [`DnsServer`] - the DNS side

pub mod allocation;
pub mod cascade;
pub mod client;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod dns_server;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod network;
pub mod options;
pub mod packet;
pub mod rdata;
pub mod reply;
pub mod server;
pub mod store;

pub use client::{Client, MacAddress};
pub use config::Config;
pub use dns::{DnsResolver, UdpUpstream, Upstream};
pub use dns_server::DnsServer;
pub use error::{Error, Result};
pub use filter::{DnsKey, DnsRecord, FilterHierarchy, RootFilter};
pub use ledger::{LeaseRecord, Ledger};
pub use network::{Address, AddressId, Network, NetworkId};
pub use options::{DhcpOption, MessageType, OptionCode, OptionValue};
pub use packet::DhcpPacket;
pub use reply::{OptionResolver, ReplyOption};
pub use server::DhcpServer;
pub use store::{Records, Store};
