//! Option lists for outgoing DHCP replies.
//!
//! Every attribute is resolved client first, then network, then a built-in
//! default, through [`cascade`]. The list always starts with the message type
//! and the six core options, in this order:
//!
//! 1. message type
//! 2. subnet mask
//! 3. server id
//! 4. lease time
//! 5. router
//! 6. domain
//! 7. name servers
//!
//! followed by every other known option the client or its network carries,
//! and an end marker.

use std::net::Ipv4Addr;

use crate::cascade::cascade;
use crate::client::Client;
use crate::config::DhcpConfig;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::network::Network;
use crate::options::{ALL_OPTION_CODES, MessageType, OptionCode, OptionValue};
use crate::store::Records;

const CORE_CODES: [OptionCode; 6] = [
    OptionCode::SubnetMask,
    OptionCode::ServerId,
    OptionCode::LeaseTime,
    OptionCode::Router,
    OptionCode::Domain,
    OptionCode::NameServer,
];

/// One entry of a reply's option list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOption {
    MessageType(MessageType),
    Value(OptionCode, OptionValue),
    End,
}

impl ReplyOption {
    pub fn code(&self) -> u8 {
        match self {
            Self::MessageType(_) => 53,
            Self::Value(code, _) => *code as u8,
            Self::End => 255,
        }
    }
}

/// Builds option lists for one client against a repository view.
pub struct OptionResolver<'a> {
    records: &'a Records,
    config: &'a DhcpConfig,
    discovered: Option<Ipv4Addr>,
}

impl<'a> OptionResolver<'a> {
    pub fn new(records: &'a Records, config: &'a DhcpConfig) -> Self {
        Self {
            records,
            config,
            discovered: None,
        }
    }

    /// Sets the outbound address used when nothing else names a server id.
    pub fn with_discovered(mut self, address: Option<Ipv4Addr>) -> Self {
        self.discovered = address;
        self
    }

    fn client_value(&self, client: &Client, code: OptionCode) -> Option<OptionValue> {
        self.records
            .client_option(client, code)
            .and_then(|option| option.parse_value(&self.config.list_separator).ok())
    }

    fn network_value(&self, network: Option<&Network>, code: OptionCode) -> Option<OptionValue> {
        network
            .and_then(|network| self.records.network_option(network, code))
            .and_then(|option| option.parse_value(&self.config.list_separator).ok())
    }

    /// Server id: explicit override, client option, network option, then
    /// the discovered outbound address.
    pub fn server_id(
        &self,
        client: &Client,
        network: Option<&Network>,
        override_id: Option<Ipv4Addr>,
    ) -> Result<OptionValue> {
        cascade(&[
            &|| override_id.map(OptionValue::Address),
            &|| self.client_value(client, OptionCode::ServerId),
            &|| self.network_value(network, OptionCode::ServerId),
            &|| self.discovered.map(OptionValue::Address),
        ])
        .ok_or_else(|| Error::Transport("no server address could be determined".to_string()))
    }

    /// The full option list for an offer or ack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotAssigned`] if the client has no address.
    pub fn build(
        &self,
        client: &Client,
        message_type: MessageType,
        server_id: Option<Ipv4Addr>,
    ) -> Result<Vec<ReplyOption>> {
        let address = client
            .address
            .ok_or_else(|| Error::AddressNotAssigned(client.mac.to_string()))?;
        let network = self
            .records
            .network_of(address)
            .ok_or_else(|| Error::NotFound(format!("network of address {}", address.0)))?;

        let subnet_mask = cascade(&[
            &|| self.client_value(client, OptionCode::SubnetMask),
            &|| Some(OptionValue::Address(network.netmask())),
        ]);
        let lease_time = Ledger::new(self.records, self.config).lease_time(client, address);
        let router = cascade(&[
            &|| self.client_value(client, OptionCode::Router),
            &|| Some(OptionValue::AddressList(network.routers.clone())),
        ]);
        let domain = cascade(&[
            &|| self.client_value(client, OptionCode::Domain),
            &|| Some(OptionValue::Text(network.domain.clone())),
        ]);
        let name_servers = cascade(&[
            &|| self.client_value(client, OptionCode::NameServer),
            &|| Some(OptionValue::AddressList(network.name_servers.clone())),
        ]);

        let mut options = vec![ReplyOption::MessageType(message_type)];
        let core = [
            (OptionCode::SubnetMask, subnet_mask),
            (
                OptionCode::ServerId,
                Some(self.server_id(client, Some(network), server_id)?),
            ),
            (OptionCode::LeaseTime, Some(OptionValue::Unsigned(lease_time))),
            (OptionCode::Router, router),
            (OptionCode::Domain, domain),
            (OptionCode::NameServer, name_servers),
        ];
        for (code, value) in core {
            if let Some(value) = value {
                options.push(ReplyOption::Value(code, value));
            }
        }

        for code in ALL_OPTION_CODES.iter().copied() {
            if CORE_CODES.contains(&code) {
                continue;
            }
            let value = cascade(&[
                &|| self.client_value(client, code),
                &|| self.network_value(Some(network), code),
            ]);
            if let Some(value) = value {
                options.push(ReplyOption::Value(code, value));
            }
        }

        options.push(ReplyOption::End);
        Ok(options)
    }

    /// A NAK carries only the message type and server id.
    pub fn nak(&self, client: &Client, server_id: Option<Ipv4Addr>) -> Result<Vec<ReplyOption>> {
        let network = client
            .address
            .and_then(|address| self.records.network_of(address));
        Ok(vec![
            ReplyOption::MessageType(MessageType::Nak),
            ReplyOption::Value(
                OptionCode::ServerId,
                self.server_id(client, network, server_id)?,
            ),
            ReplyOption::End,
        ])
    }
}
