//! DHCP options as stored and handed out by the allocator.
//!
//! An option is a numeric code from a fixed enumeration plus a textual value.
//! Options live in the repository and are attached by id to clients and
//! networks; the same option may be shared by several owners.
//!
//! Values are validated when saved, according to the code:
//!
//! - single-address codes (subnet mask, broadcast, server id) must parse as
//!   one IPv4 address
//! - server-list codes (router, name server, NTP, ...) must parse as a
//!   separator-delimited list of IPv4 addresses
//! - `lease_time` must be a non-negative integer, `time_zone` a signed one
//! - `hostname`, `domain` and `client_id` are free text
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Option codes an operator may attach to a client or network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OptionCode {
    SubnetMask = 1,
    TimeZone = 2,
    Router = 3,
    TimeServer = 4,
    NameServer = 6,
    LogServer = 7,
    CookieServer = 8,
    Hostname = 12,
    Domain = 15,
    BroadcastAddress = 28,
    NtpServer = 42,
    NetbiosServer = 44,
    NetbiosDistServer = 45,
    LeaseTime = 51,
    ServerId = 54,
    ClientId = 61,
    SmtpServer = 69,
    Pop3Server = 70,
    NntpServer = 71,
    WwwServer = 72,
}

/// Every option code in the order replies list them.
pub const ALL_OPTION_CODES: [OptionCode; 20] = [
    OptionCode::SubnetMask,
    OptionCode::TimeZone,
    OptionCode::Router,
    OptionCode::TimeServer,
    OptionCode::NameServer,
    OptionCode::LogServer,
    OptionCode::CookieServer,
    OptionCode::Hostname,
    OptionCode::Domain,
    OptionCode::BroadcastAddress,
    OptionCode::NtpServer,
    OptionCode::NetbiosServer,
    OptionCode::NetbiosDistServer,
    OptionCode::LeaseTime,
    OptionCode::ServerId,
    OptionCode::ClientId,
    OptionCode::SmtpServer,
    OptionCode::Pop3Server,
    OptionCode::NntpServer,
    OptionCode::WwwServer,
];

/// How an option's text value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Address,
    AddressList,
    Unsigned,
    Signed,
    Text,
}

impl OptionCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::SubnetMask => "subnet_mask",
            Self::TimeZone => "time_zone",
            Self::Router => "router",
            Self::TimeServer => "time_server",
            Self::NameServer => "name_server",
            Self::LogServer => "log_server",
            Self::CookieServer => "cookie_server",
            Self::Hostname => "hostname",
            Self::Domain => "domain",
            Self::BroadcastAddress => "broadcast_address",
            Self::NtpServer => "ntp_server",
            Self::NetbiosServer => "netbios_server",
            Self::NetbiosDistServer => "netbios_dist_server",
            Self::LeaseTime => "lease_time",
            Self::ServerId => "server_id",
            Self::ClientId => "client_id",
            Self::SmtpServer => "smtp_server",
            Self::Pop3Server => "pop3_server",
            Self::NntpServer => "nntp_server",
            Self::WwwServer => "www_server",
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Self::SubnetMask | Self::BroadcastAddress | Self::ServerId => ValueKind::Address,
            Self::Router
            | Self::TimeServer
            | Self::NameServer
            | Self::LogServer
            | Self::CookieServer
            | Self::NtpServer
            | Self::NetbiosServer
            | Self::NetbiosDistServer
            | Self::SmtpServer
            | Self::Pop3Server
            | Self::NntpServer
            | Self::WwwServer => ValueKind::AddressList,
            Self::LeaseTime => ValueKind::Unsigned,
            Self::TimeZone => ValueKind::Signed,
            Self::Hostname | Self::Domain | Self::ClientId => ValueKind::Text,
        }
    }
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        ALL_OPTION_CODES
            .iter()
            .copied()
            .find(|code| *code as u8 == value)
            .ok_or(value)
    }
}

impl FromStr for OptionCode {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let wanted = name.to_ascii_lowercase();
        ALL_OPTION_CODES
            .iter()
            .copied()
            .find(|code| code.name() == wanted)
            .or_else(|| {
                wanted
                    .parse::<u8>()
                    .ok()
                    .and_then(|value| OptionCode::try_from(value).ok())
            })
            .ok_or_else(|| Error::Validation(format!("Unknown DHCP option {}", name)))
    }
}

impl fmt::Display for OptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// A parsed option value, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Address(Ipv4Addr),
    AddressList(Vec<Ipv4Addr>),
    Unsigned(u32),
    Signed(i32),
    Text(String),
}

impl OptionValue {
    /// Parses `raw` according to `code`'s value kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the text does not fit the kind.
    pub fn parse(code: OptionCode, raw: &str, separator: &str) -> Result<Self> {
        match code.kind() {
            ValueKind::Address => parse_address(code, raw).map(Self::Address),
            ValueKind::AddressList => parse_address_list(raw, separator)
                .map_err(|error| Error::Validation(format!("{}: {}", code, error)))
                .map(Self::AddressList),
            ValueKind::Unsigned => raw.trim().parse::<u32>().map(Self::Unsigned).map_err(|_| {
                Error::Validation(format!("{} must be a non-negative integer, got {:?}", code, raw))
            }),
            ValueKind::Signed => raw.trim().parse::<i32>().map(Self::Signed).map_err(|_| {
                Error::Validation(format!("{} must be an integer, got {:?}", code, raw))
            }),
            ValueKind::Text => Ok(Self::Text(raw.to_string())),
        }
    }

    pub fn as_addresses(&self) -> Option<Vec<Ipv4Addr>> {
        match self {
            Self::Address(address) => Some(vec![*address]),
            Self::AddressList(addresses) => Some(addresses.clone()),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u32> {
        match self {
            Self::Unsigned(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{}", address),
            Self::AddressList(addresses) => {
                let joined: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
                write!(f, "{}", joined.join(","))
            }
            Self::Unsigned(value) => write!(f, "{}", value),
            Self::Signed(value) => write!(f, "{}", value),
            Self::Text(text) => f.write_str(text),
        }
    }
}

fn parse_address(code: OptionCode, raw: &str) -> Result<Ipv4Addr> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{} must be an IPv4 address, got {:?}", code, raw)))
}

/// Parses a separator-delimited list of IPv4 addresses.
pub fn parse_address_list(raw: &str, separator: &str) -> Result<Vec<Ipv4Addr>> {
    raw.split(separator)
        .map(|part| {
            part.trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| Error::Validation(format!("{:?} is not an IPv4 address", part)))
        })
        .collect()
}

/// Repository key of a stored option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OptionId(pub u32);

/// A stored option: code plus unparsed text value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpOption {
    pub id: OptionId,
    pub code: OptionCode,
    pub value: String,
}

impl DhcpOption {
    pub fn new(code: OptionCode, value: impl Into<String>) -> Self {
        Self {
            id: OptionId::default(),
            code,
            value: value.into(),
        }
    }

    /// Checks the value against the rules for its code.
    pub fn validate(&self, separator: &str) -> Result<()> {
        self.parse_value(separator).map(|_| ())
    }

    pub fn parse_value(&self, separator: &str) -> Result<OptionValue> {
        OptionValue::parse(self.code, &self.value, separator)
    }
}

impl fmt::Display for DhcpOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.code, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversions() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_option_code_lookup() {
        assert_eq!(OptionCode::try_from(51), Ok(OptionCode::LeaseTime));
        assert_eq!(OptionCode::try_from(50), Err(50));
        assert_eq!("lease_time".parse::<OptionCode>().unwrap(), OptionCode::LeaseTime);
        assert_eq!("NTP_server".parse::<OptionCode>().unwrap(), OptionCode::NtpServer);
        assert_eq!("3".parse::<OptionCode>().unwrap(), OptionCode::Router);
        assert!("requested_addr".parse::<OptionCode>().is_err());
    }

    #[test]
    fn test_address_option_validation() {
        assert!(DhcpOption::new(OptionCode::ServerId, "10.0.0.1").validate(",").is_ok());
        assert!(DhcpOption::new(OptionCode::ServerId, "10.0.0.300").validate(",").is_err());
        assert!(DhcpOption::new(OptionCode::SubnetMask, "10.0.0.1,10.0.0.2").validate(",").is_err());
    }

    #[test]
    fn test_address_list_validation() {
        let option = DhcpOption::new(OptionCode::NameServer, "8.8.8.8, 8.8.4.4");
        assert_eq!(
            option.parse_value(",").unwrap(),
            OptionValue::AddressList(vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)])
        );
        assert!(DhcpOption::new(OptionCode::Router, "10.0.0.1,nope").validate(",").is_err());
        assert!(DhcpOption::new(OptionCode::Router, "10.0.0.1;10.0.1.1").validate(";").is_ok());
    }

    #[test]
    fn test_integer_option_validation() {
        assert!(DhcpOption::new(OptionCode::LeaseTime, "3600").validate(",").is_ok());
        assert!(DhcpOption::new(OptionCode::LeaseTime, "-1").validate(",").is_err());
        assert!(DhcpOption::new(OptionCode::TimeZone, "-3600").validate(",").is_ok());
        assert!(DhcpOption::new(OptionCode::TimeZone, "utc").validate(",").is_err());
    }

    #[test]
    fn test_text_options_accept_anything() {
        assert!(DhcpOption::new(OptionCode::Hostname, "printer").validate(",").is_ok());
        assert!(DhcpOption::new(OptionCode::Domain, "home.lan").validate(",").is_ok());
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::Discover), "DISCOVER");
        assert_eq!(format!("{}", MessageType::Offer), "OFFER");
        assert_eq!(format!("{}", MessageType::Nak), "NAK");
    }
}
