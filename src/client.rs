//! DHCP clients, keyed by hardware address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::AddressId;
use crate::options::OptionId;

/// Size of the BOOTP `chaddr` field.
pub const MAX_HARDWARE_LEN: usize = 16;

/// A normalized MAC address (`aa:bb:cc:dd:ee:ff`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Formats a hardware address of 1 to 16 bytes.
    ///
    /// Accepts exactly what [`FromStr`] accepts, so every stored address
    /// loads back.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > MAX_HARDWARE_LEN {
            return Err(Error::Validation(format!(
                "hardware address must be 1 to {} bytes, got {}",
                MAX_HARDWARE_LEN,
                bytes.len()
            )));
        }
        let parts: Vec<String> = bytes.iter().map(|byte| format!("{:02x}", byte)).collect();
        Ok(Self(parts.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase().replace('-', ":");
        let bytes = normalized
            .split(':')
            .map(|part| u8::from_str_radix(part, 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::Validation(format!("{:?} is not a MAC address", raw)))?;

        Self::from_bytes(&bytes)
            .map_err(|_| Error::Validation(format!("{:?} is not a MAC address", raw)))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A DHCP client ("user") and its current binding.
///
/// Relationships are held as repository keys; the address and options are
/// resolved through [`Records`](crate::store::Records).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub mac: MacAddress,
    pub name: Option<String>,
    /// Pinned clients keep their address regardless of lease expiry.
    #[serde(rename = "static")]
    pub is_static: bool,
    pub address: Option<AddressId>,
    pub options: Vec<OptionId>,
}

impl Client {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            name: None,
            is_static: false,
            address: None,
            options: Vec::new(),
        }
    }
}
