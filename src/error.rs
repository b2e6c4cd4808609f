//! Error types shared by the DHCP and DNS daemons.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::{Ipv4Addr, SocketAddr};

/// Errors that can occur while allocating leases or resolving queries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or data files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A network, address, client or option violates its invariants.
    ///
    /// Raised before anything is written, so a failed save never leaves
    /// partial state behind.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every candidate address for the client was taken.
    ///
    /// The DHCP server declines to answer when it sees this.
    #[error("No address available for client {0}")]
    NoAddressAvailable(String),

    /// Reply options were requested for a client without a bound address.
    #[error("Client {0} has no address assigned")]
    AddressNotAssigned(String),

    /// A DHCP REQUEST asked for an address other than the one in the ledger.
    #[error("Requested address {requested} does not match assigned {assigned}")]
    RequestedAddressMismatch {
        requested: Ipv4Addr,
        assigned: Ipv4Addr,
    },

    /// The upstream resolver or discovery host did not answer in time.
    #[error("Timed out waiting for {0}")]
    UpstreamTimeout(String),

    /// Upstream exchange failed for a reason other than a timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed DHCP packet received.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// Malformed DNS message received or produced.
    #[error("DNS protocol error: {0}")]
    Dns(#[from] hickory_proto::error::ProtoError),

    /// Listening socket could not be bound. Fatal at startup.
    #[error("Error binding {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Invalid daemon configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No entity with the given key exists in the repository.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Wraps a bind failure with an operator-facing explanation.
    pub fn bind(addr: SocketAddr, error: std::io::Error) -> Self {
        let reason = match error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                "You don't have permission to access that port.".to_string()
            }
            std::io::ErrorKind::AddrInUse => "That port is already in use.".to_string(),
            std::io::ErrorKind::AddrNotAvailable => {
                "That IP address can't be assigned to.".to_string()
            }
            _ => error.to_string(),
        };
        Self::Bind { addr, reason }
    }
}

/// A specialized Result type for casanet operations.
pub type Result<T> = std::result::Result<T, Error>;
