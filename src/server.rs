//! DHCP daemon: socket setup, per-datagram dispatch and DISCOVER/REQUEST
//! handling.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::allocation::ensure_address;
use crate::client::MacAddress;
use crate::config::Dispatch;
use crate::discovery::discover_outbound_address;
use crate::error::{Error, Result};
use crate::network::AddressId;
use crate::options::MessageType;
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::reply::OptionResolver;
use crate::store::Store;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    handler: PacketHandler,
    dispatch: Dispatch,
}

impl DhcpServer {
    /// Binds port 67 and settles the address announced as server id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the socket cannot be bound, or a discovery
    /// error when no `server_ip` is configured and discovery fails.
    pub async fn new(store: Arc<Store>) -> Result<Self> {
        let config = Arc::clone(store.config());
        let server_ip = match config.dhcp.server_ip {
            Some(ip) => ip,
            None => discover_outbound_address(&config.dhcp).await?,
        };

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        let socket = Arc::new(Self::create_socket(bind_addr)?);

        info!("DHCP server starting on {} as {}", bind_addr, server_ip);
        let networks = store.read(|records| records.networks().count()).await;
        info!("{} network(s) configured", networks);

        Ok(Self {
            handler: PacketHandler {
                store,
                socket,
                server_ip,
                timeout: config.dhcp.request_timeout(),
            },
            dispatch: config.dhcp.dispatch,
        })
    }

    fn create_socket(bind_addr: SocketAddrV4) -> Result<UdpSocket> {
        let addr = SocketAddr::V4(bind_addr);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Transport(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Transport(format!("Failed to set SO_REUSEADDR: {}", error)))?;
        socket
            .set_broadcast(true)
            .map_err(|error| Error::Transport(format!("Failed to set SO_BROADCAST: {}", error)))?;
        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Transport(format!("Failed to set non-blocking: {}", error)))?;

        socket
            .bind(&addr.into())
            .map_err(|error| Error::bind(addr, error))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    pub async fn run(&self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready ({:?} dispatch)", self.dispatch);

        loop {
            match self.handler.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    match self.dispatch {
                        Dispatch::Spawn => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move { handler.handle_bounded(&data, source).await });
                        }
                        Dispatch::Inline => self.handler.handle_bounded(&data, source).await,
                    }
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.handler.server_ip
    }

    pub fn store(&self) -> &Store {
        &self.handler.store
    }
}

#[derive(Clone)]
struct PacketHandler {
    store: Arc<Store>,
    socket: Arc<UdpSocket>,
    server_ip: Ipv4Addr,
    timeout: Duration,
}

impl PacketHandler {
    async fn handle_bounded(&self, data: &[u8], source: SocketAddr) {
        match tokio::time::timeout(self.timeout, self.handle_packet(data, source)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("Error handling packet from {}: {}", source, error),
            Err(_) => warn!("Packet from {} abandoned after {:?}", source, self.timeout),
        }
    }

    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let packet = DhcpPacket::parse(data)?;
        if let Some(reply) = self.process(&packet, source).await? {
            let destination = reply_destination(&packet, &reply);
            let bytes = reply.encode();
            self.socket.send_to(&bytes, destination).await?;
            debug!("Sent {} bytes to {}", bytes.len(), destination);
        }
        Ok(())
    }

    async fn process(&self, packet: &DhcpPacket, source: SocketAddr) -> Result<Option<DhcpPacket>> {
        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("Expected BOOTREQUEST".to_string()));
        }

        let mac = packet.mac()?;
        match packet.message_type() {
            Some(MessageType::Discover) => {
                info!("DISCOVER from {} ({})", mac, source);
                self.handle_discover(packet, &mac).await
            }
            Some(MessageType::Request) => {
                info!("REQUEST from {} ({})", mac, source);
                self.handle_request(packet, &mac).await
            }
            Some(other) => {
                debug!("Ignoring {} from {}", other, mac);
                Ok(None)
            }
            None => {
                debug!("Ignoring BOOTP packet from {}", mac);
                Ok(None)
            }
        }
    }

    async fn assign(&self, mac: &MacAddress) -> Result<Option<AddressId>> {
        match ensure_address(&self.store, mac).await {
            Ok(address) => Ok(Some(address)),
            Err(Error::NoAddressAvailable(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket, mac: &MacAddress) -> Result<Option<DhcpPacket>> {
        let Some(address) = self.assign(mac).await? else {
            warn!("No address left to offer {}", mac);
            return Ok(None);
        };

        let config = self.store.config();
        let server_ip = self.server_ip;
        let offer = self
            .store
            .read(|records| -> Result<DhcpPacket> {
                let client = records
                    .client(mac)
                    .ok_or_else(|| Error::NotFound(format!("client {}", mac)))?;
                let ip = records
                    .address(address)
                    .map(|address| address.ip)
                    .ok_or_else(|| Error::NotFound(format!("address {}", address.0)))?;
                let options = OptionResolver::new(records, &config.dhcp)
                    .with_discovered(Some(server_ip))
                    .build(client, MessageType::Offer, Some(server_ip))?;
                info!("OFFER {} to {}", ip, mac);
                Ok(DhcpPacket::reply(packet, ip, server_ip, &options))
            })
            .await?;

        Ok(Some(offer))
    }

    async fn handle_request(&self, packet: &DhcpPacket, mac: &MacAddress) -> Result<Option<DhcpPacket>> {
        let requested = packet
            .requested_address()
            .or((packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr));
        let Some(requested) = requested else {
            warn!("REQUEST from {} names no address", mac);
            return Ok(None);
        };

        let address = self.assign(mac).await?;

        let config = self.store.config();
        let server_ip = self.server_ip;
        let reply = self
            .store
            .read(|records| -> Result<DhcpPacket> {
                let client = records
                    .client(mac)
                    .ok_or_else(|| Error::NotFound(format!("client {}", mac)))?;
                let resolver =
                    OptionResolver::new(records, &config.dhcp).with_discovered(Some(server_ip));
                let assigned = address.and_then(|id| records.address(id)).map(|a| a.ip);

                match assigned {
                    Some(ip) if ip == requested => {
                        let options = resolver.build(client, MessageType::Ack, Some(server_ip))?;
                        info!("ACK {} to {}", ip, mac);
                        Ok(DhcpPacket::reply(packet, ip, server_ip, &options))
                    }
                    _ => {
                        let mismatch = Error::RequestedAddressMismatch {
                            requested,
                            assigned: assigned.unwrap_or(Ipv4Addr::UNSPECIFIED),
                        };
                        warn!("NAK to {}: {}", mac, mismatch);
                        let options = resolver.nak(client, Some(server_ip))?;
                        Ok(DhcpPacket::reply(packet, Ipv4Addr::UNSPECIFIED, server_ip, &options))
                    }
                }
            })
            .await?;

        Ok(Some(reply))
    }
}

/// The relay agent when one forwarded the request. Otherwise a broadcast,
/// unless a configured client asked for unicast and is not being refused.
fn reply_destination(request: &DhcpPacket, reply: &DhcpPacket) -> SocketAddr {
    let is_nak = reply.message_type() == Some(MessageType::Nak);

    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if is_nak || request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}
