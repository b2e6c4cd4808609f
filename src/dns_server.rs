//! DNS daemon: UDP datagrams or TCP connections handed to the resolver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::config::{Dispatch, Transport};
use crate::dns::DnsResolver;
use crate::error::{Error, Result};

/// Largest message a 2-byte TCP length prefix can frame.
const TCP_MESSAGE_LIMIT: usize = u16::MAX as usize;

enum Listener {
    Udp(Arc<UdpSocket>),
    Tcp(TcpListener),
}

struct QueryHandler {
    resolver: Arc<DnsResolver>,
    timeout: Duration,
    packet_size: usize,
}

impl QueryHandler {
    /// Wire bytes of the reply, or `None` when the query is dropped.
    async fn handle(&self, data: &[u8], limit: usize) -> Result<Option<Vec<u8>>> {
        let request = Message::from_vec(data)?;
        let reply = match self.resolver.resolve(&request).await {
            Err(error @ (Error::UpstreamTimeout(_) | Error::Transport(_))) => {
                debug!("Retrying query {} after: {}", request.id(), error);
                self.resolver.resolve(&request).await?
            }
            other => other?,
        };

        reply
            .map(|reply| encode_reply(reply, limit))
            .transpose()
    }

    async fn handle_bounded(&self, data: &[u8], source: SocketAddr, limit: usize) -> Option<Vec<u8>> {
        match tokio::time::timeout(self.timeout, self.handle(data, limit)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                warn!("Dropping query from {}: {}", source, error);
                None
            }
            Err(_) => {
                warn!("Query from {} abandoned after {:?}", source, self.timeout);
                None
            }
        }
    }

    async fn serve_udp(&self, socket: &UdpSocket, data: &[u8], source: SocketAddr) {
        if let Some(bytes) = self.handle_bounded(data, source, self.packet_size).await
            && let Err(error) = socket.send_to(&bytes, source).await
        {
            error!("Error sending reply to {}: {}", source, error);
        }
    }

    /// Serves length-prefixed messages until the peer closes the stream or
    /// stays silent for longer than the request timeout.
    async fn serve_tcp(&self, mut stream: TcpStream, source: SocketAddr) -> Result<()> {
        loop {
            let data = match tokio::time::timeout(self.timeout, read_frame(&mut stream)).await {
                Ok(Ok(Some(data))) => data,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    debug!("Closing idle connection from {} after {:?}", source, self.timeout);
                    return Ok(());
                }
            };

            if let Some(bytes) = self.handle_bounded(&data, source, TCP_MESSAGE_LIMIT).await {
                tokio::time::timeout(self.timeout, write_frame(&mut stream, &bytes))
                    .await
                    .map_err(|_| Error::Transport(format!("Writing reply to {} timed out", source)))??;
            }
        }
    }
}

/// One length-prefixed message, or `None` once the peer has closed.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let length = match stream.read_u16().await {
        Ok(length) => length as usize,
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let mut data = vec![0u8; length];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    stream.write_u16(bytes.len() as u16).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Answers that do not fit are dropped and the reply marked truncated.
fn encode_reply(mut reply: Message, limit: usize) -> Result<Vec<u8>> {
    let bytes = reply.to_vec()?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }
    debug!("Reply of {} bytes exceeds {}, truncating", bytes.len(), limit);
    reply.take_answers();
    reply.set_truncated(true);
    Ok(reply.to_vec()?)
}

pub struct DnsServer {
    handler: Arc<QueryHandler>,
    listener: Listener,
    dispatch: Dispatch,
}

impl DnsServer {
    /// Binds the configured listen address with the configured transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] when the address cannot be bound.
    pub async fn bind(resolver: Arc<DnsResolver>) -> Result<Self> {
        let config = Arc::clone(resolver.store().config());
        let listen = config.dns.listen;

        let listener = match config.dns.transport {
            Transport::Udp => Listener::Udp(Arc::new(
                UdpSocket::bind(listen)
                    .await
                    .map_err(|error| Error::bind(listen, error))?,
            )),
            Transport::Tcp => Listener::Tcp(
                TcpListener::bind(listen)
                    .await
                    .map_err(|error| Error::bind(listen, error))?,
            ),
        };

        info!(
            "DNS server listening on {} ({:?}), upstream {}",
            listen, config.dns.transport, config.dns.upstream
        );

        Ok(Self {
            handler: Arc::new(QueryHandler {
                resolver,
                timeout: config.dns.request_timeout(),
                packet_size: config.dns.packet_size.bytes(),
            }),
            listener,
            dispatch: config.dns.dispatch,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.listener {
            Listener::Udp(socket) => socket.local_addr()?,
            Listener::Tcp(listener) => listener.local_addr()?,
        };
        Ok(addr)
    }

    pub async fn run(&self) -> Result<()> {
        match &self.listener {
            Listener::Udp(socket) => self.run_udp(socket).await,
            Listener::Tcp(listener) => self.run_tcp(listener).await,
        }
    }

    async fn run_udp(&self, socket: &Arc<UdpSocket>) -> Result<()> {
        let mut buffer = vec![0u8; self.handler.packet_size.max(512)];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    match self.dispatch {
                        Dispatch::Spawn => {
                            let handler = Arc::clone(&self.handler);
                            let socket = Arc::clone(socket);
                            tokio::spawn(async move {
                                handler.serve_udp(&socket, &data, source).await;
                            });
                        }
                        Dispatch::Inline => self.handler.serve_udp(socket, &data, source).await,
                    }
                }
                Err(error) => {
                    error!("Error receiving query: {}", error);
                }
            }
        }
    }

    async fn run_tcp(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    debug!("Connection from {}", source);
                    match self.dispatch {
                        Dispatch::Spawn => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(error) = handler.serve_tcp(stream, source).await {
                                    warn!("Connection from {} failed: {}", source, error);
                                }
                            });
                        }
                        Dispatch::Inline => {
                            if let Err(error) = self.handler.serve_tcp(stream, source).await {
                                warn!("Connection from {} failed: {}", source, error);
                            }
                        }
                    }
                }
                Err(error) => {
                    error!("Error accepting connection: {}", error);
                }
            }
        }
    }
}
