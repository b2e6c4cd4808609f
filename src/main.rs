use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use hickory_proto::rr::{DNSClass, RecordType};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use casanet::config::{Dispatch, Transport, parse_listen};
use casanet::{
    Config, DhcpServer, DnsKey, DnsResolver, DnsServer, Error, Ledger, Network, Result,
    RootFilter, Store, UdpUpstream,
};

#[derive(Parser)]
#[command(name = "casanet")]
#[command(author, version, about = "Home-network DHCP allocator and caching DNS relay", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "casanet-config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DHCP server on port 67
    Dhcp {
        /// Address announced as server id (skips outbound discovery)
        #[arg(long)]
        ip: Option<Ipv4Addr>,

        /// Host used to discover the outbound address
        #[arg(long)]
        remote: Option<String>,

        /// Handle requests one at a time
        #[arg(long)]
        nothreading: bool,
    },
    /// Run the DNS server
    Dns {
        /// Port number, or ipaddr:port
        addrport: Option<String>,

        /// Listen on IPv6 loopback
        #[arg(short = '6', long)]
        ipv6: bool,

        /// Use TCP connections
        #[arg(long)]
        tcp: bool,

        /// Handle queries one at a time
        #[arg(long)]
        nothreading: bool,

        /// Upstream resolver, ipaddr or ipaddr:port
        #[arg(long)]
        dns: Option<String>,
    },
    ShowConfig,
    /// Print the lease history
    Leases,
    AddNetwork {
        /// Router list, e.g. "10.0.0.1,10.0.1.1"
        #[arg(long)]
        routers: String,

        /// Prefix length or dotted mask, e.g. "/24" or "255.255.255.0"
        #[arg(long)]
        mask: String,

        /// Name server list; defaults to the routers
        #[arg(long)]
        name_servers: Option<String>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        domain: Option<String>,
    },
    AddFilter {
        /// Domain suffix, e.g. "ads.example.com"
        pattern: String,

        /// Relay matching queries upstream instead of answering from cache
        #[arg(long)]
        relay: bool,

        /// Never answer matching queries
        #[arg(long)]
        lock: bool,
    },
    /// Change the policy of one cached DNS question
    SetRecord {
        qname: String,

        #[arg(long, default_value = "A")]
        qtype: String,

        #[arg(long, default_value = "IN")]
        qclass: String,

        #[arg(long)]
        relay: Option<bool>,

        #[arg(long)]
        lock: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Bind { reason, .. }) => {
            eprintln!("Error: {}", reason);
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("Error: {}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_create(&cli.config)?;

    match cli.command {
        Commands::Dhcp {
            ip,
            remote,
            nothreading,
        } => {
            if ip.is_some() {
                config.dhcp.server_ip = ip;
            }
            if let Some(remote) = remote {
                config.dhcp.discovery_host = remote;
            }
            if nothreading {
                config.dhcp.dispatch = Dispatch::Inline;
            }

            info!("Starting DHCP server with config: {:?}", cli.config);
            let store = Arc::new(Store::new(Arc::new(config)).await?);
            let server = DhcpServer::new(Arc::clone(&store)).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => shutdown(&store).await,
            }
        }
        Commands::Dns {
            addrport,
            ipv6,
            tcp,
            nothreading,
            dns,
        } => {
            match addrport {
                Some(addrport) => config.dns.listen = parse_listen(&addrport, ipv6)?,
                None if ipv6 => {
                    config.dns.listen =
                        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), config.dns.listen.port())
                }
                None => {}
            }
            if tcp {
                config.dns.transport = Transport::Tcp;
            }
            if nothreading {
                config.dns.dispatch = Dispatch::Inline;
            }
            if let Some(dns) = dns {
                config.dns.upstream = parse_upstream(&dns)?;
            }

            info!("Starting DNS server with config: {:?}", cli.config);
            let upstream = Arc::new(UdpUpstream::from_config(&config.dns));
            let store = Arc::new(Store::new(Arc::new(config)).await?);
            let resolver = Arc::new(DnsResolver::new(Arc::clone(&store), upstream));
            let server = DnsServer::bind(resolver).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => shutdown(&store).await,
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Leases => {
            let store = Store::new(Arc::new(config)).await?;
            let records = store.snapshot().await;
            let ledger = Ledger::new(&records, &store.config().dhcp);

            if records.leases().is_empty() {
                println!("No leases recorded.");
                return Ok(());
            }

            println!(
                "{:<16} {:<18} {:<24} {:<10}",
                "IP Address", "Client", "Granted At", "Remaining"
            );
            println!("{}", "-".repeat(70));

            let now = Utc::now();
            for lease in records.leases().iter().rev() {
                let ip = records
                    .address(lease.address)
                    .map(|address| address.ip.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let remaining = match records.client(&lease.client) {
                    Some(client) if client.is_static => "static".to_string(),
                    Some(client) => {
                        let lease_time = ledger.lease_time(client, lease.address);
                        let expires = lease.timestamp + TimeDelta::seconds(i64::from(lease_time));
                        let left = (expires - now).num_seconds();
                        if left > 0 {
                            format!("{}s", left)
                        } else {
                            "expired".to_string()
                        }
                    }
                    None => "expired".to_string(),
                };

                println!(
                    "{:<16} {:<18} {:<24} {:<10}",
                    ip,
                    lease.client.as_str(),
                    lease.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                    remaining
                );
            }
            Ok(())
        }
        Commands::AddNetwork {
            routers,
            mask,
            name_servers,
            name,
            domain,
        } => {
            let separator = config.dhcp.list_separator.clone();
            let mut network = Network::parse(
                &routers,
                &mask,
                name_servers.as_deref().unwrap_or(&routers),
                &separator,
            )?;
            if let Some(name) = name {
                network = network.with_name(name);
            }
            if let Some(domain) = domain {
                network = network.with_domain(domain);
            }

            let store = Store::new(Arc::new(config)).await?;
            let id = store.write(|records| records.create_network(network)).await?;
            store.save().await?;
            println!("Created network {}", id.0);
            Ok(())
        }
        Commands::AddFilter {
            pattern,
            relay,
            lock,
        } => {
            let store = Store::new(Arc::new(config)).await?;
            let filter = RootFilter::new(&pattern, relay, lock);
            let pattern = filter.pattern.clone();
            store.write(|records| records.save_filter(filter)).await?;
            store.save().await?;
            println!("Saved filter {} (relay: {}, lock: {})", pattern, relay, lock);
            Ok(())
        }
        Commands::SetRecord {
            qname,
            qtype,
            qclass,
            relay,
            lock,
        } => {
            let qtype = RecordType::from_str(&qtype.to_uppercase())?;
            let qclass = DNSClass::from_str(&qclass.to_uppercase())?;
            let key = DnsKey::new(&qname, u16::from(qtype), u16::from(qclass));

            let store = Store::new(Arc::new(config)).await?;
            let record = store
                .write(|records| {
                    let (mut record, _) = records.lookup_or_create_dns(&key, Utc::now())?;
                    if let Some(relay) = relay {
                        record.always_reply = relay;
                    }
                    if let Some(lock) = lock {
                        record.lock = lock;
                    }
                    records.save_dns_record(record.clone())?;
                    Ok(record)
                })
                .await?;
            store.save().await?;
            println!(
                "{} {} {}: relay {}, lock {}",
                record.key.qname, qtype, qclass, record.always_reply, record.lock
            );
            Ok(())
        }
    }
}

async fn shutdown(store: &Store) -> Result<()> {
    info!("Received shutdown signal, stopping server...");
    if let Err(error) = store.save().await {
        error!("Failed to save records on shutdown: {}", error);
    }
    Ok(())
}

fn parse_upstream(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| Error::InvalidConfig(format!("\"{}\" is not a valid DNS server", value)))
}
