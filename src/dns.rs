//! Caching and relaying DNS resolver.
//!
//! Each question is looked up in the repository (created on first sight),
//! then settled by the [`FilterHierarchy`] of its name:
//!
//! - locked: the whole message is dropped without a reply
//! - not relayed: answered from the cached text, or with no records
//! - relayed: asked upstream; matching answers are returned and the first is
//!   cached
//!
//! The repository lock is never held across the upstream exchange.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::Record;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::error::{Error, Result};
use crate::filter::{DnsKey, FilterHierarchy};
use crate::rdata;
use crate::store::Store;

/// Source of authoritative answers for relayed questions.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn query(&self, query: &Query) -> Result<Message>;
}

/// Plain UDP exchange with one upstream resolver.
pub struct UdpUpstream {
    server: SocketAddr,
    timeout: Duration,
    packet_size: usize,
    next_id: AtomicU16,
}

impl UdpUpstream {
    pub fn new(server: SocketAddr, timeout: Duration, packet_size: usize) -> Self {
        Self {
            server,
            timeout,
            packet_size,
            next_id: AtomicU16::new(Utc::now().timestamp_subsec_nanos() as u16),
        }
    }

    pub fn from_config(config: &DnsConfig) -> Self {
        Self::new(
            config.upstream,
            config.upstream_timeout(),
            config.packet_size.bytes(),
        )
    }

    async fn exchange(&self, request: &Message) -> Result<Message> {
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.server).await?;
        socket.send(&request.to_vec()?).await?;

        let mut buffer = vec![0u8; self.packet_size];
        loop {
            let size = socket.recv(&mut buffer).await?;
            match Message::from_vec(&buffer[..size]) {
                Ok(response) if response.id() == request.id() => return Ok(response),
                Ok(response) => debug!(
                    "Discarding upstream reply with id {} (expected {})",
                    response.id(),
                    request.id()
                ),
                Err(error) => debug!("Discarding unparseable upstream reply: {}", error),
            }
        }
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query(&self, query: &Query) -> Result<Message> {
        let mut request = Message::new();
        request
            .set_id(self.next_id.fetch_add(1, Ordering::Relaxed))
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(query.clone());

        tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| Error::UpstreamTimeout(self.server.to_string()))?
    }
}

enum Step {
    Locked,
    Cached(Option<String>),
    Relay,
}

pub struct DnsResolver {
    store: Arc<Store>,
    upstream: Arc<dyn Upstream>,
    cached_ttl: u32,
}

impl DnsResolver {
    pub fn new(store: Arc<Store>, upstream: Arc<dyn Upstream>) -> Self {
        let cached_ttl = store.config().dns.cached_ttl;
        Self {
            store,
            upstream,
            cached_ttl,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Answers every question of `request`.
    ///
    /// Returns `Ok(None)` when any question is locked: locked names get no
    /// reply at all.
    ///
    /// # Errors
    ///
    /// Upstream timeouts and transport failures of relayed questions are
    /// returned to the caller.
    pub async fn resolve(&self, request: &Message) -> Result<Option<Message>> {
        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true);
        reply.add_queries(request.queries().iter().cloned());

        for query in request.queries() {
            match self.answer(query).await? {
                Some(answers) => {
                    reply.add_answers(answers);
                }
                None => return Ok(None),
            }
        }

        Ok(Some(reply))
    }

    async fn answer(&self, query: &Query) -> Result<Option<Vec<Record>>> {
        let key = DnsKey::new(
            &query.name().to_string(),
            u16::from(query.query_type()),
            u16::from(query.query_class()),
        );
        if key.qname.is_empty() {
            debug!("Root {} query answered empty", query.query_type());
            return Ok(Some(Vec::new()));
        }
        let now = Utc::now();

        let step = self
            .store
            .write(|records| {
                let (mut record, created) = records.lookup_or_create_dns(&key, now)?;
                let hierarchy = FilterHierarchy::for_name(records, &key.qname);

                if hierarchy.is_locked(&record) {
                    if created {
                        record.always_reply = hierarchy.is_relay(&record);
                        record.lock = true;
                        records.save_dns_record(record)?;
                    }
                    return Ok(Step::Locked);
                }

                if hierarchy.is_relay(&record) {
                    Ok(Step::Relay)
                } else {
                    Ok(Step::Cached(record.rdata))
                }
            })
            .await?;

        match step {
            Step::Locked => {
                warn!("Dropping locked query {} {}", query.name(), query.query_type());
                Ok(None)
            }
            Step::Cached(text) => {
                info!("{} {} from cache", query.name(), query.query_type());
                Ok(Some(self.cached_answer(query, text.as_deref())))
            }
            Step::Relay => {
                info!("{} {} relayed upstream", query.name(), query.query_type());
                self.relay(query, &key).await.map(Some)
            }
        }
    }

    fn cached_answer(&self, query: &Query, text: Option<&str>) -> Vec<Record> {
        let Some(text) = text else {
            return Vec::new();
        };
        match rdata::decode(query.query_type(), text) {
            Ok(data) => {
                let mut record = Record::from_rdata(query.name().clone(), self.cached_ttl, data);
                record.set_dns_class(query.query_class());
                vec![record]
            }
            Err(error) => {
                warn!("Unusable cache entry for {}: {}", query.name(), error);
                Vec::new()
            }
        }
    }

    async fn relay(&self, query: &Query, key: &DnsKey) -> Result<Vec<Record>> {
        let mut upstream_query = Query::query(query.name().clone(), query.query_type());
        upstream_query.set_query_class(query.query_class());

        let response = self.upstream.query(&upstream_query).await?;
        let matches: Vec<Record> = response
            .answers()
            .iter()
            .filter(|answer| {
                answer.name() == query.name() && answer.record_type() == query.query_type()
            })
            .cloned()
            .collect();

        let first = matches
            .first()
            .and_then(|answer| answer.data())
            .and_then(rdata::encode);
        if let Some(text) = first {
            self.store
                .write(|records| {
                    if let Some(mut record) = records.dns_record(key).cloned() {
                        record.rdata = Some(text);
                        records.save_dns_record(record)?;
                    }
                    Ok(())
                })
                .await?;
        }

        debug!("{} upstream answer(s) for {}", matches.len(), query.name());
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::filter::RootFilter;
    use hickory_proto::rr::rdata::{A, MX};
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    /// Answers every question with the configured records and counts calls.
    struct FixedUpstream {
        answers: Vec<Record>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for FixedUpstream {
        async fn query(&self, query: &Query) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = Message::new();
            response.set_message_type(MessageType::Response);
            response.add_query(query.clone());
            response.add_answers(self.answers.clone());
            Ok(response)
        }
    }

    struct SilentUpstream;

    #[async_trait]
    impl Upstream for SilentUpstream {
        async fn query(&self, _query: &Query) -> Result<Message> {
            Err(Error::UpstreamTimeout("192.0.2.1:53".to_string()))
        }
    }

    fn a_record(name: &str, address: Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_str(name).unwrap(), 300, RData::A(A(address)))
    }

    fn request(name: &str, rtype: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(0x4242)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        message
    }

    async fn create_resolver(
        name: &str,
        answers: Vec<Record>,
    ) -> (DnsResolver, Arc<FixedUpstream>, TestGuard) {
        let path = format!("test_dns_{}.json", name);
        let config = Arc::new(Config {
            data_file: path.clone(),
            ..Config::default()
        });
        let store = Arc::new(Store::new(config).await.unwrap());
        let upstream = Arc::new(FixedUpstream {
            answers,
            calls: AtomicUsize::new(0),
        });
        let resolver = DnsResolver::new(store, upstream.clone());
        (resolver, upstream, TestGuard(path))
    }

    async fn set_record(resolver: &DnsResolver, qname: &str, always_reply: bool, lock: bool) {
        let key = DnsKey::new(qname, u16::from(RecordType::A), 1);
        resolver
            .store
            .write(|records| {
                let (mut record, _) = records.lookup_or_create_dns(&key, Utc::now())?;
                record.always_reply = always_reply;
                record.lock = lock;
                records.save_dns_record(record)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_query_answered_from_empty_cache() {
        let (resolver, upstream, _guard) = create_resolver("empty_cache", vec![]).await;

        let reply = resolver
            .resolve(&request("example.com.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), 0x4242);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.queries().len(), 1);
        assert!(reply.answers().is_empty());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        let key = DnsKey::new("example.com", 1, 1);
        let stored = resolver.store.read(|records| records.dns_record(&key).cloned()).await;
        let stored = stored.unwrap();
        assert!(!stored.always_reply);
        assert!(!stored.lock);
        assert!(stored.rdata.is_none());
    }

    #[tokio::test]
    async fn test_root_query_never_cached() {
        let (resolver, upstream, _guard) = create_resolver("root", vec![]).await;

        let reply = resolver
            .resolve(&request(".", RecordType::NS))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.answers().is_empty());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        let stored = resolver.store.read(|records| records.dns_records().count()).await;
        assert_eq!(stored, 0);

        resolver.store.save().await.unwrap();
        let reopened = Store::new(Arc::clone(resolver.store.config())).await.unwrap();
        assert_eq!(reopened.read(|records| records.dns_records().count()).await, 0);
    }

    #[tokio::test]
    async fn test_relay_caches_first_match() {
        let answers = vec![
            a_record("other.example.", Ipv4Addr::new(10, 0, 0, 9)),
            a_record("relay.example.", Ipv4Addr::new(10, 0, 0, 1)),
            a_record("relay.example.", Ipv4Addr::new(10, 0, 0, 2)),
        ];
        let (resolver, upstream, _guard) = create_resolver("relay", answers).await;
        set_record(&resolver, "relay.example", true, false).await;

        let reply = resolver
            .resolve(&request("relay.example.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.answers().len(), 2);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let key = DnsKey::new("relay.example", 1, 1);
        let cached = resolver
            .store
            .read(|records| records.dns_record(&key).and_then(|record| record.rdata.clone()))
            .await;
        assert_eq!(cached.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_cached_answer_served_without_upstream() {
        let (resolver, upstream, _guard) = create_resolver("cached", vec![]).await;
        let key = DnsKey::new("cached.example", 1, 1);
        resolver
            .store
            .write(|records| {
                let (mut record, _) = records.lookup_or_create_dns(&key, Utc::now())?;
                record.rdata = Some("192.0.2.7".to_string());
                records.save_dns_record(record)
            })
            .await
            .unwrap();

        let reply = resolver
            .resolve(&request("cached.example.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].ttl(), 60);
        assert_eq!(
            reply.answers()[0].data(),
            Some(&RData::A(A(Ipv4Addr::new(192, 0, 2, 7))))
        );
    }

    #[tokio::test]
    async fn test_cached_mx_answer() {
        let (resolver, _upstream, _guard) = create_resolver("cached_mx", vec![]).await;
        let key = DnsKey::new("example.org", u16::from(RecordType::MX), 1);
        resolver
            .store
            .write(|records| {
                let (mut record, _) = records.lookup_or_create_dns(&key, Utc::now())?;
                record.rdata = Some("5 mx.example.org.".to_string());
                records.save_dns_record(record)
            })
            .await
            .unwrap();

        let reply = resolver
            .resolve(&request("example.org.", RecordType::MX))
            .await
            .unwrap()
            .unwrap();
        let expected = MX::new(5, Name::from_str("mx.example.org.").unwrap());
        assert_eq!(reply.answers()[0].data(), Some(&RData::MX(expected)));
    }

    #[tokio::test]
    async fn test_locked_suffix_drops_query() {
        let answers = vec![a_record("tracker.ads.example.", Ipv4Addr::new(10, 0, 0, 1))];
        let (resolver, upstream, _guard) = create_resolver("locked", answers).await;
        resolver
            .store
            .write(|records| records.save_filter(RootFilter::new("ads.example", false, true)))
            .await
            .unwrap();

        let reply = resolver
            .resolve(&request("tracker.ads.example.", RecordType::A))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        let key = DnsKey::new("tracker.ads.example", 1, 1);
        let stored = resolver
            .store
            .read(|records| records.dns_record(&key).cloned())
            .await
            .unwrap();
        assert!(stored.lock);
        assert!(!stored.always_reply);
    }

    #[tokio::test]
    async fn test_locked_record_with_relay_flag_never_relayed() {
        let answers = vec![a_record("blocked.example.", Ipv4Addr::new(10, 0, 0, 1))];
        let (resolver, upstream, _guard) = create_resolver("locked_relay", answers).await;
        set_record(&resolver, "blocked.example", true, true).await;

        let reply = resolver
            .resolve(&request("blocked.example.", RecordType::A))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_more_specific_filter_keeps_cache() {
        let answers = vec![a_record("www.example.com.", Ipv4Addr::new(10, 0, 0, 1))];
        let (resolver, upstream, _guard) = create_resolver("specific", answers).await;
        resolver
            .store
            .write(|records| {
                records.save_filter(RootFilter::new("com", true, false))?;
                records.save_filter(RootFilter::new("example.com", false, false))
            })
            .await
            .unwrap();
        set_record(&resolver, "www.example.com", true, false).await;

        resolver
            .resolve(&request("www.example.com.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        resolver
            .store
            .write(|records| {
                records.delete_filter("example.com");
                Ok(())
            })
            .await
            .unwrap();
        resolver
            .resolve(&request("www.example.com.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_upstream_leaves_cache() {
        let answers = vec![a_record("elsewhere.example.", Ipv4Addr::new(10, 0, 0, 1))];
        let (resolver, _upstream, _guard) = create_resolver("unmatched", answers).await;
        set_record(&resolver, "wanted.example", true, false).await;

        let reply = resolver
            .resolve(&request("wanted.example.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.answers().is_empty());

        let key = DnsKey::new("wanted.example", 1, 1);
        let cached = resolver
            .store
            .read(|records| records.dns_record(&key).and_then(|record| record.rdata.clone()))
            .await;
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_upstream_timeout_surfaces() {
        let path = "test_dns_timeout.json".to_string();
        let _guard = TestGuard(path.clone());
        let config = Arc::new(Config {
            data_file: path,
            ..Config::default()
        });
        let store = Arc::new(Store::new(config).await.unwrap());
        let resolver = DnsResolver::new(store, Arc::new(SilentUpstream));
        set_record(&resolver, "slow.example", true, false).await;

        let result = resolver
            .resolve(&request("slow.example.", RecordType::A))
            .await;
        assert!(matches!(result, Err(Error::UpstreamTimeout(_))));
    }

    #[tokio::test]
    async fn test_udp_upstream_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = UdpUpstream::new(
            silent.local_addr().unwrap(),
            Duration::from_millis(50),
            512,
        );
        let query = Query::query(Name::from_str("example.com.").unwrap(), RecordType::A);
        assert!(matches!(
            upstream.query(&query).await,
            Err(Error::UpstreamTimeout(_))
        ));
    }
}
