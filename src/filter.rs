//! Suffix-keyed DNS policy.
//!
//! A [`RootFilter`] applies to its own name and to every name below it. For a
//! query name `a.b.c` the candidate filters are those keyed `a.b.c`, `b.c` and
//! `c`. Locks are inherited unconditionally. Relay decisions are settled by
//! the most specific filter, where specificity is the label count of the
//! filter's pattern and ties go to "do not relay".
//!
//! The `always_reply` flag is named from the operator's point of view
//! ("always ask upstream"): `true` means relay, `false` means serve from the
//! local cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Records;

/// Lowercases a query name and strips the root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

/// `name` followed by each of its dot-delimited parent suffixes.
pub fn suffixes(name: &str) -> Vec<String> {
    let labels: Vec<&str> = name.split('.').filter(|label| !label.is_empty()).collect();
    (0..labels.len()).map(|start| labels[start..].join(".")).collect()
}

fn specificity(pattern: &str) -> usize {
    pattern.split('.').filter(|label| !label.is_empty()).count()
}

/// Repository key of a cached DNS answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DnsKey {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsKey {
    pub fn new(qname: &str, qtype: u16, qclass: u16) -> Self {
        Self {
            qname: normalize_name(qname),
            qtype,
            qclass,
        }
    }
}

/// Per-question cache entry and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub key: DnsKey,
    /// Presentation-format data of the last upstream answer.
    pub rdata: Option<String>,
    /// Relay this question upstream instead of answering from cache.
    pub always_reply: bool,
    /// Never answer this question.
    pub lock: bool,
    pub last_query: DateTime<Utc>,
}

impl DnsRecord {
    pub fn new(key: DnsKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            rdata: None,
            always_reply: false,
            lock: false,
            last_query: now,
        }
    }
}

/// A standalone policy overlay matched by suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFilter {
    pub pattern: String,
    pub always_reply: bool,
    pub lock: bool,
}

impl RootFilter {
    pub fn new(pattern: &str, always_reply: bool, lock: bool) -> Self {
        Self {
            pattern: normalize_name(pattern),
            always_reply,
            lock,
        }
    }
}

/// The filters that govern one query name.
#[derive(Debug)]
pub struct FilterHierarchy<'a> {
    parents: Vec<&'a RootFilter>,
}

impl<'a> FilterHierarchy<'a> {
    /// Collects the stored filters keyed by `qname` or any of its suffixes.
    pub fn for_name(records: &'a Records, qname: &str) -> Self {
        let parents = suffixes(&normalize_name(qname))
            .iter()
            .filter_map(|suffix| records.filter(suffix))
            .collect();
        Self { parents }
    }

    /// Selects, from an arbitrary set, the filters that govern `qname`.
    pub fn from_filters<I>(filters: I, qname: &str) -> Self
    where
        I: IntoIterator<Item = &'a RootFilter>,
    {
        let candidates = suffixes(&normalize_name(qname));
        let parents = filters
            .into_iter()
            .filter(|filter| candidates.contains(&filter.pattern))
            .collect();
        Self { parents }
    }

    pub fn parents(&self) -> &[&'a RootFilter] {
        &self.parents
    }

    pub fn is_locked(&self, record: &DnsRecord) -> bool {
        record.lock || self.parents.iter().any(|filter| filter.lock)
    }

    pub fn is_relay(&self, record: &DnsRecord) -> bool {
        if self.is_locked(record) || !record.always_reply {
            return false;
        }

        let most_specific = |relay: bool| {
            self.parents
                .iter()
                .filter(|filter| filter.always_reply == relay)
                .map(|filter| specificity(&filter.pattern))
                .max()
        };

        match (most_specific(true), most_specific(false)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(yes), Some(no)) => yes > no,
        }
    }
}
