use chrono::Utc;
use proptest::prelude::*;

use casanet::filter::suffixes;
use casanet::{DnsKey, DnsRecord, FilterHierarchy, RootFilter};

fn query_name() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 1..6).prop_map(|labels| labels.join("."))
}

/// Filters keyed by suffixes of `name`, plus one that never matches.
fn filters_for(name: &str, picks: &[(usize, bool, bool)]) -> Vec<RootFilter> {
    let candidates = suffixes(name);
    let mut filters: Vec<RootFilter> = picks
        .iter()
        .map(|(index, relay, lock)| {
            RootFilter::new(&candidates[index % candidates.len()], *relay, *lock)
        })
        .collect();
    filters.push(RootFilter::new(&format!("x{}", name), false, true));
    filters
}

fn record(name: &str, relay: bool, lock: bool) -> DnsRecord {
    let mut record = DnsRecord::new(DnsKey::new(name, 1, 1), Utc::now());
    record.always_reply = relay;
    record.lock = lock;
    record
}

fn labels(pattern: &str) -> usize {
    pattern.split('.').count()
}

proptest! {
    #[test]
    fn only_suffixes_become_parents(
        name in query_name(),
        picks in prop::collection::vec((0usize..8, any::<bool>(), any::<bool>()), 0..8),
    ) {
        let filters = filters_for(&name, &picks);
        let hierarchy = FilterHierarchy::from_filters(&filters, &name);

        prop_assert_eq!(hierarchy.parents().len(), picks.len());
        for parent in hierarchy.parents() {
            let dotted_suffix = format!(".{}", parent.pattern);
            prop_assert!(name == parent.pattern || name.ends_with(&dotted_suffix));
        }
    }

    #[test]
    fn any_lock_silences(
        name in query_name(),
        picks in prop::collection::vec((0usize..8, any::<bool>(), any::<bool>()), 0..8),
        own_relay in any::<bool>(),
        own_lock in any::<bool>(),
    ) {
        let filters = filters_for(&name, &picks);
        let hierarchy = FilterHierarchy::from_filters(&filters, &name);
        let record = record(&name, own_relay, own_lock);

        let locked = own_lock || picks.iter().any(|(_, _, lock)| *lock);
        prop_assert_eq!(hierarchy.is_locked(&record), locked);
        if locked {
            prop_assert!(!hierarchy.is_relay(&record));
        }
    }

    #[test]
    fn relay_follows_most_specific_vote(
        name in query_name(),
        picks in prop::collection::vec((0usize..8, any::<bool>()), 0..8),
    ) {
        let lock_free: Vec<(usize, bool, bool)> =
            picks.iter().map(|(index, relay)| (*index, *relay, false)).collect();
        let filters = filters_for(&name, &lock_free);
        let hierarchy = FilterHierarchy::from_filters(&filters, &name);

        let deepest = |relay: bool| {
            hierarchy
                .parents()
                .iter()
                .filter(|filter| filter.always_reply == relay)
                .map(|filter| labels(&filter.pattern))
                .max()
        };
        let expected = match (deepest(true), deepest(false)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(yes), Some(no)) => yes > no,
        };

        prop_assert_eq!(hierarchy.is_relay(&record(&name, true, false)), expected);
        prop_assert!(!hierarchy.is_relay(&record(&name, false, false)));
    }

    #[test]
    fn exact_name_no_vote_always_wins(
        name in query_name(),
        picks in prop::collection::vec((0usize..8, any::<bool>()), 0..8),
    ) {
        let lock_free: Vec<(usize, bool, bool)> =
            picks.iter().map(|(index, relay)| (*index, *relay, false)).collect();
        let mut filters = filters_for(&name, &lock_free);
        filters.push(RootFilter::new(&name, false, false));

        let hierarchy = FilterHierarchy::from_filters(&filters, &name);
        prop_assert!(!hierarchy.is_relay(&record(&name, true, false)));
    }
}
