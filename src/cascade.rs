//! Ordered fallthrough lookups.
//!
//! Several client attributes are resolved as "client option, then network
//! setting, then built-in default". Each source is a closure; sources are
//! evaluated lazily in order and the first `Some` wins.

/// Returns the first value produced by `lookups`, trying them in order.
pub fn cascade<T>(lookups: &[&dyn Fn() -> Option<T>]) -> Option<T> {
    lookups.iter().find_map(|lookup| lookup())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_first_match_wins() {
        let value = cascade(&[&|| None, &|| Some(200), &|| Some(43200)]);
        assert_eq!(value, Some(200));
    }

    #[test]
    fn test_stops_at_first_match() {
        let calls = Cell::new(0);
        let counted = || {
            calls.set(calls.get() + 1);
            Some(1)
        };
        let value = cascade(&[&|| Some(0), &counted]);
        assert_eq!(value, Some(0));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_empty_cascade() {
        let value: Option<u32> = cascade(&[&|| None, &|| None]);
        assert!(value.is_none());
    }
}
