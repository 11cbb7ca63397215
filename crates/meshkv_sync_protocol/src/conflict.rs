//! Single-version conflict resolution.
//!
//! Conflicts resolve last-writer-wins by timestamp. Ties keep the stored
//! row, except that an incoming `MISS_QUERY` item always loses: it means
//! "this row no longer matches the peer's query", not fresh data.

use crate::item::DataItem;

/// Outcome of resolving one incoming item against the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The stored row is newer or equal; drop the incoming item.
    KeepLocal,
    /// The incoming item wins; apply it.
    ApplyIncoming,
}

/// Resolves an incoming item against the currently stored row, if any.
pub fn resolve(existing: Option<&DataItem>, incoming: &DataItem) -> ConflictOutcome {
    let Some(existing) = existing else {
        if incoming.is_miss_query() {
            // Nothing stored to un-match; there is nothing to apply either.
            return ConflictOutcome::KeepLocal;
        }
        return ConflictOutcome::ApplyIncoming;
    };

    if incoming.timestamp > existing.timestamp {
        ConflictOutcome::ApplyIncoming
    } else if incoming.timestamp < existing.timestamp {
        ConflictOutcome::KeepLocal
    } else if incoming.is_miss_query() && !existing.is_miss_query() {
        ConflictOutcome::KeepLocal
    } else if existing.is_miss_query() && !incoming.is_miss_query() {
        ConflictOutcome::ApplyIncoming
    } else {
        // Identical timestamps with identical standing: re-applying a
        // retransmitted batch must be a no-op.
        ConflictOutcome::KeepLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::flags;
    use proptest::prelude::*;

    fn item(ts: u64) -> DataItem {
        DataItem::put(b"k".to_vec(), vec![ts as u8], ts)
    }

    #[test]
    fn newer_incoming_wins() {
        let local = item(5);
        let incoming = item(9);
        assert_eq!(
            resolve(Some(&local), &incoming),
            ConflictOutcome::ApplyIncoming
        );
    }

    #[test]
    fn older_incoming_loses() {
        let local = item(9);
        let incoming = item(5);
        assert_eq!(resolve(Some(&local), &incoming), ConflictOutcome::KeepLocal);
    }

    #[test]
    fn equal_timestamp_is_noop() {
        let local = item(7);
        let incoming = item(7);
        assert_eq!(resolve(Some(&local), &incoming), ConflictOutcome::KeepLocal);
    }

    #[test]
    fn miss_query_loses_tie() {
        let local = item(7);
        let incoming = item(7).with_flags(flags::MISS_QUERY);
        assert_eq!(resolve(Some(&local), &incoming), ConflictOutcome::KeepLocal);

        let local = item(7).with_flags(flags::MISS_QUERY);
        let incoming = item(7);
        assert_eq!(
            resolve(Some(&local), &incoming),
            ConflictOutcome::ApplyIncoming
        );
    }

    #[test]
    fn miss_query_still_wins_when_newer() {
        let local = item(5);
        let incoming = item(9).with_flags(flags::MISS_QUERY);
        assert_eq!(
            resolve(Some(&local), &incoming),
            ConflictOutcome::ApplyIncoming
        );
    }

    #[test]
    fn fresh_row_applies() {
        let incoming = item(3);
        assert_eq!(resolve(None, &incoming), ConflictOutcome::ApplyIncoming);
    }

    #[test]
    fn miss_query_without_local_row_is_noop() {
        let incoming = item(3).with_flags(flags::MISS_QUERY);
        assert_eq!(resolve(None, &incoming), ConflictOutcome::KeepLocal);
    }

    fn tagged(ts: u64, miss: bool) -> DataItem {
        if miss {
            item(ts).with_flags(flags::MISS_QUERY)
        } else {
            item(ts)
        }
    }

    fn survivor<'a>(stored: &'a DataItem, incoming: &'a DataItem) -> &'a DataItem {
        match resolve(Some(stored), incoming) {
            ConflictOutcome::ApplyIncoming => incoming,
            ConflictOutcome::KeepLocal => stored,
        }
    }

    proptest! {
        // Two replicas applying each other's row must agree on the winner
        // no matter which side stored its copy first.
        #[test]
        fn resolution_is_order_independent(
            ts_a in 0u64..16,
            ts_b in 0u64..16,
            miss_a: bool,
            miss_b: bool,
        ) {
            let a = tagged(ts_a, miss_a);
            let b = tagged(ts_b, miss_b);
            let ab = survivor(&a, &b);
            let ba = survivor(&b, &a);
            prop_assert_eq!(ab.timestamp, ba.timestamp);
            prop_assert_eq!(ab.is_miss_query(), ba.is_miss_query());
        }

        // Retransmitted batches re-offer rows the store already holds.
        #[test]
        fn redelivered_row_never_reapplies(ts in 0u64..1000, miss: bool) {
            let row = tagged(ts, miss);
            prop_assert_eq!(resolve(Some(&row), &row), ConflictOutcome::KeepLocal);
        }
    }
}
