use crate::types::TxidSnapshot;

/// Number of consecutive batches without overlap after which the snapshot is dropped.
pub const CLEAN_BATCHES_BEFORE_DROP: u32 = 3;

/// Skips events already contained in a table's bulk copy.
///
/// An event is skipped iff its transaction is visible to the snapshot the copy was read in.
/// Once more than [`CLEAN_BATCHES_BEFORE_DROP`] batches in a row carried events for the table
/// and none of them was skipped, the snapshot can no longer match anything and is dropped.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    snapshot: Option<TxidSnapshot>,
    clean_batches: u32,
    seen: bool,
    skipped: bool,
}

impl SnapshotFilter {
    pub fn new(snapshot: Option<TxidSnapshot>) -> Self {
        SnapshotFilter {
            snapshot,
            ..SnapshotFilter::default()
        }
    }

    pub fn snapshot(&self) -> Option<&TxidSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn begin_batch(&mut self) {
        self.seen = false;
        self.skipped = false;
    }

    /// Returns `true` when the event of transaction `txid` must be applied.
    pub fn accept(&mut self, txid: i64) -> bool {
        let Some(snapshot) = &self.snapshot else {
            return true;
        };

        self.seen = true;
        if snapshot.contains(txid) {
            self.skipped = true;
            return false;
        }

        true
    }

    /// Closes the batch. Returns `true` when the snapshot was dropped by this call.
    pub fn finish_batch(&mut self) -> bool {
        if self.snapshot.is_none() {
            return false;
        }

        if self.skipped {
            self.clean_batches = 0;
        } else if self.seen {
            self.clean_batches += 1;
        }

        if self.clean_batches > CLEAN_BATCHES_BEFORE_DROP {
            self.snapshot = None;
            self.clean_batches = 0;
            return true;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> SnapshotFilter {
        SnapshotFilter::new(Some("100:110:105".parse().unwrap()))
    }

    #[test]
    fn test_events_visible_to_snapshot_are_skipped() {
        let mut filter = filter();
        filter.begin_batch();
        assert!(!filter.accept(99));
        assert!(!filter.accept(104));
        assert!(filter.accept(105));
        assert!(filter.accept(110));
    }

    #[test]
    fn test_snapshot_is_dropped_after_clean_batches() {
        let mut filter = filter();

        for _ in 0..CLEAN_BATCHES_BEFORE_DROP {
            filter.begin_batch();
            assert!(filter.accept(200));
            assert!(!filter.finish_batch());
        }

        filter.begin_batch();
        assert!(filter.accept(201));
        assert!(filter.finish_batch());
        assert!(filter.snapshot().is_none());
        assert!(filter.accept(50));
    }

    #[test]
    fn test_skip_resets_counter_and_empty_batches_do_not_count() {
        let mut filter = filter();

        for _ in 0..CLEAN_BATCHES_BEFORE_DROP {
            filter.begin_batch();
            filter.accept(200);
            filter.finish_batch();
        }

        filter.begin_batch();
        assert!(!filter.accept(101));
        assert!(!filter.finish_batch());

        for _ in 0..10 {
            filter.begin_batch();
            assert!(!filter.finish_batch());
        }
        assert!(filter.snapshot().is_some());
    }

    #[test]
    fn test_without_snapshot_everything_passes() {
        let mut filter = SnapshotFilter::new(None);
        filter.begin_batch();
        assert!(filter.accept(1));
        assert!(!filter.finish_batch());
    }
}
