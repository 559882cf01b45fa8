//! Reader tracking and deferred block frees.
//!
//! Copy-on-write leaves the blocks a commit replaced in place for readers
//! still pinned to older generations. Those blocks are recorded here and
//! handed back to their allocators once the oldest live reader has moved past
//! the last generation that could reach them.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::Generation;
use crate::error::{BlockId, FileId};

/// Reference counts of live transactions per pinned generation.
///
/// ```text
/// Time    Action                          live
/// ----    ------                          ----
/// T1      Commit generation 1             {}
/// T2      Read begins (generation 1)      {1: 1}
/// T3      Commit generation 2             {1: 1}   blocks replaced by 2 wait
/// T4      Read begins (generation 2)      {1: 1, 2: 1}
/// T5      First read ends                 {2: 1}   blocks replaced by 2 freed
/// ```
#[derive(Default)]
pub struct TransactionTracker {
    live: Mutex<BTreeMap<Generation, u64>>,
}

impl TransactionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction pinned to `generation`.
    pub fn register(&self, generation: Generation) {
        *self.live.lock().entry(generation).or_insert(0) += 1;
    }

    /// Unregisters a transaction pinned to `generation`.
    pub fn unregister(&self, generation: Generation) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                live.remove(&generation);
            }
        }
    }

    /// Oldest generation still pinned, if any.
    pub fn oldest(&self) -> Option<Generation> {
        self.live.lock().keys().next().copied()
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> u64 {
        self.live.lock().values().sum()
    }

    /// Returns true if no transaction is live.
    pub fn is_idle(&self) -> bool {
        self.live.lock().is_empty()
    }
}

/// Blocks waiting for readers to drain.
#[derive(Debug, Default)]
pub struct PendingFrees {
    /// Keyed by the last generation that can reach the blocks.
    by_generation: BTreeMap<Generation, Vec<(FileId, BlockId)>>,
}

impl PendingFrees {
    /// Records blocks replaced by the commit that followed `last_visible`.
    pub fn record(&mut self, last_visible: Generation, blocks: Vec<(FileId, BlockId)>) {
        if !blocks.is_empty() {
            self.by_generation.entry(last_visible).or_default().extend(blocks);
        }
    }

    /// Removes and returns every block no live reader can reach.
    ///
    /// With no readers at all, everything is freeable.
    pub fn drain_freeable(&mut self, oldest_reader: Option<Generation>) -> Vec<(FileId, BlockId)> {
        let cutoff = oldest_reader.unwrap_or(Generation(u64::MAX));
        let keep = self.by_generation.split_off(&cutoff);
        let freeable = std::mem::replace(&mut self.by_generation, keep);
        freeable.into_values().flatten().collect()
    }

    /// Number of blocks waiting.
    pub fn len(&self) -> usize {
        self.by_generation.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.by_generation.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let tracker = TransactionTracker::new();
        assert!(tracker.is_idle());

        tracker.register(Generation(1));
        tracker.register(Generation(1));
        tracker.register(Generation(3));
        assert_eq!(tracker.active_count(), 3);
        assert_eq!(tracker.oldest(), Some(Generation(1)));

        tracker.unregister(Generation(1));
        assert_eq!(tracker.oldest(), Some(Generation(1)));
        tracker.unregister(Generation(1));
        assert_eq!(tracker.oldest(), Some(Generation(3)));
        tracker.unregister(Generation(3));
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_unregister_unknown_is_ignored() {
        let tracker = TransactionTracker::new();
        tracker.unregister(Generation(9));
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn test_pending_frees_respect_oldest_reader() {
        let mut pending = PendingFrees::default();
        pending.record(Generation(1), vec![(2, 10), (2, 11)]);
        pending.record(Generation(2), vec![(3, 20)]);
        pending.record(Generation(3), vec![]);
        assert_eq!(pending.len(), 3);

        // A reader pinned at 1 still reaches blocks last visible at 1.
        assert!(pending.drain_freeable(Some(Generation(1))).is_empty());

        let freed = pending.drain_freeable(Some(Generation(2)));
        assert_eq!(freed, vec![(2, 10), (2, 11)]);
        assert_eq!(pending.len(), 1);

        let freed = pending.drain_freeable(None);
        assert_eq!(freed, vec![(3, 20)]);
        assert!(pending.is_empty());
    }
}
