//! Journal replay on open.

use super::header::StateFile;
use crate::{
    block::{Block, BlockStorage},
    error::{Error, Result},
    journal::{EntryKind, Journal},
    txn::CommittedState,
};

/// Re-applies every committed group in `journal`, then truncates it.
///
/// Returns the committed state after replay: the last replayed `State`
/// entry, or `state` unchanged if the journal held only a torn tail. Entries
/// are whole block images and whole states, so replaying twice is the same
/// as replaying once.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] or [`Error::BlockChecksumMismatch`] if a
/// committed entry does not fit the store, and [`Error::Io`] on write
/// failures. The journal is left intact on error.
pub(super) fn replay(
    journal: &Journal,
    trees: &[BlockStorage],
    header: &StateFile,
    mut state: CommittedState,
) -> Result<CommittedState> {
    let groups = journal.committed_groups()?;
    let mut blocks = 0;
    for group in &groups {
        for entry in group {
            match entry.kind {
                EntryKind::Redo => {
                    let storage = trees.get(entry.file_id as usize).ok_or_else(|| {
                        Error::Corrupted {
                            reason: format!(
                                "{}: redo entry for unknown file {}",
                                journal.name(),
                                entry.file_id
                            ),
                        }
                    })?;
                    if entry.payload.len() != storage.block_size() {
                        return Err(Error::Corrupted {
                            reason: format!(
                                "{}: redo image of {} bytes for {} with {}-byte blocks",
                                journal.name(),
                                entry.payload.len(),
                                storage.name(),
                                storage.block_size()
                            ),
                        });
                    }
                    let block = Block::from_bytes(entry.block_id, entry.payload.clone());
                    if !block.verify_checksum() {
                        return Err(Error::BlockChecksumMismatch {
                            file_id: entry.file_id,
                            block_id: entry.block_id,
                        });
                    }
                    storage.write_committed(&block)?;
                    blocks += 1;
                },
                EntryKind::State => {
                    let replayed = CommittedState::decode(&entry.payload)?;
                    if replayed.trees.len() != trees.len() {
                        return Err(Error::Corrupted {
                            reason: format!(
                                "{}: state entry for {} trees, store has {}",
                                journal.name(),
                                replayed.trees.len(),
                                trees.len()
                            ),
                        });
                    }
                    state = replayed;
                },
                EntryKind::Commit | EntryKind::Abort => {},
            }
        }
    }

    if !groups.is_empty() {
        for storage in trees {
            storage.sync()?;
        }
        header.store(&state)?;
        tracing::warn!(
            journal = journal.name(),
            transactions = groups.len(),
            blocks,
            generation = state.generation.raw(),
            "Replayed journal"
        );
    }
    journal.truncate()?;
    Ok(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use crate::{
        backend::StorageBackend,
        error::Error,
        store::{Location, LocationRegistry, StoreConfig},
        txn::{CommitHook, CommitStage, Generation},
    };

    struct StopAt(CommitStage);

    impl CommitHook for StopAt {
        fn on_stage(&self, stage: CommitStage) -> bool {
            stage != self.0
        }
    }

    fn key(n: u8) -> Vec<u8> {
        vec![n; 24]
    }

    fn crashing(stage: CommitStage) -> StoreConfig {
        StoreConfig::builder().commit_hook(Arc::new(StopAt(stage))).build()
    }

    #[test]
    fn test_reconnect_completes_journaled_commit() {
        let registry = LocationRegistry::new();
        let location = Location::memory("replay");

        let conn = registry.make(&location, crashing(CommitStage::JournalSynced)).unwrap();
        let mut txn = conn.begin_write().unwrap();
        for n in 0..50 {
            txn.insert("SPO", &key(n), &[]).unwrap();
        }
        assert!(matches!(txn.commit(), Err(Error::CommitInterrupted { .. })));
        drop(txn);
        registry.expel(&location).unwrap();

        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        assert_eq!(conn.generation(), Generation(1));
        let reader = conn.begin_read().unwrap();
        assert_eq!(reader.count("SPO").unwrap(), 50);
        assert!(conn.verify().unwrap().is_ok());
    }

    #[test]
    fn test_replay_twice_equals_once() {
        let registry = LocationRegistry::new();
        let location = Location::memory("twice");

        let conn = registry.make(&location, crashing(CommitStage::BlocksApplied)).unwrap();
        let mut txn = conn.begin_write().unwrap();
        for n in 0..20 {
            txn.insert("POS", &key(n), &[]).unwrap();
        }
        assert!(txn.commit().is_err());
        drop(txn);

        let area = registry.memory_area("twice").unwrap();
        let journal = area.file("journal.jrnl").unwrap().read_all().unwrap();
        assert!(!journal.is_empty());
        registry.expel(&location).unwrap();

        registry.make(&location, StoreConfig::default()).unwrap();
        let once = area.file("POS.bpt").unwrap().read_all().unwrap();
        registry.expel(&location).unwrap();

        // Put the same journal back and replay it a second time.
        area.file("journal.jrnl").unwrap().write_at(0, &journal).unwrap();
        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        let twice = area.file("POS.bpt").unwrap().read_all().unwrap();

        assert_eq!(once, twice);
        assert_eq!(conn.generation(), Generation(1));
        assert_eq!(conn.begin_read().unwrap().count("POS").unwrap(), 20);
    }

    #[test]
    fn test_torn_journal_is_discarded() {
        let registry = LocationRegistry::new();
        let location = Location::memory("torn");
        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        let mut txn = conn.begin_write().unwrap();
        txn.insert("SPO", &key(1), &[]).unwrap();
        txn.commit().unwrap();
        drop(txn);
        registry.expel(&location).unwrap();

        // A half-written entry with no commit marker.
        let area = registry.memory_area("torn").unwrap();
        area.file("journal.jrnl").unwrap().write_at(0, &[9, 0, 0, 0, 1, 0]).unwrap();

        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        assert_eq!(conn.generation(), Generation(1));
        assert!(conn.begin_read().unwrap().contains("SPO", &key(1)).unwrap());
        assert_eq!(area.file("journal.jrnl").unwrap().read_all().unwrap(), Vec::<u8>::new());
    }
}
