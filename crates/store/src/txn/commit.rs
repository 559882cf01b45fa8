//! The write commit protocol.
//!
//! ```text
//! 1. node data   append new terms at the committed end, fsync
//! 2. journal     Redo per staged block, State, Commit, fsync
//! 3. apply       write blocks in place, fsync, store the state slot
//! 4. publish     swap the committed state pointer
//! 5. truncate    empty the journal
//! 6. cleanup     record deferred frees, cache new terms, release the writer
//! ```
//!
//! A failure up to and including the journal fsync loses the transaction and
//! leaves the committed store untouched. Past that point the journal is the
//! source of truth: the connection refuses further work until it is reopened
//! and replay completes the commit.

use std::sync::{Arc, atomic::Ordering};

use super::{CommitStage, CommittedState, Generation, TreeRoot, WriteSet};
use crate::{
    error::{Error, FileId, Result},
    journal::JournalEntry,
    store::StoreConnection,
};

/// Runs the commit protocol for `write` on top of `base`.
///
/// Returns the published generation, or `None` if nothing changed.
pub(super) fn commit_write(
    conn: &StoreConnection,
    base: &CommittedState,
    write: WriteSet<'_>,
) -> Result<Option<Generation>> {
    if let Err(err) = conn.check_open() {
        discard(conn, write);
        return Err(err);
    }
    if write.staging.iter().all(|staging| staging.is_empty()) && write.nodes.is_empty() {
        tracing::debug!(
            location = %conn.location,
            generation = base.generation.raw(),
            "Commit with no changes"
        );
        return Ok(None);
    }

    let generation = base.generation.next();
    let state = CommittedState {
        generation,
        trees: write
            .roots
            .iter()
            .zip(&conn.trees)
            .map(|(&root, storage)| TreeRoot { root, total_blocks: storage.extent() })
            .collect(),
        node_data_len: write.nodes.end_offset(),
        next_node_id: write.nodes.next_index(),
    };

    if let Err(err) = write_ahead(conn, &write, &state) {
        if let Err(truncate_err) = conn.journal.truncate() {
            tracing::warn!(
                journal = conn.journal.name(),
                error = %truncate_err,
                "Failed to clear journal after an aborted commit"
            );
        }
        discard(conn, write);
        return Err(err);
    }

    if let Err(err) = apply(conn, &write, &state) {
        conn.recovery_required.store(true, Ordering::SeqCst);
        tracing::error!(
            location = %conn.location,
            generation = generation.raw(),
            error = %err,
            "Commit failed after the journal was synced; reopen the location to recover"
        );
        return Err(err);
    }

    let mut frees = Vec::new();
    let mut blocks = 0;
    for (file_id, staging) in write.staging.iter().enumerate() {
        blocks += staging.staged_blocks().count();
        frees.extend(staging.deferred_frees().iter().map(|&block_id| (file_id as FileId, block_id)));
    }
    let deferred = frees.len();
    conn.pending_frees.lock().record(base.generation, frees);
    conn.node_table.publish(&write.nodes, generation);

    tracing::debug!(
        location = %conn.location,
        generation = generation.raw(),
        blocks,
        deferred,
        nodes = write.nodes.len(),
        "Committed write transaction"
    );
    Ok(Some(generation))
}

/// Steps 1 and 2: everything that must be durable before any in-place write.
fn write_ahead(conn: &StoreConnection, write: &WriteSet<'_>, state: &CommittedState) -> Result<()> {
    conn.node_table.append(write.nodes.base_offset(), write.nodes.bytes())?;
    checkpoint(conn, CommitStage::NodeDataSynced)?;

    for (file_id, staging) in write.staging.iter().enumerate() {
        for block in staging.staged_blocks() {
            conn.journal.write(&JournalEntry::redo(
                file_id as FileId,
                block.id,
                block.data.as_slice(),
            ))?;
        }
    }
    conn.journal.write(&JournalEntry::state(state.encode()))?;
    conn.journal.write(&JournalEntry::commit())?;
    conn.journal.sync()
}

/// Steps 3 to 5: replayable from the journal if interrupted.
fn apply(conn: &StoreConnection, write: &WriteSet<'_>, state: &CommittedState) -> Result<()> {
    checkpoint(conn, CommitStage::JournalSynced)?;

    for (storage, staging) in conn.trees.iter().zip(&write.staging) {
        if staging.is_empty() {
            continue;
        }
        for block in staging.staged_blocks() {
            storage.write_committed(block)?;
        }
        storage.sync()?;
    }
    conn.header.store(state)?;
    checkpoint(conn, CommitStage::BlocksApplied)?;

    conn.committed.store(Arc::new(state.clone()));
    checkpoint(conn, CommitStage::StatePublished)?;

    conn.journal.truncate()
}

fn checkpoint(conn: &StoreConnection, stage: CommitStage) -> Result<()> {
    match &conn.config.commit_hook {
        Some(hook) if !hook.on_stage(stage) => Err(Error::CommitInterrupted { stage }),
        _ => Ok(()),
    }
}

/// Hands staged block ids back to their allocators.
fn discard(conn: &StoreConnection, write: WriteSet<'_>) {
    for (storage, staging) in conn.trees.iter().zip(write.staging) {
        staging.discard(storage);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        nodetable::Term,
        store::{Location, LocationRegistry, StoreConfig},
        txn::CommitHook,
    };

    /// Records every stage and stops at `stop`.
    struct Recorder {
        seen: Mutex<Vec<CommitStage>>,
        stop: Option<CommitStage>,
    }

    impl CommitHook for Recorder {
        fn on_stage(&self, stage: CommitStage) -> bool {
            self.seen.lock().unwrap().push(stage);
            Some(stage) != self.stop
        }
    }

    fn key(n: u8) -> Vec<u8> {
        vec![n; 24]
    }

    #[test]
    fn test_stages_run_in_order() {
        let hook = Arc::new(Recorder { seen: Mutex::new(Vec::new()), stop: None });
        let registry = LocationRegistry::new();
        let config = StoreConfig::builder().commit_hook(hook.clone()).build();
        let conn = registry.make(&Location::memory("stages"), config).unwrap();

        let mut txn = conn.begin_write().unwrap();
        txn.get_allocate_id(&Term::iri("http://example.org/s")).unwrap();
        txn.insert("SPO", &key(1), &[]).unwrap();
        txn.commit().unwrap();

        assert_eq!(
            *hook.seen.lock().unwrap(),
            vec![
                CommitStage::NodeDataSynced,
                CommitStage::JournalSynced,
                CommitStage::BlocksApplied,
                CommitStage::StatePublished,
            ]
        );
        assert!(conn.journal.is_empty());
    }

    #[test]
    fn test_stop_before_journal_loses_transaction() {
        let hook = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            stop: Some(CommitStage::NodeDataSynced),
        });
        let registry = LocationRegistry::new();
        let config = StoreConfig::builder().commit_hook(hook).build();
        let conn = registry.make(&Location::memory("early"), config).unwrap();

        let mut txn = conn.begin_write().unwrap();
        txn.insert("SPO", &key(1), &[]).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, Error::CommitInterrupted { stage: CommitStage::NodeDataSynced }));
        assert!(!txn.is_active());

        // Nothing reached the journal and the connection is still usable.
        assert!(conn.journal.is_empty());
        assert_eq!(conn.generation(), Generation(0));
        assert!(!conn.begin_read().unwrap().contains("SPO", &key(1)).unwrap());
    }

    #[test]
    fn test_stop_after_journal_requires_recovery() {
        let hook = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            stop: Some(CommitStage::JournalSynced),
        });
        let registry = LocationRegistry::new();
        let config = StoreConfig::builder().commit_hook(hook).build();
        let conn = registry.make(&Location::memory("late"), config).unwrap();

        let mut txn = conn.begin_write().unwrap();
        txn.insert("SPO", &key(1), &[]).unwrap();
        assert!(txn.commit().is_err());

        assert!(!conn.journal.is_empty());
        assert!(matches!(conn.begin_read(), Err(Error::RecoveryRequired)));
    }
}
