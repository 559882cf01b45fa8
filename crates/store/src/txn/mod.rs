//! Transactions and the single-writer coordinator.
//!
//! ```text
//!  Idle ──begin_read──▶ Reading(G) ──end──▶ Idle
//!                          │
//!                       promote
//!                          ▼
//!  Idle ──begin_write─▶ Writing(G+1) ──commit / abort──▶ Idle
//! ```
//!
//! Every transaction pins the committed state it began on and registers its
//! generation with the [`TransactionTracker`], which keeps blocks replaced by
//! later commits alive until the transaction ends. At most one transaction
//! holds the writer lock; its changes live in per-file [`FileStaging`] and
//! [`PendingNodes`] until commit.

mod commit;
mod state;
mod tracker;

use std::{sync::Arc, time::Duration};

use parking_lot::MutexGuard;
pub use state::{CommittedState, Generation, TreeRoot};
pub use tracker::{PendingFrees, TransactionTracker};

use crate::{
    block::{FileStaging, ReadView, TxnView},
    btree::{BPlusTree, BTreeIterator, DuplicatePolicy, Range},
    codec::Record,
    error::{BlockId, Error, FileId, Result},
    nodetable::{NodeId, PendingNodes, Term},
    store::StoreConnection,
};

/// Tree file holding term hashes.
pub(crate) const HASH_TREE: FileId = 0;
/// Tree file holding node offsets.
pub(crate) const ID_TREE: FileId = 1;

/// Points in the commit protocol reported to a [`CommitHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStage {
    /// New node table bytes are durable.
    NodeDataSynced,
    /// The journal holds the complete transaction and is durable.
    JournalSynced,
    /// Blocks and the state slot are written in place.
    BlocksApplied,
    /// The new generation is visible to new transactions.
    StatePublished,
}

/// Observer of commit progress, used to simulate crashes.
///
/// Returning `false` stops the commit at that stage with
/// [`Error::CommitInterrupted`], handled exactly like an I/O failure there.
/// Nothing after the stage reaches disk, so expelling and remaking the
/// location afterwards recovers as a restart after a crash would.
pub trait CommitHook: Send + Sync {
    /// Called when a commit reaches `stage`.
    fn on_stage(&self, stage: CommitStage) -> bool;
}

/// Kind of transaction requested from [`StoreConnection::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnType {
    /// Read-only; [`Transaction::promote`] fails.
    Read,
    /// Read that may be promoted if no commit happened since it began.
    ReadPromote,
    /// Read that may be promoted onto the latest committed generation.
    ReadCommittedPromote,
    /// Write from the start.
    Write,
}

/// How a promotable read reacts to commits made after it began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromoteMode {
    /// Fail with [`Error::PromotionConflict`].
    #[default]
    Isolated,
    /// Move the snapshot forward to the latest generation.
    ReadCommitted,
}

impl PromoteMode {
    /// Transaction type a default read gets under this mode.
    pub fn read_type(self) -> TxnType {
        match self {
            PromoteMode::Isolated => TxnType::ReadPromote,
            PromoteMode::ReadCommitted => TxnType::ReadCommittedPromote,
        }
    }
}

/// What happens when a writer is requested while another holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterPolicy {
    /// Wait until the writer is free.
    #[default]
    Block,
    /// Fail immediately with [`Error::WriterActive`].
    Fail,
    /// Wait up to the given duration, then fail with [`Error::WriterActive`].
    Timeout(Duration),
}

/// Lazy range scan over one index.
pub type Scan<'t> = BTreeIterator<ReadView<'t>>;

/// Uncommitted changes of the active writer.
pub(crate) struct WriteSet<'c> {
    _guard: MutexGuard<'c, ()>,
    roots: Vec<BlockId>,
    staging: Vec<FileStaging>,
    nodes: PendingNodes,
}

impl<'c> WriteSet<'c> {
    fn new(guard: MutexGuard<'c, ()>, base: &CommittedState) -> Self {
        Self {
            _guard: guard,
            roots: base.trees.iter().map(|tree| tree.root).collect(),
            staging: base.trees.iter().map(|_| FileStaging::default()).collect(),
            nodes: PendingNodes::new(base.node_data_len, base.next_node_id),
        }
    }
}

/// A transaction on a [`StoreConnection`].
///
/// Reads see the generation the transaction pinned (plus, for a writer, its
/// own changes). A transaction that is dropped while active is ended; an
/// active writer is aborted.
///
/// Calls after `commit`, `abort` or `end` fail with
/// [`Error::TransactionNotActive`]. An error that leaves the writer's staged
/// state in doubt aborts the transaction (see [`Error::aborts_transaction`]).
pub struct Transaction<'c> {
    conn: &'c StoreConnection,
    txn_type: TxnType,
    snapshot: Arc<CommittedState>,
    active: bool,
    write: Option<WriteSet<'c>>,
}

impl<'c> Transaction<'c> {
    /// Wraps a pinned snapshot; `guard` is the writer lock for write transactions.
    pub(crate) fn new(
        conn: &'c StoreConnection,
        txn_type: TxnType,
        snapshot: Arc<CommittedState>,
        guard: Option<MutexGuard<'c, ()>>,
    ) -> Self {
        let write = guard.map(|guard| WriteSet::new(guard, &snapshot));
        Self { conn, txn_type, snapshot, active: true, write }
    }

    /// The type this transaction was begun with.
    pub fn txn_type(&self) -> TxnType {
        self.txn_type
    }

    /// Generation of the pinned snapshot.
    pub fn generation(&self) -> Generation {
        self.snapshot.generation
    }

    /// Returns true until commit, abort or end.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns true if this transaction holds the writer.
    pub fn is_write(&self) -> bool {
        self.write.is_some()
    }

    /// Upgrades a promotable read into a write transaction.
    ///
    /// Promoting a write transaction is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPromotable`] for [`TxnType::Read`],
    /// [`Error::WriterActive`] if the writer cannot be obtained under the
    /// connection's [`WriterPolicy`], and [`Error::PromotionConflict`] if an
    /// isolated read is no longer on the latest generation. The read stays
    /// usable after any of these.
    pub fn promote(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.write.is_some() {
            return Ok(());
        }
        let mode = match self.txn_type {
            TxnType::Read => return Err(Error::NotPromotable),
            TxnType::ReadPromote | TxnType::Write => PromoteMode::Isolated,
            TxnType::ReadCommittedPromote => PromoteMode::ReadCommitted,
        };

        self.conn.check_open()?;
        let guard = self.conn.acquire_writer()?;
        let latest = self.conn.committed.load_full();
        if latest.generation != self.snapshot.generation {
            match mode {
                PromoteMode::Isolated => {
                    tracing::debug!(
                        location = %self.conn.location,
                        snapshot = self.snapshot.generation.raw(),
                        latest = latest.generation.raw(),
                        "Promotion conflict"
                    );
                    return Err(Error::PromotionConflict {
                        snapshot: self.snapshot.generation.raw(),
                        latest: latest.generation.raw(),
                    });
                },
                PromoteMode::ReadCommitted => {
                    // The writer lock keeps `latest` current while we re-pin.
                    self.conn.tracker.register(latest.generation);
                    self.conn.tracker.unregister(self.snapshot.generation);
                    self.snapshot = latest;
                    self.conn.release_pending();
                },
            }
        }

        self.write = Some(WriteSet::new(guard, &self.snapshot));
        tracing::debug!(
            location = %self.conn.location,
            generation = self.snapshot.generation.raw(),
            "Promoted read transaction"
        );
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// Committing a read transaction simply ends it. A write that changed
    /// nothing releases the writer without advancing the generation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionNotActive`] if already finished. An error
    /// before the journal is durable discards the changes; an error after it
    /// leaves the connection in [`Error::RecoveryRequired`]. The transaction
    /// is finished either way.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        let result = match self.write.take() {
            Some(write) => commit::commit_write(self.conn, &self.snapshot, write).map(|_| ()),
            None => Ok(()),
        };
        self.close();
        result
    }

    /// Discards every change and finishes the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionNotActive`] if already finished.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.abort_inner();
        Ok(())
    }

    /// Finishes the transaction, aborting it if it is a writer.
    ///
    /// Calling `end` on a finished transaction does nothing.
    pub fn end(&mut self) {
        if self.write.is_some() {
            self.abort_inner();
        } else {
            self.close();
        }
    }

    /// Looks up the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIndex`], [`Error::RecordSize`] for a mis-sized
    /// key, or any block read error.
    pub fn find(&self, index: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree(self.conn.index_file(index)?)?.find(key)
    }

    /// Returns true if `key` is present.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find).
    pub fn contains(&self, index: &str, key: &[u8]) -> Result<bool> {
        Ok(self.find(index, key)?.is_some())
    }

    /// Iterates the records of `index` within `range`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIndex`] or [`Error::TransactionNotActive`];
    /// read errors surface from the iterator.
    pub fn scan(&self, index: &str, range: Range) -> Result<Scan<'_>> {
        self.scan_file(self.conn.index_file(index)?, range)
    }

    /// Iterates the records whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// As [`scan`](Self::scan).
    pub fn scan_prefix(&self, index: &str, prefix: &[u8]) -> Result<Scan<'_>> {
        self.scan(index, Range::prefix(prefix))
    }

    /// Record with the smallest key.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find).
    pub fn min(&self, index: &str) -> Result<Option<Record>> {
        self.tree(self.conn.index_file(index)?)?.min()
    }

    /// Record with the largest key.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find).
    pub fn max(&self, index: &str) -> Result<Option<Record>> {
        self.tree(self.conn.index_file(index)?)?.max()
    }

    /// Number of records in `index`.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find).
    pub fn count(&self, index: &str) -> Result<u64> {
        self.tree(self.conn.index_file(index)?)?.count()
    }

    /// Inserts or overwrites a record, returning the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] outside a write transaction, otherwise as
    /// [`insert_with`](Self::insert_with).
    pub fn insert(&mut self, index: &str, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.insert_with(index, key, value, DuplicatePolicy::Overwrite)
    }

    /// Inserts a record under an explicit duplicate policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] outside a write transaction,
    /// [`Error::DuplicateKey`] under [`DuplicatePolicy::Reject`],
    /// [`Error::RecordSize`] for mis-sized keys or values, or any block error
    /// (which aborts the transaction).
    pub fn insert_with(
        &mut self,
        index: &str,
        key: &[u8],
        value: &[u8],
        policy: DuplicatePolicy,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let file_id = self.conn.index_file(index)?;
        self.mutate(|conn, write, generation| {
            let f = file_id as usize;
            let view = TxnView::new(&conn.trees[f], &mut write.staging[f], generation);
            let mut tree = BPlusTree::new(write.roots[f], view);
            let previous = tree.insert(key, value, policy)?;
            write.roots[f] = tree.root();
            Ok(previous)
        })
    }

    /// Deletes a record, returning its value if it existed.
    ///
    /// # Errors
    ///
    /// As [`insert_with`](Self::insert_with).
    pub fn delete(&mut self, index: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let file_id = self.conn.index_file(index)?;
        self.mutate(|conn, write, generation| {
            let f = file_id as usize;
            let view = TxnView::new(&conn.trees[f], &mut write.staging[f], generation);
            let mut tree = BPlusTree::new(write.roots[f], view);
            let previous = tree.delete(key)?;
            write.roots[f] = tree.root();
            Ok(previous)
        })
    }

    /// Returns the id of `term` if it is inline or already in the node table.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash tree cannot be read.
    pub fn get_id(&self, term: &Term) -> Result<Option<NodeId>> {
        let tree = self.tree(HASH_TREE)?;
        let pending = self.write.as_ref().map(|write| &write.nodes);
        self.conn.node_table.find_id(&tree, pending, term, self.snapshot.generation)
    }

    /// Resolves a node id to its term; unknown ids yield `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id tree or data file cannot be read.
    pub fn get_term(&self, id: NodeId) -> Result<Option<Term>> {
        let tree = self.tree(ID_TREE)?;
        let pending = self.write.as_ref().map(|write| &write.nodes);
        self.conn.node_table.find_term(&tree, pending, id, self.snapshot.generation)
    }

    /// Returns the id of `term`, adding it to the node table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] if the term is new and this is not a
    /// write transaction, or any tree error (which aborts the transaction).
    pub fn get_allocate_id(&mut self, term: &Term) -> Result<NodeId> {
        if let Some(id) = self.get_id(term)? {
            return Ok(id);
        }
        let visible = self.snapshot.generation;
        self.mutate(|conn, write, generation| {
            let (hash_staging, rest) = write.staging.split_at_mut(ID_TREE as usize);
            let hash_view = TxnView::new(&conn.trees[0], &mut hash_staging[0], generation);
            let id_view = TxnView::new(&conn.trees[1], &mut rest[0], generation);
            let mut hash_tree = BPlusTree::new(write.roots[0], hash_view);
            let mut id_tree = BPlusTree::new(write.roots[1], id_view);
            let id = conn.node_table.allocate(
                &mut hash_tree,
                &mut id_tree,
                &mut write.nodes,
                term,
                None,
                visible,
            )?;
            write.roots[0] = hash_tree.root();
            write.roots[1] = id_tree.root();
            Ok(id)
        })
    }

    /// Iterates any tree file, node table trees included.
    pub(crate) fn scan_file(&self, file_id: FileId, range: Range) -> Result<Scan<'_>> {
        self.ensure_active()?;
        let (root, view) = self.view(file_id);
        Ok(BTreeIterator::new(view, root, range))
    }

    /// The committed state this transaction pinned.
    pub(crate) fn snapshot(&self) -> &CommittedState {
        &self.snapshot
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active { Ok(()) } else { Err(Error::TransactionNotActive) }
    }

    /// Root and read view of one tree as this transaction sees it.
    fn view(&self, file_id: FileId) -> (BlockId, ReadView<'_>) {
        let f = file_id as usize;
        let storage = &self.conn.trees[f];
        match &self.write {
            Some(write) => (write.roots[f], ReadView::staged(storage, &write.staging[f])),
            None => (self.snapshot.root(file_id), ReadView::committed(storage)),
        }
    }

    pub(crate) fn tree(&self, file_id: FileId) -> Result<BPlusTree<ReadView<'_>>> {
        self.ensure_active()?;
        let (root, view) = self.view(file_id);
        Ok(BPlusTree::new(root, view))
    }

    /// Runs a change against the write set, aborting on fatal errors.
    fn mutate<T>(
        &mut self,
        op: impl FnOnce(&'c StoreConnection, &mut WriteSet<'c>, u64) -> Result<T>,
    ) -> Result<T> {
        self.ensure_active()?;
        let conn = self.conn;
        let generation = self.snapshot.generation.next().raw();
        let write = self.write.as_mut().ok_or(Error::ReadOnly)?;
        match op(conn, write, generation) {
            Err(err) if err.aborts_transaction() => {
                tracing::debug!(
                    location = %conn.location,
                    error = %err,
                    "Aborting write transaction after error"
                );
                self.abort_inner();
                Err(err)
            },
            result => result,
        }
    }

    fn abort_inner(&mut self) {
        if let Some(write) = self.write.take() {
            let pending_nodes = write.nodes.len();
            for (storage, staging) in self.conn.trees.iter().zip(write.staging) {
                staging.discard(storage);
            }
            tracing::debug!(
                location = %self.conn.location,
                generation = self.snapshot.generation.raw(),
                pending_nodes,
                "Aborted write transaction"
            );
        }
        self.close();
    }

    fn close(&mut self) {
        if self.active {
            self.active = false;
            self.conn.tracker.unregister(self.snapshot.generation);
            self.conn.release_pending();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.write.is_some() {
            tracing::warn!(
                location = %self.conn.location,
                generation = self.snapshot.generation.raw(),
                "Write transaction dropped without commit or abort"
            );
            self.abort_inner();
        } else {
            self.close();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("location", &self.conn.location)
            .field("txn_type", &self.txn_type)
            .field("generation", &self.snapshot.generation)
            .field("active", &self.active)
            .field("write", &self.write.is_some())
            .finish()
    }
}
