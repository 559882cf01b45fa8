//! Store connections.
//!
//! A [`StoreConnection`] owns every file of one [`Location`]:
//!
//! ```text
//! params.json     persisted StoreParams
//! <name>.bpt      one block file per tree (nodes-hash, nodes-id, indexes)
//! nodes.dat       node table data
//! state.hdr       dual-slot committed state
//! journal.jrnl    redo journal
//! quarry.lock     owner lock (directory locations only)
//! ```
//!
//! Opening a connection validates or creates these files, replays a
//! non-empty journal, rebuilds each tree's free list from the committed
//! roots and discards node data past the committed end. Connections are
//! obtained through a [`LocationRegistry`].

mod bulk;
mod header;
mod location;
mod lock;
mod recovery;
mod registry;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use arc_swap::ArcSwap;
pub use bulk::BulkLoader;
use header::StateFile;
use location::FileSet;
pub use location::Location;
pub use lock::LockFile;
use parking_lot::{Mutex, MutexGuard, RwLock};
pub use registry::LocationRegistry;

use crate::{
    block::{BlockStorage, CacheStats},
    codec::TreeLayout,
    error::{Error, FileId, Result},
    journal::Journal,
    nodetable::NodeTable,
    params::StoreParams,
    txn::{
        CommitHook, CommittedState, Generation, PendingFrees, PromoteMode, Transaction,
        TransactionTracker, TxnType, WriterPolicy,
    },
};

const PARAMS_FILE: &str = "params.json";
const NODE_DATA_FILE: &str = "nodes.dat";
const STATE_FILE: &str = "state.hdr";
const JOURNAL_FILE: &str = "journal.jrnl";
const LOCK_FILE: &str = "quarry.lock";
const TREE_EXTENSION: &str = "bpt";

/// Number of node table trees ahead of the indexes in file order.
const NODE_TREES: usize = 2;

/// Runtime configuration of a connection.
///
/// Only `params` is persisted, and only when the location is created.
#[derive(Clone, bon::Builder)]
pub struct StoreConfig {
    /// Layout for a new store; cache sizes also apply on reopen.
    #[builder(default)]
    pub params: StoreParams,
    /// Behavior when a writer is requested while another is active.
    #[builder(default)]
    pub writer_policy: WriterPolicy,
    /// Promotion mode of transactions begun with
    /// [`begin_read`](StoreConnection::begin_read).
    #[builder(default)]
    pub promote_mode: PromoteMode,
    /// Leaf capacity override, to force deep trees in tests.
    pub max_leaf_records: Option<usize>,
    /// Branch capacity override, to force deep trees in tests.
    pub max_branch_keys: Option<usize>,
    /// Observer called at each commit stage.
    pub commit_hook: Option<Arc<dyn CommitHook>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("params", &self.params)
            .field("writer_policy", &self.writer_policy)
            .field("promote_mode", &self.promote_mode)
            .field("max_leaf_records", &self.max_leaf_records)
            .field("max_branch_keys", &self.max_branch_keys)
            .field("commit_hook", &self.commit_hook.is_some())
            .finish()
    }
}

/// Counters for one tree file.
#[derive(Debug, Clone)]
pub struct TreeStats {
    /// Tree name.
    pub name: String,
    /// Block slots in the file, including the meta block.
    pub total_blocks: u64,
    /// Slots on the free list.
    pub free_blocks: usize,
    /// Block cache counters.
    pub cache: CacheStats,
}

/// Point-in-time counters of a connection.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Latest committed generation.
    pub generation: Generation,
    /// Live transactions, writer included.
    pub active_transactions: u64,
    /// Whether a writer or bulk loader holds the writer lock.
    pub writer_active: bool,
    /// Replaced blocks waiting for older readers to finish.
    pub pending_frees: usize,
    /// Committed length of the node data file.
    pub node_data_len: u64,
    /// Terms in the node table.
    pub nodes: u64,
    /// Per-tree counters in file order.
    pub trees: Vec<TreeStats>,
}

/// An open store at one location.
///
/// Reads never block: every transaction pins the committed state current at
/// its start. One writer at a time holds the writer lock and publishes a new
/// generation on commit.
pub struct StoreConnection {
    pub(crate) location: Location,
    pub(crate) params: StoreParams,
    pub(crate) config: StoreConfig,
    pub(crate) trees: Vec<BlockStorage>,
    pub(crate) tree_names: Vec<String>,
    pub(crate) node_table: NodeTable,
    pub(crate) journal: Journal,
    pub(crate) header: StateFile,
    pub(crate) committed: ArcSwap<CommittedState>,
    pub(crate) tracker: TransactionTracker,
    pub(crate) pending_frees: Mutex<PendingFrees>,
    pub(crate) writer: Mutex<()>,
    pub(crate) bulk_active: AtomicBool,
    pub(crate) recovery_required: AtomicBool,
    closed: AtomicBool,
    /// Held shared while a transaction registers and exclusively while
    /// closing.
    gate: RwLock<()>,
    lock: Mutex<Option<LockFile>>,
}

impl StoreConnection {
    pub(crate) fn open(location: Location, files: FileSet, config: StoreConfig) -> Result<Self> {
        let lock = match &location {
            Location::Directory(path) => {
                std::fs::create_dir_all(path)?;
                let mut lock = LockFile::new(path.join(LOCK_FILE));
                lock.obtain()?;
                Some(lock)
            },
            Location::Memory(_) => None,
        };

        let params_file = files.open(PARAMS_FILE)?;
        let created = params_file.is_empty()?;
        let params = if created {
            config.params.validate()?;
            params_file.write_at(0, &config.params.to_json()?)?;
            params_file.sync()?;
            config.params.clone()
        } else {
            StoreParams::from_json(&params_file.read_all()?)?.merge_runtime(&config.params)
        };

        let mut trees = Vec::new();
        let mut tree_names = Vec::new();
        for (file_id, spec) in params.all_trees().into_iter().enumerate() {
            let layout = TreeLayout::new(spec.key_len, spec.value_len, params.block_size)
                .with_limits(config.max_leaf_records, config.max_branch_keys);
            let backend = files.open(&format!("{}.{TREE_EXTENSION}", spec.name))?;
            trees.push(BlockStorage::open(
                file_id as FileId,
                backend,
                layout,
                params.block_size,
                params.block_cache_size,
            )?);
            tree_names.push(spec.name);
        }

        let node_table = NodeTable::new(files.open(NODE_DATA_FILE)?, params.node_cache_size);
        let (header, mut state) = StateFile::open(files.open(STATE_FILE)?, trees.len())?;
        let journal = Journal::open(files.open(JOURNAL_FILE)?)?;
        if !journal.is_empty() {
            state = recovery::replay(&journal, &trees, &header, state)?;
        }
        for (storage, tree) in trees.iter().zip(&state.trees) {
            storage.restore(tree.root, tree.total_blocks)?;
        }
        node_table.truncate_to(state.node_data_len)?;

        tracing::info!(
            location = %location,
            created,
            generation = state.generation.raw(),
            trees = trees.len(),
            block_size = params.block_size,
            "Opened store"
        );

        Ok(Self {
            location,
            params,
            config,
            trees,
            tree_names,
            node_table,
            journal,
            header,
            committed: ArcSwap::from_pointee(state),
            tracker: TransactionTracker::new(),
            pending_frees: Mutex::new(PendingFrees::default()),
            writer: Mutex::new(()),
            bulk_active: AtomicBool::new(false),
            recovery_required: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            gate: RwLock::new(()),
            lock: Mutex::new(lock),
        })
    }

    /// The location this connection serves.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Effective parameters (persisted layout, runtime cache sizes).
    pub fn params(&self) -> &StoreParams {
        &self.params
    }

    /// Latest committed generation.
    pub fn generation(&self) -> Generation {
        self.committed.load().generation
    }

    /// Returns true once the connection has been expelled.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Begins a transaction of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WriterActive`] if a write is requested while the
    /// writer is busy (per [`WriterPolicy`]) or any transaction is requested
    /// during a bulk load, [`Error::ConnectionClosed`] after expel, and
    /// [`Error::RecoveryRequired`] after a failed commit.
    pub fn begin(&self, txn_type: TxnType) -> Result<Transaction<'_>> {
        self.check_open()?;
        let guard = match txn_type {
            TxnType::Write => Some(self.acquire_writer()?),
            TxnType::Read | TxnType::ReadPromote | TxnType::ReadCommittedPromote => None,
        };
        // A commit that failed while we waited for the writer leaves the
        // store in need of replay.
        self.check_open()?;
        let snapshot = self.pin()?;
        tracing::trace!(
            location = %self.location,
            generation = snapshot.generation.raw(),
            txn_type = ?txn_type,
            "Began transaction"
        );
        Ok(Transaction::new(self, txn_type, snapshot, guard))
    }

    /// Begins a read using the configured [`PromoteMode`].
    ///
    /// # Errors
    ///
    /// As [`begin`](Self::begin).
    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        self.begin(self.config.promote_mode.read_type())
    }

    /// Begins a write transaction.
    ///
    /// # Errors
    ///
    /// As [`begin`](Self::begin).
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        self.begin(TxnType::Write)
    }

    /// Current counters.
    pub fn stats(&self) -> StoreStats {
        let state = self.committed.load_full();
        StoreStats {
            generation: state.generation,
            active_transactions: self.tracker.active_count(),
            writer_active: self.writer.is_locked(),
            pending_frees: self.pending_frees.lock().len(),
            node_data_len: state.node_data_len,
            nodes: state.next_node_id,
            trees: self
                .trees
                .iter()
                .zip(&self.tree_names)
                .map(|(storage, name)| TreeStats {
                    name: name.clone(),
                    total_blocks: storage.extent(),
                    free_blocks: storage.allocator().free_block_count(),
                    cache: storage.cache_stats(),
                })
                .collect(),
        }
    }

    /// Stops accepting transactions and releases the location lock.
    ///
    /// Refuses while any transaction or bulk load is running: once the lock
    /// is released another connection may reuse blocks that a live snapshot
    /// still reads. Called by [`LocationRegistry::expel`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionBusy`] while work is in progress, and
    /// [`Error::Io`] if the lock file cannot be released.
    pub(crate) fn close(&self) -> Result<()> {
        let _gate = self.gate.write();
        if self.is_closed() {
            return Ok(());
        }
        let active = self.tracker.active_count();
        let writer = self.writer.is_locked();
        if active > 0 || writer {
            tracing::debug!(location = %self.location, active, writer, "Close refused");
            return Err(Error::ConnectionBusy {
                location: self.location.to_string(),
                active,
                writer,
            });
        }
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut lock) = self.lock.lock().take() {
            lock.release()?;
        }
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed { location: self.location.to_string() });
        }
        if self.recovery_required.load(Ordering::SeqCst) {
            return Err(Error::RecoveryRequired);
        }
        Ok(())
    }

    /// Takes the writer lock under the configured policy.
    pub(crate) fn acquire_writer(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = match self.config.writer_policy {
            WriterPolicy::Block => Some(self.writer.lock()),
            WriterPolicy::Fail => self.writer.try_lock(),
            WriterPolicy::Timeout(timeout) => self.writer.try_lock_for(timeout),
        };
        guard.ok_or(Error::WriterActive)
    }

    /// Registers a new transaction on the latest committed state.
    fn pin(&self) -> Result<Arc<CommittedState>> {
        let _gate = self.gate.read();
        if self.is_closed() {
            return Err(Error::ConnectionClosed { location: self.location.to_string() });
        }
        loop {
            let state = self.committed.load_full();
            self.tracker.register(state.generation);
            // A commit between the load and the registration may already
            // have freed blocks of `state`.
            if self.committed.load().generation != state.generation {
                self.tracker.unregister(state.generation);
                continue;
            }
            if self.bulk_active.load(Ordering::SeqCst) {
                self.tracker.unregister(state.generation);
                return Err(Error::WriterActive);
            }
            return Ok(state);
        }
    }

    /// Frees replaced blocks that no live transaction can reach.
    pub(crate) fn release_pending(&self) {
        let oldest = self.tracker.oldest();
        let freeable = self.pending_frees.lock().drain_freeable(oldest);
        if freeable.is_empty() {
            return;
        }
        tracing::trace!(location = %self.location, blocks = freeable.len(), "Releasing blocks");
        for (file_id, block_id) in freeable {
            if let Some(storage) = self.trees.get(file_id as usize) {
                storage.evict(block_id);
                storage.allocator().free(block_id);
            }
        }
    }

    /// File id of a configured index.
    pub(crate) fn index_file(&self, name: &str) -> Result<FileId> {
        self.tree_names
            .iter()
            .skip(NODE_TREES)
            .position(|tree| tree == name)
            .map(|position| (position + NODE_TREES) as FileId)
            .ok_or_else(|| Error::UnknownIndex { name: name.to_string() })
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("location", &self.location)
            .field("generation", &self.generation())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::params::IndexSpec;

    fn key(n: u64) -> Vec<u8> {
        let mut key = vec![0u8; 24];
        key[16..].copy_from_slice(&n.to_be_bytes());
        key
    }

    #[test]
    fn test_directory_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let registry = LocationRegistry::new();
        registry.make(&Location::directory(&path), StoreConfig::default()).unwrap();

        for name in [
            "params.json",
            "nodes-hash.bpt",
            "nodes-id.bpt",
            "SPO.bpt",
            "POS.bpt",
            "OSP.bpt",
            "nodes.dat",
            "state.hdr",
            "journal.jrnl",
            "quarry.lock",
        ] {
            assert!(path.join(name).is_file(), "missing {name}");
        }
    }

    #[test]
    fn test_reopen_keeps_data_and_persisted_layout() {
        let dir = tempdir().unwrap();
        let location = Location::directory(dir.path());
        let registry = LocationRegistry::new();
        let params = StoreParams::builder()
            .block_size(4096)
            .indexes(vec![IndexSpec::new("ints", 8, 4)])
            .build()
            .unwrap();

        let conn =
            registry.make(&location, StoreConfig::builder().params(params).build()).unwrap();
        let mut txn = conn.begin_write().unwrap();
        txn.insert("ints", &7u64.to_be_bytes(), &[1, 2, 3, 4]).unwrap();
        txn.commit().unwrap();
        drop(txn);
        registry.expel(&location).unwrap();

        // Defaults ask for a different layout; the persisted one wins.
        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        assert_eq!(conn.params().block_size, 4096);
        assert_eq!(conn.generation(), Generation(1));
        let txn = conn.begin_read().unwrap();
        assert_eq!(txn.find("ints", &7u64.to_be_bytes()).unwrap(), Some(vec![1, 2, 3, 4]));
        assert!(matches!(txn.find("SPO", &key(1)), Err(Error::UnknownIndex { .. })));
    }

    #[test]
    fn test_invalid_params_rejected_on_create() {
        let registry = LocationRegistry::new();
        let mut params = StoreParams::default();
        params.block_size = 1000;
        let err = registry
            .make(&Location::memory("bad"), StoreConfig::builder().params(params).build())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams { .. }));
    }

    #[test]
    fn test_replaced_blocks_wait_for_readers() {
        let registry = LocationRegistry::new();
        let conn = registry.make(&Location::memory("frees"), StoreConfig::default()).unwrap();

        let mut txn = conn.begin_write().unwrap();
        txn.insert("SPO", &key(1), &[]).unwrap();
        txn.commit().unwrap();
        drop(txn);

        let reader = conn.begin_read().unwrap();
        let mut txn = conn.begin_write().unwrap();
        txn.insert("SPO", &key(2), &[]).unwrap();
        txn.commit().unwrap();
        drop(txn);

        assert_eq!(conn.stats().pending_frees, 1, "old root kept for the reader");
        assert!(reader.contains("SPO", &key(1)).unwrap());
        assert!(!reader.contains("SPO", &key(2)).unwrap());

        drop(reader);
        let stats = conn.stats();
        assert_eq!(stats.pending_frees, 0);
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.trees[2].name, "SPO");
        assert_eq!(stats.trees[2].free_blocks, 1);
    }

    #[test]
    fn test_stats_report_writer() {
        let registry = LocationRegistry::new();
        let conn = registry.make(&Location::memory("stats"), StoreConfig::default()).unwrap();
        assert!(!conn.stats().writer_active);

        let mut txn = conn.begin_write().unwrap();
        assert!(conn.stats().writer_active);
        txn.get_allocate_id(&crate::nodetable::Term::iri("http://example.org/a")).unwrap();
        txn.commit().unwrap();

        let stats = conn.stats();
        assert!(!stats.writer_active);
        assert_eq!(stats.nodes, 1);
        assert!(stats.node_data_len > 0);
    }
}
