//! Bulk loading and compaction.
//!
//! A [`BulkLoader`] writes tree blocks and node data in place: no journal, no
//! copy-on-write, no staging. It holds the writer lock and keeps every other
//! transaction out for its lifetime, and publishes exactly one generation
//! when it finishes. A crash during a bulk load can leave the trees in an
//! unusable state; load into a fresh location when that matters.

use std::sync::{Arc, atomic::Ordering};

use parking_lot::MutexGuard;

use super::{NODE_TREES, StoreConnection};
use crate::{
    block::DirectView,
    btree::{BPlusTree, DuplicatePolicy, Range},
    error::{BlockId, Error, FileId, Result},
    nodetable::{NodeId, PendingNodes, Term},
    txn::{CommittedState, Generation, HASH_TREE, ID_TREE, TreeRoot, TxnType},
};

/// Node data is written out once this many bytes are pending.
const NODE_FLUSH_BYTES: usize = 1 << 20;

/// Direct, unjournaled writer for loading large datasets.
///
/// Obtained from [`StoreConnection::bulk_loader`]. Call
/// [`finish`](Self::finish) to publish; dropping an unfinished loader
/// publishes too, logging a warning.
pub struct BulkLoader<'c> {
    conn: &'c StoreConnection,
    _guard: MutexGuard<'c, ()>,
    base: Arc<CommittedState>,
    roots: Vec<BlockId>,
    nodes: PendingNodes,
    records: u64,
    finished: bool,
}

impl StoreConnection {
    /// Starts a bulk load.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BulkLoadRejected`] if a writer or any reader is
    /// active, and the usual errors of a closed or unrecovered connection.
    pub fn bulk_loader(&self) -> Result<BulkLoader<'_>> {
        self.check_open()?;
        let guard = self.writer.try_lock().ok_or_else(|| Error::BulkLoadRejected {
            reason: "a write transaction is active".to_string(),
        })?;
        // A close that saw the writer free may have finished meanwhile.
        let _gate = self.gate.read();
        self.check_open()?;

        // Readers check the flag after registering; checking the tracker
        // after setting it closes the window between the two.
        self.bulk_active.store(true, Ordering::SeqCst);
        let active = self.tracker.active_count();
        if active > 0 {
            self.bulk_active.store(false, Ordering::SeqCst);
            return Err(Error::BulkLoadRejected {
                reason: format!("{active} transactions are active"),
            });
        }

        let base = self.committed.load_full();
        tracing::info!(
            location = %self.location,
            generation = base.generation.raw(),
            "Started bulk load"
        );
        Ok(BulkLoader {
            conn: self,
            _guard: guard,
            roots: base.trees.iter().map(|tree| tree.root).collect(),
            nodes: PendingNodes::new(base.node_data_len, base.next_node_id),
            base,
            records: 0,
            finished: false,
        })
    }

    /// Copies the latest generation into `target` through a bulk load.
    ///
    /// Every index record and every node table entry is carried over with
    /// its node id unchanged. Blocks replaced by earlier commits are not
    /// copied, so the target is as small as the live data allows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BulkLoadRejected`] if `target` already holds data,
    /// has a different index layout or is busy, and any read error from this
    /// store.
    pub fn compact_into(&self, target: &StoreConnection) -> Result<Generation> {
        if self.params.all_trees() != target.params.all_trees() {
            return Err(Error::BulkLoadRejected {
                reason: format!("{} has a different index layout", target.location),
            });
        }
        if target.generation() != Generation::default() {
            return Err(Error::BulkLoadRejected {
                reason: format!("{} is not empty", target.location),
            });
        }

        let mut txn = self.begin(TxnType::Read)?;
        let mut loader = target.bulk_loader()?;
        let mut nodes = 0u64;
        for record in txn.scan_file(ID_TREE, Range::all())? {
            let record = record?;
            let id = NodeId::from_bytes(&record.key)?;
            let offset = u64::from_be_bytes(record.value.as_slice().try_into().map_err(|_| {
                Error::Corrupted {
                    reason: format!("node {id}: offset is {} bytes", record.value.len()),
                }
            })?);
            let term = self.node_table.read_entry(offset)?;
            loader.allocate(&term, Some(id))?;
            nodes += 1;
        }
        for file_id in NODE_TREES..self.trees.len() {
            for record in txn.scan_file(file_id as FileId, Range::all())? {
                let record = record?;
                loader.insert_into(file_id as FileId, &record.key, &record.value)?;
            }
        }
        let records = loader.records;
        let generation = loader.finish()?;
        txn.end();

        tracing::info!(
            source = %self.location,
            target = %target.location,
            source_generation = txn.generation().raw(),
            nodes,
            records,
            "Compacted store"
        );
        Ok(generation)
    }
}

impl BulkLoader<'_> {
    /// Generation the load will publish.
    pub fn generation(&self) -> Generation {
        self.base.generation.next()
    }

    /// Records inserted so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Inserts or overwrites a record in `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownIndex`], [`Error::RecordSize`] or any block
    /// error.
    pub fn insert(&mut self, index: &str, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let file_id = self.conn.index_file(index)?;
        self.insert_into(file_id, key, value)
    }

    /// Returns the id of `term`, adding it to the node table if needed.
    ///
    /// # Errors
    ///
    /// Returns any tree or data file error.
    pub fn get_allocate_id(&mut self, term: &Term) -> Result<NodeId> {
        self.allocate(term, None)
    }

    /// Publishes everything loaded as one new generation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the data cannot be made durable; the
    /// connection then requires recovery.
    pub fn finish(mut self) -> Result<Generation> {
        self.publish()
    }

    fn insert_into(&mut self, file_id: FileId, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let f = file_id as usize;
        let view = DirectView::new(&self.conn.trees[f], self.generation().raw());
        let mut tree = BPlusTree::new(self.roots[f], view);
        let previous = tree.insert(key, value, DuplicatePolicy::Overwrite)?;
        self.roots[f] = tree.root();
        if previous.is_none() {
            self.records += 1;
        }
        Ok(previous)
    }

    fn allocate(&mut self, term: &Term, forced: Option<NodeId>) -> Result<NodeId> {
        let generation = self.generation().raw();
        let (hash, ids) = (HASH_TREE as usize, ID_TREE as usize);
        let mut hash_tree =
            BPlusTree::new(self.roots[hash], DirectView::new(&self.conn.trees[hash], generation));
        let mut id_tree =
            BPlusTree::new(self.roots[ids], DirectView::new(&self.conn.trees[ids], generation));
        let id = self.conn.node_table.allocate(
            &mut hash_tree,
            &mut id_tree,
            &mut self.nodes,
            term,
            forced,
            self.base.generation,
        )?;
        self.roots[hash] = hash_tree.root();
        self.roots[ids] = id_tree.root();

        if self.nodes.bytes().len() >= NODE_FLUSH_BYTES {
            self.flush_nodes()?;
        }
        Ok(id)
    }

    fn flush_nodes(&mut self) -> Result<()> {
        self.conn.node_table.append(self.nodes.base_offset(), self.nodes.bytes())?;
        self.nodes.flushed();
        Ok(())
    }

    fn publish(&mut self) -> Result<Generation> {
        self.finished = true;
        let result = self.write_state();
        self.conn.bulk_active.store(false, Ordering::SeqCst);
        if let Err(err) = &result {
            self.conn.recovery_required.store(true, Ordering::SeqCst);
            tracing::error!(
                location = %self.conn.location,
                error = %err,
                "Bulk load failed to publish; reopen the location"
            );
        }
        result
    }

    fn write_state(&mut self) -> Result<Generation> {
        self.flush_nodes()?;
        for storage in &self.conn.trees {
            storage.sync()?;
        }
        let state = CommittedState {
            generation: self.generation(),
            trees: self
                .roots
                .iter()
                .zip(&self.conn.trees)
                .map(|(&root, storage)| TreeRoot { root, total_blocks: storage.extent() })
                .collect(),
            node_data_len: self.nodes.end_offset(),
            next_node_id: self.nodes.next_index(),
        };
        self.conn.header.store(&state)?;
        let generation = state.generation;
        self.conn.committed.store(Arc::new(state));

        tracing::info!(
            location = %self.conn.location,
            generation = generation.raw(),
            records = self.records,
            nodes = self.nodes.next_index() - self.base.next_node_id,
            "Finished bulk load"
        );
        Ok(generation)
    }
}

impl Drop for BulkLoader<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(location = %self.conn.location, "Bulk loader dropped without finish");
            // Errors are logged by publish.
            let _ = self.publish();
        }
    }
}

impl std::fmt::Debug for BulkLoader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkLoader")
            .field("location", &self.conn.location)
            .field("generation", &self.generation())
            .field("records", &self.records)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{Location, LocationRegistry, StoreConfig};

    fn key(n: u64) -> Vec<u8> {
        let mut key = vec![0u8; 24];
        key[16..].copy_from_slice(&n.to_be_bytes());
        key
    }

    fn iri(n: u64) -> Term {
        Term::iri(format!("http://example.org/resource/{n}"))
    }

    #[test]
    fn test_load_publishes_one_generation() {
        let registry = LocationRegistry::new();
        let conn = registry.make(&Location::memory("bulk"), StoreConfig::default()).unwrap();

        let mut loader = conn.bulk_loader().unwrap();
        let mut ids = Vec::new();
        for n in 0..2_000 {
            ids.push(loader.get_allocate_id(&iri(n)).unwrap());
            loader.insert("SPO", &key(n), &[]).unwrap();
        }
        assert_eq!(loader.get_allocate_id(&iri(5)).unwrap(), ids[5]);
        assert_eq!(loader.records(), 2_000);
        assert_eq!(loader.finish().unwrap(), Generation(1));

        assert!(conn.journal.is_empty());
        let txn = conn.begin_read().unwrap();
        assert_eq!(txn.count("SPO").unwrap(), 2_000);
        assert_eq!(txn.get_term(ids[1_999]).unwrap(), Some(iri(1_999)));
        assert_eq!(txn.get_id(&iri(42)).unwrap(), Some(ids[42]));
        drop(txn);
        assert!(conn.verify().unwrap().is_ok());
    }

    #[test]
    fn test_loader_excludes_other_transactions() {
        let registry = LocationRegistry::new();
        let conn = registry.make(&Location::memory("exclusive"), StoreConfig::default()).unwrap();

        let reader = conn.begin_read().unwrap();
        assert!(matches!(conn.bulk_loader(), Err(Error::BulkLoadRejected { .. })));
        drop(reader);

        let loader = conn.bulk_loader().unwrap();
        assert!(matches!(conn.begin_read(), Err(Error::WriterActive)));
        assert!(matches!(conn.bulk_loader(), Err(Error::BulkLoadRejected { .. })));
        assert!(conn.stats().writer_active);
        drop(loader);

        assert_eq!(conn.generation(), Generation(1));
        assert!(conn.begin_read().is_ok());
    }

    #[test]
    fn test_compact_carries_ids_and_records() {
        let registry = LocationRegistry::new();
        let source = registry.make(&Location::memory("source"), StoreConfig::default()).unwrap();
        let mut ids = Vec::new();
        for round in 0..5u64 {
            let mut txn = source.begin_write().unwrap();
            for n in round * 100..(round + 1) * 100 {
                ids.push(txn.get_allocate_id(&iri(n)).unwrap());
                txn.insert("SPO", &key(n), &[]).unwrap();
                txn.insert("OSP", &key(n), &[]).unwrap();
            }
            for n in (0..(round + 1) * 100).step_by(3) {
                txn.delete("OSP", &key(n)).unwrap();
            }
            txn.commit().unwrap();
        }

        let target = registry.make(&Location::memory("target"), StoreConfig::default()).unwrap();
        assert_eq!(source.compact_into(&target).unwrap(), Generation(1));

        let (old, new) = (source.begin_read().unwrap(), target.begin_read().unwrap());
        for index in ["SPO", "POS", "OSP"] {
            let before: Vec<_> = old.scan(index, Range::all()).unwrap().map(|r| r.unwrap()).collect();
            let after: Vec<_> = new.scan(index, Range::all()).unwrap().map(|r| r.unwrap()).collect();
            assert_eq!(before, after, "index {index}");
        }
        for (n, id) in ids.iter().enumerate() {
            assert_eq!(new.get_id(&iri(n as u64)).unwrap(), Some(*id));
        }
        assert!(target.stats().trees[4].total_blocks <= source.stats().trees[4].total_blocks);

        // Fresh ids continue after the copied ones.
        drop(new);
        let mut txn = target.begin_write().unwrap();
        let fresh = txn.get_allocate_id(&Term::iri("http://example.org/new")).unwrap();
        assert_eq!(fresh.index(), Some(ids.len() as u64));
    }

    #[test]
    fn test_compact_rejects_unsuitable_target() {
        let registry = LocationRegistry::new();
        let source = registry.make(&Location::memory("src"), StoreConfig::default()).unwrap();
        let target = registry.make(&Location::memory("dst"), StoreConfig::default()).unwrap();
        let mut txn = target.begin_write().unwrap();
        txn.insert("SPO", &key(1), &[]).unwrap();
        txn.commit().unwrap();
        drop(txn);
        assert!(matches!(source.compact_into(&target), Err(Error::BulkLoadRejected { .. })));

        let params = crate::params::StoreParams::builder()
            .indexes(vec![crate::params::IndexSpec::new("other", 8, 0)])
            .build()
            .unwrap();
        let other = registry
            .make(&Location::memory("other"), StoreConfig::builder().params(params).build())
            .unwrap();
        assert!(matches!(source.compact_into(&other), Err(Error::BulkLoadRejected { .. })));
    }
}
