//! Node table: terms to compact [`NodeId`]s and back.
//!
//! Three structures back the table:
//! - the node hash tree (file 0): XXH3-128 of the encoded term to node id
//! - the node id tree (file 1): node id to byte offset in the data file
//! - `nodes.dat`: append-only `varint(len) ‖ encoded term` entries
//!
//! A write transaction collects new terms in [`PendingNodes`]; its bytes are
//! appended to the data file at the committed end during commit, and the
//! terms move into the shared cache only once the commit has published.

mod nodeid;
mod term;

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use lru::LruCache;
pub use nodeid::{MAX_INLINE_STRING, NodeId};
use parking_lot::Mutex;
pub use term::Term;
use term::{read_varint, write_varint};

use crate::{
    backend::StorageBackend,
    block::{BlockMgr, BlockRead},
    btree::{BPlusTree, DuplicatePolicy},
    error::{Error, Result},
    txn::Generation,
};

/// Longest varint prefix of a data file entry.
const MAX_VARINT_LEN: usize = 10;

/// Hash key of a term in the node hash tree.
pub fn term_hash(term: &Term) -> [u8; 16] {
    xxhash_rust::xxh3::xxh3_128(&term.encode()).to_be_bytes()
}

/// Terms allocated by one writer and not yet committed.
#[derive(Debug, Default)]
pub struct PendingNodes {
    /// Data file offset at which `bytes` will be appended.
    base_offset: u64,
    /// Next sequential table index.
    next_index: u64,
    bytes: Vec<u8>,
    by_term: HashMap<Term, NodeId>,
    by_id: HashMap<NodeId, Term>,
}

impl PendingNodes {
    /// Starts a batch on top of a committed data file length and index counter.
    pub fn new(base_offset: u64, next_index: u64) -> Self {
        Self { base_offset, next_index, ..Self::default() }
    }

    /// Returns true if no term was allocated.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of terms allocated.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Encoded entries to append.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Offset where the pending bytes start.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Data file length once the pending bytes are appended.
    pub fn end_offset(&self) -> u64 {
        self.base_offset + self.bytes.len() as u64
    }

    /// Table index the next allocation will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn get_id(&self, term: &Term) -> Option<NodeId> {
        self.by_term.get(term).copied()
    }

    fn get_term(&self, id: NodeId) -> Option<&Term> {
        self.by_id.get(&id)
    }

    /// Marks the pending bytes as written and forgets the pending terms.
    ///
    /// The trees already hold the terms, so lookups keep working through the
    /// data file.
    pub(crate) fn flushed(&mut self) {
        self.base_offset = self.end_offset();
        self.bytes.clear();
        self.by_term.clear();
        self.by_id.clear();
    }
}

struct NodeCache {
    by_id: LruCache<NodeId, (Term, Generation)>,
    by_term: LruCache<Term, (NodeId, Generation)>,
}

/// Shared, generation-aware access to the node data file and term cache.
///
/// The trees are passed in by the caller so that each transaction looks
/// terms up through its own view (committed, staged or direct).
pub struct NodeTable {
    data: Arc<dyn StorageBackend>,
    cache: Mutex<NodeCache>,
}

impl NodeTable {
    /// Creates a node table over a data file with an LRU of `cache_size` terms.
    pub fn new(data: Arc<dyn StorageBackend>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            data,
            cache: Mutex::new(NodeCache {
                by_id: LruCache::new(capacity),
                by_term: LruCache::new(capacity),
            }),
        }
    }

    /// Current length of the data file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the metadata query fails.
    pub fn data_len(&self) -> Result<u64> {
        self.data.len()
    }

    /// Drops bytes past the committed end left by a commit that never published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be resized.
    pub fn truncate_to(&self, committed_len: u64) -> Result<()> {
        let len = self.data.len()?;
        if len > committed_len {
            tracing::debug!(
                file = self.data.name(),
                committed_len,
                discarded = len - committed_len,
                "Discarding uncommitted node data"
            );
            self.data.set_len(committed_len)?;
            self.data.sync()?;
        } else if len < committed_len {
            return Err(Error::Corrupted {
                reason: format!(
                    "{}: {len} bytes but the committed state records {committed_len}",
                    self.data.name()
                ),
            });
        }
        Ok(())
    }

    /// Writes `bytes` at `offset` and syncs the data file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write or sync fails.
    pub fn append(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.data.write_at(offset, bytes)?;
        self.data.sync()
    }

    /// Reads and decodes the entry at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the entry is truncated or does not decode.
    pub fn read_entry(&self, offset: u64) -> Result<Term> {
        let mut prefix = [0u8; MAX_VARINT_LEN];
        let read = self.data.read_at(offset, &mut prefix)?;
        let mut pos = 0;
        let len = read_varint(&prefix[..read], &mut pos)? as usize;

        let mut bytes = vec![0u8; len];
        self.data.read_exact_at(offset + pos as u64, &mut bytes).map_err(|_| Error::Corrupted {
            reason: format!("{}: entry at {offset} is truncated", self.data.name()),
        })?;
        Term::decode(&bytes)
    }

    /// Moves a committed batch into the cache, tagged with its generation.
    pub fn publish(&self, pending: &PendingNodes, generation: Generation) {
        if pending.by_id.is_empty() {
            return;
        }
        let mut cache = self.cache.lock();
        for (id, term) in &pending.by_id {
            cache.by_id.put(*id, (term.clone(), generation));
            cache.by_term.put(term.clone(), (*id, generation));
        }
    }

    /// Looks up the id of `term` without allocating.
    ///
    /// `visible` is the caller's snapshot: cached entries committed after it
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash tree cannot be read.
    pub fn find_id<P: BlockRead>(
        &self,
        hash_tree: &BPlusTree<P>,
        pending: Option<&PendingNodes>,
        term: &Term,
        visible: Generation,
    ) -> Result<Option<NodeId>> {
        if let Some(id) = NodeId::inline(term) {
            return Ok(Some(id));
        }
        if let Some(id) = pending.and_then(|p| p.get_id(term)) {
            return Ok(Some(id));
        }
        let cached = self.cache.lock().by_term.get(term).copied();
        if let Some((id, committed)) = cached {
            if committed <= visible {
                return Ok(Some(id));
            }
        }

        let Some(value) = hash_tree.find(&term_hash(term))? else {
            return Ok(None);
        };
        let id = NodeId::from_bytes(&value)?;
        self.cache.lock().by_term.put(term.clone(), (id, visible));
        Ok(Some(id))
    }

    /// Resolves `id` to its term.
    ///
    /// # Errors
    ///
    /// Returns an error if the id tree or data file cannot be read, or the
    /// entry does not decode.
    pub fn find_term<P: BlockRead>(
        &self,
        id_tree: &BPlusTree<P>,
        pending: Option<&PendingNodes>,
        id: NodeId,
        visible: Generation,
    ) -> Result<Option<Term>> {
        if id.is_inline() {
            return Ok(id.decode_inline());
        }
        if let Some(term) = pending.and_then(|p| p.get_term(id)) {
            return Ok(Some(term.clone()));
        }
        let cached = self.cache.lock().by_id.get(&id).cloned();
        if let Some((term, committed)) = cached {
            if committed <= visible {
                return Ok(Some(term));
            }
        }

        let Some(value) = id_tree.find(&id.to_bytes())? else {
            return Ok(None);
        };
        let offset = u64::from_be_bytes(value.as_slice().try_into().map_err(|_| {
            Error::Corrupted { reason: format!("node {id}: offset is {} bytes", value.len()) }
        })?);
        let term = self.read_entry(offset)?;
        self.cache.lock().by_id.put(id, (term.clone(), visible));
        Ok(Some(term))
    }

    /// Returns the id of `term`, allocating a table entry if it is new.
    ///
    /// `forced` assigns a specific table id instead of the next sequential
    /// one; compaction uses it to carry ids over unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] through read-only tree providers, or any
    /// tree error.
    pub fn allocate<H: BlockMgr, I: BlockMgr>(
        &self,
        hash_tree: &mut BPlusTree<H>,
        id_tree: &mut BPlusTree<I>,
        pending: &mut PendingNodes,
        term: &Term,
        forced: Option<NodeId>,
        visible: Generation,
    ) -> Result<NodeId> {
        if let Some(id) = self.find_id(hash_tree, Some(pending), term, visible)? {
            return Ok(id);
        }

        let id = match forced.and_then(|id| id.index()) {
            Some(index) => {
                pending.next_index = pending.next_index.max(index + 1);
                NodeId::table(index)?
            },
            None => {
                let id = NodeId::table(pending.next_index)?;
                pending.next_index += 1;
                id
            },
        };
        let offset = pending.end_offset();
        let encoded = term.encode();

        hash_tree.insert(&term_hash(term), &id.to_bytes(), DuplicatePolicy::Reject)?;
        id_tree.insert(&id.to_bytes(), &offset.to_be_bytes(), DuplicatePolicy::Reject)?;

        write_varint(&mut pending.bytes, encoded.len() as u64);
        pending.bytes.extend_from_slice(&encoded);
        pending.by_term.insert(term.clone(), id);
        pending.by_id.insert(id, term.clone());
        Ok(id)
    }
}
