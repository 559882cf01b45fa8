//! Block access traits and the views that implement them.
//!
//! The B+ tree never touches [`BlockStorage`] directly. It goes through:
//! - [`BlockRead`]: read-only providers for read transactions
//! - [`BlockMgr`]: read-write providers for write transactions and bulk loads
//!
//! Three views exist:
//! - [`ReadView`]: committed blocks, optionally overlaid with a writer's staging
//! - [`TxnView`]: copy-on-write staging for one write transaction
//! - [`DirectView`]: in-place writes used only by the bulk loader

use std::collections::{BTreeMap, HashSet};

use super::{Block, BlockStorage};
use crate::{
    codec::TreeLayout,
    error::{BlockId, BlockKind, Error, Result},
};

/// Read access to the blocks of one tree.
pub trait BlockRead {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Record layout and node capacities.
    fn layout(&self) -> &TreeLayout;

    /// Returns the block as visible to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlockId`] for ids outside the file and
    /// [`Error::BlockChecksumMismatch`] for damaged blocks.
    fn get_read(&self, block_id: BlockId) -> Result<Block>;

    /// Returns true if `block_id` names a live block.
    fn valid(&self, block_id: BlockId) -> bool;
}

/// Read-write access to the blocks of one tree.
pub trait BlockMgr: BlockRead {
    /// Generation stamped into every block this provider writes.
    fn generation(&self) -> u64;

    /// Allocates a fresh block of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] for read-only providers.
    fn allocate(&mut self, kind: BlockKind) -> Result<Block>;

    /// Returns a mutable image of `block_id`.
    ///
    /// The returned block may carry a different id than requested if the
    /// original is still visible to readers; callers must re-point parents
    /// at the returned id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] for read-only providers, or any read error.
    fn get_write(&mut self, block_id: BlockId) -> Result<Block>;

    /// Stages (or persists) a block obtained from `allocate`/`get_write`/`promote`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the block was not obtained for writing.
    fn write(&mut self, block: Block) -> Result<()>;

    /// Releases a block for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] for read-only providers.
    fn free(&mut self, block_id: BlockId) -> Result<()>;

    /// Copies `block` into a newly allocated slot, leaving the original intact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] for read-only providers.
    fn promote(&mut self, block: &Block) -> Result<Block>;
}

impl<T: BlockRead + ?Sized> BlockRead for &T {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn layout(&self) -> &TreeLayout {
        (**self).layout()
    }

    fn get_read(&self, block_id: BlockId) -> Result<Block> {
        (**self).get_read(block_id)
    }

    fn valid(&self, block_id: BlockId) -> bool {
        (**self).valid(block_id)
    }
}

impl<T: BlockRead + ?Sized> BlockRead for &mut T {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn layout(&self) -> &TreeLayout {
        (**self).layout()
    }

    fn get_read(&self, block_id: BlockId) -> Result<Block> {
        (**self).get_read(block_id)
    }

    fn valid(&self, block_id: BlockId) -> bool {
        (**self).valid(block_id)
    }
}

impl<T: BlockMgr + ?Sized> BlockMgr for &mut T {
    fn generation(&self) -> u64 {
        (**self).generation()
    }

    fn allocate(&mut self, kind: BlockKind) -> Result<Block> {
        (**self).allocate(kind)
    }

    fn get_write(&mut self, block_id: BlockId) -> Result<Block> {
        (**self).get_write(block_id)
    }

    fn write(&mut self, block: Block) -> Result<()> {
        (**self).write(block)
    }

    fn free(&mut self, block_id: BlockId) -> Result<()> {
        (**self).free(block_id)
    }

    fn promote(&mut self, block: &Block) -> Result<Block> {
        (**self).promote(block)
    }
}

/// Uncommitted block changes of one write transaction against one file.
#[derive(Debug, Default)]
pub struct FileStaging {
    /// Block images written by the transaction, in id order.
    staged: BTreeMap<BlockId, Block>,
    /// Ids allocated by the transaction (invisible to every reader).
    fresh: HashSet<BlockId>,
    /// Committed ids replaced or freed by the transaction.
    to_free: Vec<BlockId>,
}

impl FileStaging {
    /// Returns true if the transaction changed nothing in this file.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.to_free.is_empty()
    }

    /// Staged block images in id order.
    pub fn staged_blocks(&self) -> impl Iterator<Item = &Block> {
        self.staged.values()
    }

    /// Committed ids to free once no reader can see them.
    pub fn deferred_frees(&self) -> &[BlockId] {
        &self.to_free
    }

    /// Returns every id this transaction allocated to the allocator.
    ///
    /// Called on abort: fresh blocks were never visible to anyone.
    pub fn discard(self, storage: &BlockStorage) {
        let fresh: Vec<BlockId> = self.fresh.into_iter().collect();
        storage.allocator().free_batch(&fresh);
    }

    fn get(&self, block_id: BlockId) -> Option<&Block> {
        self.staged.get(&block_id)
    }
}

/// Read-only view over committed blocks, optionally seeing a writer's staging.
pub struct ReadView<'a> {
    storage: &'a BlockStorage,
    staging: Option<&'a FileStaging>,
}

impl<'a> ReadView<'a> {
    /// View of committed blocks only.
    pub fn committed(storage: &'a BlockStorage) -> Self {
        Self { storage, staging: None }
    }

    /// View that sees the given staging first (read-your-own-writes).
    pub fn staged(storage: &'a BlockStorage, staging: &'a FileStaging) -> Self {
        Self { storage, staging: Some(staging) }
    }
}

impl BlockRead for ReadView<'_> {
    fn block_size(&self) -> usize {
        self.storage.block_size()
    }

    fn layout(&self) -> &TreeLayout {
        self.storage.layout()
    }

    fn get_read(&self, block_id: BlockId) -> Result<Block> {
        if let Some(block) = self.staging.and_then(|s| s.get(block_id)) {
            return Ok(block.clone());
        }
        self.storage.read_committed(block_id)
    }

    fn valid(&self, block_id: BlockId) -> bool {
        self.staging.is_some_and(|s| s.staged.contains_key(&block_id))
            || self.storage.valid(block_id)
    }
}

impl BlockMgr for ReadView<'_> {
    fn generation(&self) -> u64 {
        0
    }

    fn allocate(&mut self, _kind: BlockKind) -> Result<Block> {
        Err(Error::ReadOnly)
    }

    fn get_write(&mut self, _block_id: BlockId) -> Result<Block> {
        Err(Error::ReadOnly)
    }

    fn write(&mut self, _block: Block) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn free(&mut self, _block_id: BlockId) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn promote(&mut self, _block: &Block) -> Result<Block> {
        Err(Error::ReadOnly)
    }
}

/// Copy-on-write view for one write transaction.
///
/// Committed blocks are never modified: `get_write` copies them to a fresh
/// id and schedules the original for a deferred free. Fresh blocks are
/// rewritten in place and freed immediately.
pub struct TxnView<'a> {
    storage: &'a BlockStorage,
    staging: &'a mut FileStaging,
    generation: u64,
}

impl<'a> TxnView<'a> {
    /// Creates a view writing toward `generation`.
    pub fn new(storage: &'a BlockStorage, staging: &'a mut FileStaging, generation: u64) -> Self {
        Self { storage, staging, generation }
    }

    fn allocate_id(&mut self) -> BlockId {
        let block_id = self.storage.allocator().allocate();
        self.staging.fresh.insert(block_id);
        block_id
    }
}

impl BlockRead for TxnView<'_> {
    fn block_size(&self) -> usize {
        self.storage.block_size()
    }

    fn layout(&self) -> &TreeLayout {
        self.storage.layout()
    }

    fn get_read(&self, block_id: BlockId) -> Result<Block> {
        if let Some(block) = self.staging.get(block_id) {
            return Ok(block.clone());
        }
        self.storage.read_committed(block_id)
    }

    fn valid(&self, block_id: BlockId) -> bool {
        self.staging.staged.contains_key(&block_id)
            || (self.storage.valid(block_id) && !self.staging.to_free.contains(&block_id))
    }
}

impl BlockMgr for TxnView<'_> {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn allocate(&mut self, kind: BlockKind) -> Result<Block> {
        let block_id = self.allocate_id();
        Ok(Block::new(block_id, self.storage.block_size(), kind, self.generation))
    }

    fn get_write(&mut self, block_id: BlockId) -> Result<Block> {
        if self.staging.fresh.contains(&block_id) {
            let mut block = self.staging.get(block_id).cloned().ok_or_else(|| Error::Corrupted {
                reason: format!("fresh block {block_id} was never written"),
            })?;
            block.modified = true;
            return Ok(block);
        }

        let committed = self.storage.read_committed(block_id)?;
        let copy = self.promote(&committed)?;
        self.staging.to_free.push(block_id);
        Ok(copy)
    }

    fn write(&mut self, mut block: Block) -> Result<()> {
        if !self.staging.fresh.contains(&block.id) {
            return Err(Error::Corrupted {
                reason: format!("block {} written without copy-on-write", block.id),
            });
        }
        block.update_checksum();
        self.staging.staged.insert(block.id, block);
        Ok(())
    }

    fn free(&mut self, block_id: BlockId) -> Result<()> {
        if self.staging.fresh.remove(&block_id) {
            self.staging.staged.remove(&block_id);
            self.storage.allocator().free(block_id);
        } else {
            self.staging.to_free.push(block_id);
        }
        Ok(())
    }

    fn promote(&mut self, block: &Block) -> Result<Block> {
        let block_id = self.allocate_id();
        let mut copy = Block { id: block_id, data: block.data.clone(), modified: true };
        copy.set_generation(self.generation);
        Ok(copy)
    }
}

/// In-place view used by the bulk loader.
///
/// Writes go straight to the block file; nothing is journaled and nothing is
/// copied, so it is only sound while no other transaction is active.
pub struct DirectView<'a> {
    storage: &'a BlockStorage,
    generation: u64,
}

impl<'a> DirectView<'a> {
    /// Creates a view writing toward `generation`.
    pub fn new(storage: &'a BlockStorage, generation: u64) -> Self {
        Self { storage, generation }
    }
}

impl BlockRead for DirectView<'_> {
    fn block_size(&self) -> usize {
        self.storage.block_size()
    }

    fn layout(&self) -> &TreeLayout {
        self.storage.layout()
    }

    fn get_read(&self, block_id: BlockId) -> Result<Block> {
        self.storage.read_committed(block_id)
    }

    fn valid(&self, block_id: BlockId) -> bool {
        self.storage.valid(block_id)
    }
}

impl BlockMgr for DirectView<'_> {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn allocate(&mut self, kind: BlockKind) -> Result<Block> {
        let block_id = self.storage.allocator().allocate();
        Ok(Block::new(block_id, self.storage.block_size(), kind, self.generation))
    }

    fn get_write(&mut self, block_id: BlockId) -> Result<Block> {
        let mut block = self.storage.read_committed(block_id)?;
        block.set_generation(self.generation);
        Ok(block)
    }

    fn write(&mut self, mut block: Block) -> Result<()> {
        block.update_checksum();
        self.storage.write_committed(&block)
    }

    fn free(&mut self, block_id: BlockId) -> Result<()> {
        self.storage.evict(block_id);
        self.storage.allocator().free(block_id);
        Ok(())
    }

    fn promote(&mut self, block: &Block) -> Result<Block> {
        let block_id = self.storage.allocator().allocate();
        let mut copy = Block { id: block_id, data: block.data.clone(), modified: true };
        copy.set_generation(self.generation);
        Ok(copy)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{InMemoryBackend, StorageBackend};

    fn storage() -> BlockStorage {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new("t.bpt"));
        BlockStorage::open(0, backend, TreeLayout::new(8, 0, 512), 512, 16).unwrap()
    }

    fn commit(storage: &BlockStorage, staging: FileStaging) {
        for block in staging.staged_blocks() {
            storage.write_committed(block).unwrap();
        }
    }

    #[test]
    fn test_get_write_copies_committed_block() {
        let storage = storage();
        let mut staging = FileStaging::default();
        let original = {
            let mut view = TxnView::new(&storage, &mut staging, 1);
            let mut block = view.allocate(BlockKind::Leaf).unwrap();
            block.content_mut()[0] = 1;
            let id = block.id;
            view.write(block).unwrap();
            id
        };
        commit(&storage, staging);

        let mut staging = FileStaging::default();
        let mut view = TxnView::new(&storage, &mut staging, 2);
        let mut copy = view.get_write(original).unwrap();
        assert_ne!(copy.id, original, "committed blocks are copied");
        assert_eq!(copy.generation(), 2);
        copy.content_mut()[0] = 2;
        let copy_id = copy.id;
        view.write(copy).unwrap();

        // The committed image is untouched for readers.
        assert_eq!(storage.read_committed(original).unwrap().content()[0], 1);
        assert_eq!(view.get_read(copy_id).unwrap().content()[0], 2);
        assert!(!view.valid(original));
        assert_eq!(staging.deferred_frees(), &[original]);
    }

    #[test]
    fn test_fresh_blocks_rewrite_in_place() {
        let storage = storage();
        let mut staging = FileStaging::default();
        let mut view = TxnView::new(&storage, &mut staging, 1);

        let block = view.allocate(BlockKind::Leaf).unwrap();
        let id = block.id;
        view.write(block).unwrap();
        let again = view.get_write(id).unwrap();
        assert_eq!(again.id, id);
    }

    #[test]
    fn test_free_of_fresh_block_is_immediate() {
        let storage = storage();
        let mut staging = FileStaging::default();
        let mut view = TxnView::new(&storage, &mut staging, 1);

        let block = view.allocate(BlockKind::Leaf).unwrap();
        let id = block.id;
        view.write(block).unwrap();
        view.free(id).unwrap();

        assert!(staging.is_empty());
        assert!(storage.allocator().is_free(id));
    }

    #[test]
    fn test_write_without_cow_rejected() {
        let storage = storage();
        let mut staging = FileStaging::default();
        let mut view = TxnView::new(&storage, &mut staging, 1);
        let stray = Block::new(1, 512, BlockKind::Leaf, 1);
        assert!(matches!(view.write(stray), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_discard_returns_fresh_ids() {
        let storage = storage();
        let mut staging = FileStaging::default();
        {
            let mut view = TxnView::new(&storage, &mut staging, 1);
            for _ in 0..3 {
                let block = view.allocate(BlockKind::Leaf).unwrap();
                view.write(block).unwrap();
            }
        }
        staging.discard(&storage);
        assert_eq!(storage.allocator().free_block_count(), 3);
    }

    #[test]
    fn test_read_view_is_read_only() {
        let storage = storage();
        let mut view = ReadView::committed(&storage);
        assert!(matches!(view.allocate(BlockKind::Leaf), Err(Error::ReadOnly)));
        assert!(matches!(view.free(1), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_read_view_sees_staging() {
        let storage = storage();
        let mut staging = FileStaging::default();
        let id = {
            let mut view = TxnView::new(&storage, &mut staging, 1);
            let block = view.allocate(BlockKind::Leaf).unwrap();
            let id = block.id;
            view.write(block).unwrap();
            id
        };

        assert!(ReadView::staged(&storage, &staging).get_read(id).is_ok());
        // Allocated but never committed: past the written file, so unreadable.
        assert!(matches!(
            ReadView::committed(&storage).get_read(id),
            Err(Error::InvalidBlockId { block_id, extent: 1, .. }) if block_id == id
        ));
    }

    #[test]
    fn test_direct_view_writes_in_place() {
        let storage = storage();
        let mut view = DirectView::new(&storage, 1);
        let mut block = view.allocate(BlockKind::Leaf).unwrap();
        block.content_mut()[3] = 9;
        let id = block.id;
        view.write(block).unwrap();

        let again = view.get_write(id).unwrap();
        assert_eq!(again.id, id);
        assert_eq!(storage.read_committed(id).unwrap().content()[3], 9);
    }
}
