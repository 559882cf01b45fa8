//! Per-file committed block storage.

use std::{collections::HashSet, io, sync::Arc};

use super::{Block, BlockAllocator, BlockCache, CacheStats};
use crate::{
    backend::StorageBackend,
    codec::{BranchPage, MetaPage, TreeLayout},
    error::{BlockId, BlockKind, Error, FileId, Result},
};

/// One block file: backend, shared committed-block cache and allocator.
///
/// Only committed block images live here. Uncommitted blocks are staged in
/// the writing transaction and reach this type at commit (or replay).
pub struct BlockStorage {
    file_id: FileId,
    backend: Arc<dyn StorageBackend>,
    block_size: usize,
    layout: TreeLayout,
    cache: BlockCache,
    allocator: BlockAllocator,
}

impl BlockStorage {
    /// Opens a block file, writing its meta block if the file is new.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMagic`], [`Error::UnsupportedVersion`] or
    /// [`Error::Corrupted`] if an existing file does not match `file_id`,
    /// `block_size` or the record layout.
    pub fn open(
        file_id: FileId,
        backend: Arc<dyn StorageBackend>,
        layout: TreeLayout,
        block_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let storage = Self {
            file_id,
            backend,
            block_size,
            layout,
            cache: BlockCache::new(cache_capacity),
            allocator: BlockAllocator::new(1),
        };

        if storage.backend.is_empty()? {
            let mut meta_block = Block::new(0, block_size, BlockKind::Meta, 0);
            MetaPage::new(file_id, block_size, &layout).encode(&mut meta_block)?;
            meta_block.update_checksum();
            storage.backend.write_at(0, &meta_block.data)?;
            storage.backend.sync()?;
        } else {
            storage.check_meta()?;
        }
        Ok(storage)
    }

    fn check_meta(&self) -> Result<()> {
        let mut data = vec![0u8; self.block_size];
        self.backend.read_exact_at(0, &mut data)?;
        let block = Block::from_bytes(0, data);
        if block.kind().ok() != Some(BlockKind::Meta) || !block.verify_checksum() {
            return Err(Error::InvalidMagic { file: self.backend.name().to_string() });
        }

        let meta = MetaPage::decode(&block, self.backend.name())?;
        if meta.block_size as usize != self.block_size
            || meta.file_id != self.file_id
            || meta.key_len as usize != self.layout.key_len
            || meta.value_len as usize != self.layout.value_len
        {
            return Err(Error::Corrupted {
                reason: format!(
                    "{}: meta block {meta:?} does not match file {} with block size {} and records {}+{}",
                    self.backend.name(),
                    self.file_id,
                    self.block_size,
                    self.layout.key_len,
                    self.layout.value_len
                ),
            });
        }
        Ok(())
    }

    /// Position of this file in the store's tree list.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Backing file name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Record layout and node capacities of the tree in this file.
    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    /// The file's allocator.
    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Number of block slots, including the meta block.
    pub fn extent(&self) -> u64 {
        self.allocator.total_blocks()
    }

    /// Cache counters for this file.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Reads a committed block, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlockId`] for the meta block, ids past the
    /// extent and ids allocated by a writer but not yet written, and
    /// [`Error::BlockChecksumMismatch`] for damaged blocks.
    pub fn read_committed(&self, block_id: BlockId) -> Result<Block> {
        let extent = self.extent();
        if block_id == 0 || block_id >= extent {
            return Err(Error::InvalidBlockId { file_id: self.file_id, block_id, extent });
        }
        if let Some(block) = self.cache.get(block_id) {
            return Ok(block);
        }

        let mut data = vec![0u8; self.block_size];
        match self.backend.read_exact_at(block_id * self.block_size as u64, &mut data) {
            Ok(()) => {},
            Err(Error::Io { source }) if source.kind() == io::ErrorKind::UnexpectedEof => {
                // The allocator hands out slots past the end of the file.
                let written = self.backend.len()? / self.block_size as u64;
                return Err(Error::InvalidBlockId {
                    file_id: self.file_id,
                    block_id,
                    extent: written,
                });
            },
            Err(err) => return Err(err),
        }
        let block = Block::from_bytes(block_id, data);
        if !block.verify_checksum() {
            return Err(Error::BlockChecksumMismatch { file_id: self.file_id, block_id });
        }
        self.cache.insert(block.clone());
        Ok(block)
    }

    /// Writes a block image to its slot and refreshes the cache.
    ///
    /// The caller must have called [`Block::update_checksum`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write fails.
    pub fn write_committed(&self, block: &Block) -> Result<()> {
        if block.id == 0 {
            return Err(Error::InvalidBlockId {
                file_id: self.file_id,
                block_id: 0,
                extent: self.extent(),
            });
        }
        self.backend.write_at(block.id * self.block_size as u64, &block.data)?;
        if block.id >= self.extent() {
            self.allocator.set_total_blocks(block.id + 1);
        }
        self.cache.insert(block.clone());
        Ok(())
    }

    /// Drops a block from the cache (used when a block is freed in place).
    pub fn evict(&self, block_id: BlockId) {
        self.cache.remove(block_id);
    }

    /// Flushes the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    /// Returns true if `block_id` is inside the extent and not on the free list.
    pub fn valid(&self, block_id: BlockId) -> bool {
        block_id != 0 && block_id < self.extent() && !self.allocator.is_free(block_id)
    }

    /// Resets the extent and rebuilds the free list from the committed tree.
    ///
    /// Every block slot not reachable from `root` becomes free, which also
    /// reclaims blocks left pending by readers of a previous process.
    ///
    /// # Errors
    ///
    /// Returns an error if a reachable block cannot be read or decoded.
    pub fn restore(&self, root: BlockId, total_blocks: u64) -> Result<()> {
        self.cache.clear();
        self.allocator.set_total_blocks(total_blocks.max(1));

        let reachable: HashSet<BlockId> = self.reachable(root)?.into_iter().collect();
        let free: Vec<BlockId> =
            (1..self.extent()).rev().filter(|id| !reachable.contains(id)).collect();
        tracing::debug!(
            file = self.name(),
            extent = self.extent(),
            reachable = reachable.len(),
            free = free.len(),
            "Rebuilt free list"
        );
        self.allocator.init_free_list(free);
        Ok(())
    }

    /// Every block reachable from `root`, in depth-first order.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read or decoded, or if a block
    /// is referenced twice.
    pub fn reachable(&self, root: BlockId) -> Result<Vec<BlockId>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        if root == 0 {
            return Ok(order);
        }

        let mut stack = vec![root];
        while let Some(block_id) = stack.pop() {
            if !seen.insert(block_id) {
                return Err(Error::Corrupted {
                    reason: format!("{}: block {block_id} referenced twice", self.name()),
                });
            }
            order.push(block_id);
            let block = self.read_committed(block_id)?;
            if block.kind()? == BlockKind::Branch {
                let branch = BranchPage::decode(&block, &self.layout)?;
                stack.extend(branch.children.iter().rev());
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        backend::InMemoryBackend,
        codec::{LeafPage, Record},
    };

    fn layout() -> TreeLayout {
        TreeLayout::new(8, 0, 512)
    }

    fn open(backend: &Arc<InMemoryBackend>) -> Result<BlockStorage> {
        BlockStorage::open(2, Arc::clone(backend) as Arc<dyn StorageBackend>, layout(), 512, 8)
    }

    fn leaf_block(id: BlockId, keys: &[u64]) -> Block {
        let mut block = Block::new(id, 512, BlockKind::Leaf, 1);
        LeafPage { id, records: keys.iter().map(|k| Record::new(k.to_be_bytes(), Vec::new())).collect() }
            .encode(&mut block, &layout())
            .unwrap();
        block.update_checksum();
        block
    }

    #[test]
    fn test_new_file_gets_meta_block() {
        let backend = Arc::new(InMemoryBackend::new("SPO.bpt"));
        let storage = open(&backend).unwrap();
        assert_eq!(backend.len().unwrap(), 512);
        assert_eq!(storage.extent(), 1);

        // Reopen validates the meta block.
        drop(storage);
        assert!(open(&backend).is_ok());
    }

    #[test]
    fn test_reopen_with_other_layout_fails() {
        let backend = Arc::new(InMemoryBackend::new("SPO.bpt"));
        open(&backend).unwrap();
        let other = BlockStorage::open(
            2,
            Arc::clone(&backend) as Arc<dyn StorageBackend>,
            TreeLayout::new(16, 0, 512),
            512,
            8,
        );
        assert!(matches!(other, Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_foreign_file_rejected() {
        let backend = Arc::new(InMemoryBackend::new("junk.bpt"));
        backend.write_at(0, &[0xAA; 512]).unwrap();
        assert!(matches!(open(&backend), Err(Error::InvalidMagic { .. })));
    }

    #[test]
    fn test_out_of_range_block_id() {
        let backend = Arc::new(InMemoryBackend::new("SPO.bpt"));
        let storage = open(&backend).unwrap();

        assert!(matches!(
            storage.read_committed(0),
            Err(Error::InvalidBlockId { block_id: 0, .. })
        ));
        assert!(matches!(
            storage.read_committed(5),
            Err(Error::InvalidBlockId { block_id: 5, extent: 1, .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let backend = Arc::new(InMemoryBackend::new("SPO.bpt"));
        let storage = open(&backend).unwrap();
        storage.write_committed(&leaf_block(1, &[1, 2, 3])).unwrap();

        // Fresh storage so the read misses the cache.
        drop(storage);
        backend.corrupt(512 + 40, &[0xFF]);
        let storage = open(&backend).unwrap();
        storage.allocator().set_total_blocks(2);
        assert!(matches!(
            storage.read_committed(1),
            Err(Error::BlockChecksumMismatch { file_id: 2, block_id: 1 })
        ));
    }

    #[test]
    fn test_restore_frees_unreachable_blocks() {
        let backend = Arc::new(InMemoryBackend::new("SPO.bpt"));
        let storage = open(&backend).unwrap();

        let left = leaf_block(1, &[1, 2]);
        let right = leaf_block(2, &[5, 6]);
        let orphan = leaf_block(3, &[9]);
        let mut root = Block::new(4, 512, BlockKind::Branch, 1);
        BranchPage { id: 4, keys: vec![5u64.to_be_bytes().to_vec()], children: vec![1, 2] }
            .encode(&mut root, &layout())
            .unwrap();
        root.update_checksum();
        for block in [&left, &right, &orphan, &root] {
            storage.write_committed(block).unwrap();
        }

        storage.restore(4, 6).unwrap();
        assert_eq!(storage.reachable(4).unwrap(), vec![4, 1, 2]);
        assert!(storage.valid(1));
        assert!(!storage.valid(3));
        assert!(!storage.valid(5));
        assert_eq!(storage.allocator().free_block_count(), 2);
        assert_eq!(storage.allocator().allocate(), 3);
    }
}
