//! Simple free-list block allocator.
//!
//! A free list rather than a buddy allocator: all blocks in a file are the
//! same size, only the single writer allocates, and the list is rebuilt from
//! a reachability walk of the committed tree whenever a file is opened.

use parking_lot::Mutex;

use crate::error::BlockId;

/// Free-list based block allocator for one block file.
///
/// Blocks are allocated from the free list. When the free list is empty,
/// the file extent grows by one block.
pub struct BlockAllocator {
    /// Free blocks available for reuse.
    free_blocks: Mutex<Vec<BlockId>>,
    /// Next block id to allocate if the free list is empty.
    next_block: Mutex<BlockId>,
}

impl BlockAllocator {
    /// Creates a new allocator whose extent ends at `initial_next_block`.
    pub fn new(initial_next_block: BlockId) -> Self {
        Self { free_blocks: Mutex::new(Vec::new()), next_block: Mutex::new(initial_next_block) }
    }

    /// Allocates a block id, preferring freed ids over extending the file.
    pub fn allocate(&self) -> BlockId {
        if let Some(block_id) = self.free_blocks.lock().pop() {
            return block_id;
        }

        let mut next = self.next_block.lock();
        let block_id = *next;
        *next += 1;
        block_id
    }

    /// Frees a block for later reuse.
    pub fn free(&self, block_id: BlockId) {
        self.free_blocks.lock().push(block_id);
    }

    /// Frees multiple blocks at once.
    pub fn free_batch(&self, block_ids: &[BlockId]) {
        self.free_blocks.lock().extend_from_slice(block_ids);
    }

    /// Returns the number of block slots (the next id that would extend the file).
    pub fn total_blocks(&self) -> BlockId {
        *self.next_block.lock()
    }

    /// Sets the extent (used on open and after replay).
    pub fn set_total_blocks(&self, total: BlockId) {
        *self.next_block.lock() = total;
    }

    /// Returns the number of ids in the free list.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.lock().len()
    }

    /// Returns true if `block_id` is currently on the free list.
    pub fn is_free(&self, block_id: BlockId) -> bool {
        self.free_blocks.lock().contains(&block_id)
    }

    /// Replaces the free list (used when rebuilding on open).
    pub fn init_free_list(&self, free_blocks: Vec<BlockId>) {
        *self.free_blocks.lock() = free_blocks;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_extends_after_meta_block() {
        let allocator = BlockAllocator::new(1);

        assert_eq!(allocator.allocate(), 1);
        assert_eq!(allocator.allocate(), 2);
        assert_eq!(allocator.allocate(), 3);
        assert_eq!(allocator.total_blocks(), 4);
    }

    #[test]
    fn test_free_and_reuse() {
        let allocator = BlockAllocator::new(1);
        let _b1 = allocator.allocate();
        let b2 = allocator.allocate();
        let _b3 = allocator.allocate();

        allocator.free(b2);
        assert!(allocator.is_free(b2));
        assert_eq!(allocator.allocate(), b2);
        assert_eq!(allocator.allocate(), 4);
    }

    #[test]
    fn test_free_batch_is_lifo() {
        let allocator = BlockAllocator::new(1);
        for _ in 0..5 {
            allocator.allocate();
        }

        allocator.free_batch(&[2, 3, 4]);
        assert_eq!(allocator.free_block_count(), 3);

        assert_eq!(allocator.allocate(), 4);
        assert_eq!(allocator.allocate(), 3);
        assert_eq!(allocator.allocate(), 2);
        assert_eq!(allocator.allocate(), 6);
    }

    #[test]
    fn test_init_free_list_replaces_contents() {
        let allocator = BlockAllocator::new(10);
        allocator.free(9);
        allocator.init_free_list(vec![3, 5]);
        assert!(!allocator.is_free(9));
        assert_eq!(allocator.free_block_count(), 2);
    }
}
