//! Committed-block cache.
//!
//! Holds read-only images of committed blocks, shared by every transaction
//! on a file. Uses clock eviction (approximate LRU) for low overhead.
//!
//! A block id only changes content after every reader that could see the old
//! content has ended, and the committing writer replaces the cached image in
//! the same step that writes the file, so no entry is ever stale for a reader.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;

use super::Block;
use crate::error::BlockId;

/// Block cache with clock eviction.
pub struct BlockCache {
    /// Cached blocks.
    blocks: RwLock<HashMap<BlockId, CacheEntry>>,
    /// Maximum number of blocks to cache.
    capacity: usize,
    /// Clock hand for eviction.
    clock_hand: RwLock<usize>,
    /// Insertion order of blocks for the clock sweep.
    block_order: RwLock<Vec<BlockId>>,
    /// Total cache hits since creation.
    hits: AtomicU64,
    /// Total cache misses since creation.
    misses: AtomicU64,
}

/// Cache entry with access tracking.
struct CacheEntry {
    /// The cached block.
    block: Block,
    /// Whether the block was accessed since the last clock sweep (second chance).
    accessed: bool,
}

impl BlockCache {
    /// Creates a new cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            blocks: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
            clock_hand: RwLock::new(0),
            block_order: RwLock::new(Vec::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the cached block, or `None` if not present.
    pub fn get(&self, block_id: BlockId) -> Option<Block> {
        let mut blocks = self.blocks.write();
        if let Some(entry) = blocks.get_mut(&block_id) {
            entry.accessed = true;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.block.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Inserts or replaces a committed block image, evicting one entry if full.
    pub fn insert(&self, mut block: Block) {
        block.modified = false;
        let block_id = block.id;

        {
            let mut blocks = self.blocks.write();
            if let Some(entry) = blocks.get_mut(&block_id) {
                entry.block = block;
                entry.accessed = true;
                return;
            }
            if blocks.len() < self.capacity {
                self.block_order.write().push(block_id);
                blocks.insert(block_id, CacheEntry { block, accessed: true });
                return;
            }
        }

        self.evict_one();
        let mut blocks = self.blocks.write();
        let mut block_order = self.block_order.write();
        if !blocks.contains_key(&block_id) {
            block_order.push(block_id);
        }
        blocks.insert(block_id, CacheEntry { block, accessed: true });
    }

    /// Removes a block from the cache.
    pub fn remove(&self, block_id: BlockId) -> Option<Block> {
        let mut blocks = self.blocks.write();
        let mut block_order = self.block_order.write();

        let entry = blocks.remove(&block_id)?;
        block_order.retain(|&id| id != block_id);
        Some(entry.block)
    }

    /// Evicts one block using the clock algorithm.
    fn evict_one(&self) {
        let mut blocks = self.blocks.write();
        let mut block_order = self.block_order.write();
        let mut clock_hand = self.clock_hand.write();

        // At most two sweeps: the first clears every accessed flag.
        let max_iterations = block_order.len() * 2 + 1;
        for _ in 0..max_iterations {
            if block_order.is_empty() {
                return;
            }
            if *clock_hand >= block_order.len() {
                *clock_hand = 0;
            }

            let block_id = block_order[*clock_hand];
            match blocks.get_mut(&block_id) {
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    *clock_hand += 1;
                },
                _ => {
                    blocks.remove(&block_id);
                    block_order.remove(*clock_hand);
                    return;
                },
            }
        }
    }

    /// Clears all cached blocks.
    pub fn clear(&self) {
        self.blocks.write().clear();
        self.block_order.write().clear();
        *self.clock_hand.write() = 0;
    }

    /// Returns the number of cached blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Checks if a block is in the cache.
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.read().contains_key(&block_id)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.blocks.read().len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of cached blocks.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}
