//! Block management for the store engine.
//!
//! This module handles:
//! - Block layout and the 16-byte block header
//! - Block allocation (free list)
//! - Block caching (clock eviction)
//! - Per-file block storage and transactional views over it

mod allocator;
mod cache;
mod storage;
mod view;

pub use allocator::BlockAllocator;
pub use cache::{BlockCache, CacheStats};
pub use storage::BlockStorage;
pub use view::{BlockMgr, BlockRead, DirectView, FileStaging, ReadView, TxnView};

use crate::error::{BlockId, BlockKind, Error, Result};

/// Block header size in bytes.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Block header structure (16 bytes).
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       1      Block kind (BlockKind enum)
/// 1       1      Flags (reserved)
/// 2       2      Item count
/// 4       4      Checksum (XXH3-64 of content after header, truncated)
/// 8       8      Generation that wrote this block
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Block kind.
    pub kind: BlockKind,
    /// Flags (reserved for future use).
    pub flags: u8,
    /// Number of records or keys in this block.
    pub item_count: u16,
    /// XXH3-64 checksum (truncated to 32 bits) of block content.
    pub checksum: u32,
    /// Generation that last wrote this block.
    pub generation: u64,
}

impl BlockHeader {
    /// Creates a new block header.
    pub fn new(kind: BlockKind, generation: u64) -> Self {
        Self { kind, flags: 0, item_count: 0, checksum: 0, generation }
    }

    /// Serializes header to bytes.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.item_count.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    /// Deserializes header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer is shorter than
    /// [`BLOCK_HEADER_SIZE`] or the kind byte is invalid.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Block header too short".to_string() });
        }
        let mut item_count = [0u8; 2];
        item_count.copy_from_slice(&buf[2..4]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[4..8]);
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&buf[8..16]);

        Ok(Self {
            kind: BlockKind::try_from(buf[0])?,
            flags: buf[1],
            item_count: u16::from_le_bytes(item_count),
            checksum: u32::from_le_bytes(checksum),
            generation: u64::from_le_bytes(generation),
        })
    }
}

/// A fixed-size block of data with header and content.
#[derive(Clone)]
pub struct Block {
    /// Block id (slot `id * block_size` in its file).
    pub id: BlockId,
    /// Raw block data including header.
    pub data: Vec<u8>,
    /// Whether this block has been changed since it was read.
    pub modified: bool,
}

impl Block {
    /// Creates a new zeroed block with a fresh header.
    pub fn new(id: BlockId, block_size: usize, kind: BlockKind, generation: u64) -> Self {
        let mut data = vec![0u8; block_size];
        data[..BLOCK_HEADER_SIZE].copy_from_slice(&BlockHeader::new(kind, generation).to_bytes());
        Self { id, data, modified: true }
    }

    /// Wraps raw bytes read from storage.
    pub fn from_bytes(id: BlockId, data: Vec<u8>) -> Self {
        Self { id, data, modified: false }
    }

    /// Returns the block header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header bytes are corrupted.
    pub fn header(&self) -> Result<BlockHeader> {
        BlockHeader::from_bytes(&self.data)
    }

    /// Returns the block kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind byte is invalid.
    pub fn kind(&self) -> Result<BlockKind> {
        Ok(self.header()?.kind)
    }

    /// Returns the generation stamped in the header.
    pub fn generation(&self) -> u64 {
        self.header().map(|h| h.generation).unwrap_or(0)
    }

    /// Stamps the generation that is writing this block.
    pub fn set_generation(&mut self, generation: u64) {
        self.data[8..16].copy_from_slice(&generation.to_le_bytes());
        self.modified = true;
    }

    /// Returns the item count.
    ///
    /// # Errors
    ///
    /// Returns an error if the header bytes are corrupted.
    pub fn item_count(&self) -> Result<u16> {
        Ok(self.header()?.item_count)
    }

    /// Sets the item count.
    pub fn set_item_count(&mut self, count: u16) {
        self.data[2..4].copy_from_slice(&count.to_le_bytes());
        self.modified = true;
    }

    /// Returns the content portion of the block (after header).
    pub fn content(&self) -> &[u8] {
        &self.data[BLOCK_HEADER_SIZE..]
    }

    /// Returns the mutable content portion.
    pub fn content_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        &mut self.data[BLOCK_HEADER_SIZE..]
    }

    /// Computes and stores the content checksum.
    pub fn update_checksum(&mut self) {
        let checksum = content_checksum(&self.data);
        self.data[4..8].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Verifies the stored content checksum.
    pub fn verify_checksum(&self) -> bool {
        if self.data.len() < BLOCK_HEADER_SIZE {
            return false;
        }
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&self.data[4..8]);
        u32::from_le_bytes(stored) == content_checksum(&self.data)
    }

    /// Returns the block size.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// XXH3-64 of everything after the header, truncated to 32 bits.
fn content_checksum(data: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(&data[BLOCK_HEADER_SIZE..]) as u32
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("modified", &self.modified)
            .field("header", &self.header())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::params::DEFAULT_BLOCK_SIZE;

    #[test]
    fn test_block_header_round_trip() {
        let header = BlockHeader {
            kind: BlockKind::Leaf,
            flags: 0,
            item_count: 42,
            checksum: 0xDEAD_BEEF,
            generation: 12345,
        };

        let recovered = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(recovered.kind, BlockKind::Leaf);
        assert_eq!(recovered.item_count, 42);
        assert_eq!(recovered.checksum, 0xDEAD_BEEF);
        assert_eq!(recovered.generation, 12345);
    }

    #[test]
    fn test_header_rejects_short_buffer() {
        assert!(BlockHeader::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_block_checksum_detects_corruption() {
        let mut block = Block::new(3, DEFAULT_BLOCK_SIZE, BlockKind::Leaf, 1);
        block.content_mut()[0] = 0x42;
        block.content_mut()[100] = 0xFF;
        block.update_checksum();
        assert!(block.verify_checksum());

        block.data[BLOCK_HEADER_SIZE + 50] ^= 0xFF;
        assert!(!block.verify_checksum());
    }

    #[test]
    fn test_generation_stamp() {
        let mut block = Block::from_bytes(7, Block::new(7, 512, BlockKind::Branch, 4).data);
        assert!(!block.modified);
        assert_eq!(block.generation(), 4);

        block.set_generation(9);
        assert!(block.modified);
        assert_eq!(block.header().unwrap().generation, 9);
    }
}
