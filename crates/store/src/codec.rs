//! Typed node representations and their block encoding.
//!
//! Every block holds one node: a B+ tree branch, a B+ tree leaf, or the file
//! meta block. [`Node`] is the sum type; [`PageView`] is the small capability
//! trait shared by all three.
//!
//! ## Layouts (after the 16-byte block header)
//!
//! ```text
//! Leaf:    [record 0][record 1]...[record n-1]          record = key ‖ value
//! Branch:  [child 0]...[child n] [key 0]...[key n-1]    child = u64 LE
//! Meta:    magic[8] version u16 block_size u32 file_id u32 key_len u32 value_len u32
//! ```
//!
//! Branch child `i` covers keys `k` with `key[i-1] <= k < key[i]`.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub use crate::block::BLOCK_HEADER_SIZE;
use crate::{
    block::Block,
    error::{BlockId, BlockKind, Error, FileId, Result},
    params::FORMAT_VERSION,
};

/// Width of a child pointer in a branch block.
pub const BRANCH_POINTER_SIZE: usize = 8;

/// Magic bytes at the start of every block file meta block.
pub const META_MAGIC: [u8; 8] = *b"QRYBLOCK";

/// Capacity and record shape of one B+ tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLayout {
    /// Key width in bytes.
    pub key_len: usize,
    /// Value width in bytes.
    pub value_len: usize,
    /// Maximum records per leaf.
    pub max_leaf_records: usize,
    /// Maximum keys per branch (children = keys + 1).
    pub max_branch_keys: usize,
}

impl TreeLayout {
    /// Layout with capacities derived from the block size.
    pub fn new(key_len: usize, value_len: usize, block_size: usize) -> Self {
        let payload = block_size.saturating_sub(BLOCK_HEADER_SIZE);
        Self {
            key_len,
            value_len,
            max_leaf_records: payload / (key_len + value_len).max(1),
            max_branch_keys: payload.saturating_sub(BRANCH_POINTER_SIZE)
                / (key_len + BRANCH_POINTER_SIZE),
        }
    }

    /// Lowers the capacities (never raises them past what a block holds).
    ///
    /// Leaves keep at least three records and branches at least two keys so
    /// that splits and merges stay well defined.
    pub fn with_limits(mut self, max_leaf: Option<usize>, max_branch: Option<usize>) -> Self {
        if let Some(max) = max_leaf {
            self.max_leaf_records = max.clamp(3, self.max_leaf_records.max(3));
        }
        if let Some(max) = max_branch {
            self.max_branch_keys = max.clamp(2, self.max_branch_keys.max(2));
        }
        self
    }

    /// Total record width.
    pub fn record_len(&self) -> usize {
        self.key_len + self.value_len
    }

    /// Fewest records a non-root leaf may hold.
    pub fn min_leaf_records(&self) -> usize {
        self.max_leaf_records / 2
    }

    /// Fewest keys a non-root branch may hold.
    pub fn min_branch_keys(&self) -> usize {
        self.max_branch_keys / 2
    }

    /// Rejects keys of the wrong width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordSize`] if `key` does not match `key_len`.
    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_len {
            return Err(Error::RecordSize { expected: self.key_len, actual: key.len() });
        }
        Ok(())
    }

    /// Rejects values of the wrong width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordSize`] if `value` does not match `value_len`.
    pub fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.value_len {
            return Err(Error::RecordSize { expected: self.value_len, actual: value.len() });
        }
        Ok(())
    }
}

/// A fixed-length record: key plus (possibly empty) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Key bytes; ordering is byte-lexicographic over these only.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
}

impl Record {
    /// Creates a record.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Capability shared by every decoded node.
pub trait PageView {
    /// Block the node was decoded from.
    fn block_id(&self) -> BlockId;
    /// Node kind.
    fn kind(&self) -> BlockKind;
    /// Records (leaf), keys (branch) or zero (meta).
    fn item_count(&self) -> usize;
}

/// Decoded leaf node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPage {
    /// Source block id.
    pub id: BlockId,
    /// Records in ascending key order.
    pub records: Vec<Record>,
}

impl LeafPage {
    /// Creates an empty leaf for block `id`.
    pub fn empty(id: BlockId) -> Self {
        Self { id, records: Vec::new() }
    }

    /// Binary-searches for `key`: `Ok(index)` if present, `Err(insert_at)` otherwise.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.records.binary_search_by(|r| r.key.as_slice().cmp(key))
    }

    /// Decodes a leaf from a block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockKindMismatch`] for non-leaf blocks and
    /// [`Error::Corrupted`] if the record count exceeds the block.
    pub fn decode(block: &Block, layout: &TreeLayout) -> Result<Self> {
        let header = block.header()?;
        expect_kind(BlockKind::Leaf, header.kind)?;

        let count = usize::from(header.item_count);
        let rec_len = layout.record_len();
        let content = block.content();
        if count * rec_len > content.len() {
            return Err(Error::Corrupted {
                reason: format!("leaf {} claims {count} records of {rec_len} bytes", block.id),
            });
        }

        let records = content[..count * rec_len]
            .chunks_exact(rec_len)
            .map(|chunk| Record::new(&chunk[..layout.key_len], &chunk[layout.key_len..]))
            .collect();
        Ok(Self { id: block.id, records })
    }

    /// Encodes this leaf into `block`, replacing its content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the records do not fit the block.
    pub fn encode(&self, block: &mut Block, layout: &TreeLayout) -> Result<()> {
        let rec_len = layout.record_len();
        let needed = self.records.len() * rec_len;
        if needed > block.size() - BLOCK_HEADER_SIZE || self.records.len() > usize::from(u16::MAX) {
            return Err(Error::Corrupted {
                reason: format!("{} records overflow leaf block {}", self.records.len(), block.id),
            });
        }

        set_kind(block, BlockKind::Leaf);
        let content = block.content_mut();
        content.fill(0);
        for (chunk, record) in content[..needed].chunks_exact_mut(rec_len).zip(&self.records) {
            chunk[..layout.key_len].copy_from_slice(&record.key);
            chunk[layout.key_len..].copy_from_slice(&record.value);
        }
        block.set_item_count(self.records.len() as u16);
        Ok(())
    }
}

impl PageView for LeafPage {
    fn block_id(&self) -> BlockId {
        self.id
    }

    fn kind(&self) -> BlockKind {
        BlockKind::Leaf
    }

    fn item_count(&self) -> usize {
        self.records.len()
    }
}

/// Decoded branch node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPage {
    /// Source block id.
    pub id: BlockId,
    /// Separator keys, ascending.
    pub keys: Vec<Vec<u8>>,
    /// Child block ids; always `keys.len() + 1` of them.
    pub children: Vec<BlockId>,
}

impl BranchPage {
    /// Index of the child covering `key` (upper bound over the separators).
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_slice() <= key)
    }

    /// Decodes a branch from a block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockKindMismatch`] for non-branch blocks and
    /// [`Error::Corrupted`] if the key count exceeds the block.
    pub fn decode(block: &Block, layout: &TreeLayout) -> Result<Self> {
        let header = block.header()?;
        expect_kind(BlockKind::Branch, header.kind)?;

        let count = usize::from(header.item_count);
        let content = block.content();
        let pointers_len = (count + 1) * BRANCH_POINTER_SIZE;
        if pointers_len + count * layout.key_len > content.len() {
            return Err(Error::Corrupted {
                reason: format!("branch {} claims {count} keys", block.id),
            });
        }

        let mut cursor = Cursor::new(&content[..pointers_len]);
        let mut children = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            children.push(cursor.read_u64::<LittleEndian>()?);
        }
        let keys = content[pointers_len..pointers_len + count * layout.key_len]
            .chunks_exact(layout.key_len)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Self { id: block.id, keys, children })
    }

    /// Encodes this branch into `block`, replacing its content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the branch is malformed or overflows the block.
    pub fn encode(&self, block: &mut Block, layout: &TreeLayout) -> Result<()> {
        let count = self.keys.len();
        if self.children.len() != count + 1 {
            return Err(Error::Corrupted {
                reason: format!(
                    "branch {} has {} children for {count} keys",
                    block.id,
                    self.children.len()
                ),
            });
        }
        let pointers_len = (count + 1) * BRANCH_POINTER_SIZE;
        if pointers_len + count * layout.key_len > block.size() - BLOCK_HEADER_SIZE {
            return Err(Error::Corrupted {
                reason: format!("{count} keys overflow branch block {}", block.id),
            });
        }

        set_kind(block, BlockKind::Branch);
        let content = block.content_mut();
        content.fill(0);
        let mut cursor = Cursor::new(&mut content[..pointers_len]);
        for child in &self.children {
            cursor.write_u64::<LittleEndian>(*child)?;
        }
        for (chunk, key) in content[pointers_len..pointers_len + count * layout.key_len]
            .chunks_exact_mut(layout.key_len)
            .zip(&self.keys)
        {
            chunk.copy_from_slice(key);
        }
        block.set_item_count(count as u16);
        Ok(())
    }
}

impl PageView for BranchPage {
    fn block_id(&self) -> BlockId {
        self.id
    }

    fn kind(&self) -> BlockKind {
        BlockKind::Branch
    }

    fn item_count(&self) -> usize {
        self.keys.len()
    }
}

/// Decoded file meta block (always block 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPage {
    /// On-disk format version.
    pub version: u16,
    /// Block size the file was created with.
    pub block_size: u32,
    /// Position of the file in the store's tree list.
    pub file_id: FileId,
    /// Key width of the tree stored in the file.
    pub key_len: u32,
    /// Value width of the tree stored in the file.
    pub value_len: u32,
}

impl MetaPage {
    /// Meta page for a new file.
    pub fn new(file_id: FileId, block_size: usize, layout: &TreeLayout) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_size: block_size as u32,
            file_id,
            key_len: layout.key_len as u32,
            value_len: layout.value_len as u32,
        }
    }

    /// Decodes the meta block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockKindMismatch`], [`Error::InvalidMagic`] or
    /// [`Error::UnsupportedVersion`] for foreign or newer files.
    pub fn decode(block: &Block, file: &str) -> Result<Self> {
        expect_kind(BlockKind::Meta, block.kind()?)?;

        let mut cursor = Cursor::new(block.content());
        let mut magic = [0u8; 8];
        std::io::Read::read_exact(&mut cursor, &mut magic)?;
        if magic != META_MAGIC {
            return Err(Error::InvalidMagic { file: file.to_string() });
        }
        let version = cursor.read_u16::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        Ok(Self {
            version,
            block_size: cursor.read_u32::<LittleEndian>()?,
            file_id: cursor.read_u32::<LittleEndian>()?,
            key_len: cursor.read_u32::<LittleEndian>()?,
            value_len: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Encodes the meta block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] only if the block is too small to hold the fields.
    pub fn encode(&self, block: &mut Block) -> Result<()> {
        set_kind(block, BlockKind::Meta);
        let content = block.content_mut();
        content.fill(0);
        let mut cursor = Cursor::new(content);
        std::io::Write::write_all(&mut cursor, &META_MAGIC)?;
        cursor.write_u16::<LittleEndian>(self.version)?;
        cursor.write_u32::<LittleEndian>(self.block_size)?;
        cursor.write_u32::<LittleEndian>(self.file_id)?;
        cursor.write_u32::<LittleEndian>(self.key_len)?;
        cursor.write_u32::<LittleEndian>(self.value_len)?;
        Ok(())
    }
}

impl PageView for MetaPage {
    fn block_id(&self) -> BlockId {
        0
    }

    fn kind(&self) -> BlockKind {
        BlockKind::Meta
    }

    fn item_count(&self) -> usize {
        0
    }
}

/// Any decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// B+ tree branch.
    Branch(BranchPage),
    /// B+ tree leaf.
    Leaf(LeafPage),
    /// File meta block.
    Meta(MetaPage),
}

impl Node {
    /// Decodes whichever node kind the block header names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for free blocks or malformed content.
    pub fn decode(block: &Block, layout: &TreeLayout) -> Result<Self> {
        match block.kind()? {
            BlockKind::Leaf => Ok(Node::Leaf(LeafPage::decode(block, layout)?)),
            BlockKind::Branch => Ok(Node::Branch(BranchPage::decode(block, layout)?)),
            BlockKind::Meta => Ok(Node::Meta(MetaPage::decode(block, "block")?)),
            BlockKind::Free => Err(Error::Corrupted {
                reason: format!("block {} is free but referenced", block.id),
            }),
        }
    }

    /// Encodes the node into `block`.
    ///
    /// # Errors
    ///
    /// Propagates the per-kind encoding errors.
    pub fn encode(&self, block: &mut Block, layout: &TreeLayout) -> Result<()> {
        match self {
            Node::Branch(branch) => branch.encode(block, layout),
            Node::Leaf(leaf) => leaf.encode(block, layout),
            Node::Meta(meta) => meta.encode(block),
        }
    }

    fn view(&self) -> &dyn PageView {
        match self {
            Node::Branch(branch) => branch,
            Node::Leaf(leaf) => leaf,
            Node::Meta(meta) => meta,
        }
    }
}

impl PageView for Node {
    fn block_id(&self) -> BlockId {
        self.view().block_id()
    }

    fn kind(&self) -> BlockKind {
        self.view().kind()
    }

    fn item_count(&self) -> usize {
        self.view().item_count()
    }
}

fn expect_kind(expected: BlockKind, found: BlockKind) -> Result<()> {
    if expected != found {
        return Err(Error::BlockKindMismatch { expected, found });
    }
    Ok(())
}

fn set_kind(block: &mut Block, kind: BlockKind) {
    block.data[0] = kind as u8;
    block.modified = true;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn layout() -> TreeLayout {
        TreeLayout::new(8, 4, 512)
    }

    #[test]
    fn test_layout_capacities() {
        let layout = layout();
        assert_eq!(layout.max_leaf_records, (512 - 16) / 12);
        assert_eq!(layout.max_branch_keys, (512 - 16 - 8) / 16);
        assert_eq!(layout.min_leaf_records(), layout.max_leaf_records / 2);
    }

    #[test]
    fn test_layout_limits_only_lower() {
        let limited = layout().with_limits(Some(4), Some(1_000));
        assert_eq!(limited.max_leaf_records, 4);
        assert_eq!(limited.max_branch_keys, layout().max_branch_keys);

        let floor = layout().with_limits(Some(1), Some(0));
        assert_eq!(floor.max_leaf_records, 3);
        assert_eq!(floor.max_branch_keys, 2);
    }

    #[test]
    fn test_record_size_checks() {
        let layout = layout();
        assert!(layout.check_key(&[0; 8]).is_ok());
        assert!(matches!(
            layout.check_key(&[0; 7]),
            Err(Error::RecordSize { expected: 8, actual: 7 })
        ));
        assert!(layout.check_value(&[0; 5]).is_err());
    }

    #[test]
    fn test_leaf_encode_decode() {
        let layout = layout();
        let leaf = LeafPage {
            id: 5,
            records: vec![Record::new(*b"aaaaaaaa", *b"1111"), Record::new(*b"bbbbbbbb", *b"2222")],
        };
        let mut block = Block::new(5, 512, BlockKind::Leaf, 1);
        leaf.encode(&mut block, &layout).unwrap();

        assert_eq!(block.item_count().unwrap(), 2);
        assert_eq!(LeafPage::decode(&block, &layout).unwrap(), leaf);
        assert_eq!(leaf.search(b"bbbbbbbb"), Ok(1));
        assert_eq!(leaf.search(b"abbbbbbb"), Err(1));
    }

    #[test]
    fn test_branch_encode_decode_and_routing() {
        let layout = layout();
        let branch = BranchPage {
            id: 9,
            keys: vec![b"dddddddd".to_vec(), b"mmmmmmmm".to_vec()],
            children: vec![10, 11, 12],
        };
        let mut block = Block::new(9, 512, BlockKind::Branch, 1);
        branch.encode(&mut block, &layout).unwrap();

        let decoded = BranchPage::decode(&block, &layout).unwrap();
        assert_eq!(decoded, branch);
        assert_eq!(decoded.child_index(b"aaaaaaaa"), 0);
        assert_eq!(decoded.child_index(b"dddddddd"), 1);
        assert_eq!(decoded.child_index(b"zzzzzzzz"), 2);
    }

    #[test]
    fn test_branch_rejects_mismatched_children() {
        let branch = BranchPage { id: 1, keys: vec![vec![0; 8]], children: vec![2] };
        let mut block = Block::new(1, 512, BlockKind::Branch, 1);
        assert!(branch.encode(&mut block, &layout()).is_err());
    }

    #[test]
    fn test_kind_mismatch() {
        let block = Block::new(1, 512, BlockKind::Branch, 1);
        let err = LeafPage::decode(&block, &layout()).unwrap_err();
        assert!(matches!(
            err,
            Error::BlockKindMismatch { expected: BlockKind::Leaf, found: BlockKind::Branch }
        ));
    }

    #[test]
    fn test_meta_page_validation() {
        let layout = layout();
        let mut block = Block::new(0, 512, BlockKind::Meta, 0);
        MetaPage::new(3, 512, &layout).encode(&mut block).unwrap();

        let meta = MetaPage::decode(&block, "SPO.bpt").unwrap();
        assert_eq!(meta.file_id, 3);
        assert_eq!(meta.block_size, 512);
        assert_eq!(meta.key_len, 8);

        block.data[BLOCK_HEADER_SIZE] = b'X';
        assert!(matches!(
            MetaPage::decode(&block, "SPO.bpt"),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_node_sum_type_dispatch() {
        let layout = layout();
        let mut block = Block::new(4, 512, BlockKind::Leaf, 1);
        LeafPage { id: 4, records: vec![Record::new(*b"kkkkkkkk", *b"vvvv")] }
            .encode(&mut block, &layout)
            .unwrap();

        let node = Node::decode(&block, &layout).unwrap();
        assert_eq!(node.kind(), BlockKind::Leaf);
        assert_eq!(node.block_id(), 4);
        assert_eq!(node.item_count(), 1);

        let free = Block::new(6, 512, BlockKind::Free, 0);
        assert!(Node::decode(&free, &layout).is_err());
    }
}
