//! Generations and the committed state readers pin.

use std::{fmt, io::Cursor};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::error::{BlockId, Error, FileId, Result};

/// Store-wide version, advanced once per commit that changes something.
///
/// Read transactions pin one generation; a writer builds `G + 1`, which
/// becomes visible atomically when its commit publishes.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct Generation(pub u64);

impl Generation {
    /// Creates a generation.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The generation a writer on top of this one produces.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root and extent of one tree file at a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    /// Root block (0 = empty tree).
    pub root: BlockId,
    /// Block slots in use, including the meta block.
    pub total_blocks: u64,
}

impl Default for TreeRoot {
    fn default() -> Self {
        Self { root: 0, total_blocks: 1 }
    }
}

/// Everything a reader needs to see one generation.
///
/// This is what commits publish through an atomic pointer swap, what the
/// state file's slots hold, and what `State` journal entries carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedState {
    /// Generation this state describes.
    pub generation: Generation,
    /// One entry per tree file, in file order.
    pub trees: Vec<TreeRoot>,
    /// Committed length of the node data file.
    pub node_data_len: u64,
    /// Next sequential node table index.
    pub next_node_id: u64,
}

const FIXED_LEN: usize = 8 + 8 + 8 + 4;
const TREE_LEN: usize = 16;

impl CommittedState {
    /// State of a freshly created store.
    pub fn empty(tree_count: usize) -> Self {
        Self {
            generation: Generation::default(),
            trees: vec![TreeRoot::default(); tree_count],
            node_data_len: 0,
            next_node_id: 0,
        }
    }

    /// Encoded size for a store with `tree_count` trees.
    pub fn encoded_len(tree_count: usize) -> usize {
        FIXED_LEN + tree_count * TREE_LEN
    }

    /// Root of tree `file_id` (0 if out of range).
    pub fn root(&self, file_id: FileId) -> BlockId {
        self.trees.get(file_id as usize).map_or(0, |t| t.root)
    }

    /// Encodes to little-endian bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::encoded_len(self.trees.len())];
        LittleEndian::write_u64(&mut buf[0..8], self.generation.0);
        LittleEndian::write_u64(&mut buf[8..16], self.node_data_len);
        LittleEndian::write_u64(&mut buf[16..24], self.next_node_id);
        LittleEndian::write_u32(&mut buf[24..28], self.trees.len() as u32);
        for (i, tree) in self.trees.iter().enumerate() {
            let at = FIXED_LEN + i * TREE_LEN;
            LittleEndian::write_u64(&mut buf[at..at + 8], tree.root);
            LittleEndian::write_u64(&mut buf[at + 8..at + 16], tree.total_blocks);
        }
        buf
    }

    /// Decodes bytes produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the bytes are truncated.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let truncated = |_| Error::Corrupted { reason: "commit state truncated".to_string() };
        let mut cursor = Cursor::new(bytes);
        let generation = Generation(cursor.read_u64::<LittleEndian>().map_err(truncated)?);
        let node_data_len = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let next_node_id = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if bytes.len() < Self::encoded_len(count) {
            return Err(Error::Corrupted {
                reason: format!("commit state for {count} trees is {} bytes", bytes.len()),
            });
        }

        let mut trees = Vec::with_capacity(count);
        for _ in 0..count {
            let root = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            let total_blocks = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            trees.push(TreeRoot { root, total_blocks });
        }
        Ok(Self { generation, trees, node_data_len, next_node_id })
    }
}
