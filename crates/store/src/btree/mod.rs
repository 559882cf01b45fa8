//! B+ tree over fixed-length records.
//!
//! This module provides the ordered index used for every tree in a store:
//! the node table's hash and id trees and every configured record index.
//! The implementation is designed for:
//! - Single-writer, multiple-reader access
//! - Copy-on-write through [`BlockMgr::get_write`], so a reader bound to an
//!   older root keeps a complete, unchanging tree
//! - Full rebalancing on delete (redistribute, else merge) so every non-root
//!   node stays at least half full
//!
//! ## Structure
//!
//! - `cursor.rs`: range bounds and the stack-based iterator
//! - `rebalance.rs`: node splitting and underflow repair

/// Range bounds and iteration.
pub mod cursor;
mod rebalance;

pub use cursor::{BTreeIterator, Bound, Range};
use rebalance::{SplitResult, fix_underflow, split_branch, split_leaf, write_branch, write_leaf};

use crate::{
    block::{BlockMgr, BlockRead},
    codec::{BranchPage, LeafPage, Record, TreeLayout},
    error::{BlockId, BlockKind, Error, Result},
};

/// What an insert does when the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Replace the stored value.
    #[default]
    Overwrite,
    /// Fail with [`Error::DuplicateKey`].
    Reject,
}

/// Outcome of an insert below a node.
enum InsertOutcome {
    /// The node kept its id and separators (its content may have been
    /// rewritten in place, which only happens to blocks fresh in this
    /// transaction).
    Unchanged,
    /// The node now lives at `id`, possibly with a new right sibling.
    Replaced { id: BlockId, split: Option<SplitResult> },
}

/// Outcome of a delete below a node.
enum DeleteOutcome {
    NotFound,
    Removed { id: BlockId, underflow: bool },
}

/// Result of a structural check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeCheck {
    /// Records found in leaves.
    pub records: u64,
    /// Leaf nodes visited.
    pub leaves: u64,
    /// Branch nodes visited.
    pub branches: u64,
    /// Levels from root to leaves (0 for an empty tree).
    pub depth: u32,
    /// Human-readable descriptions of every violation found.
    pub problems: Vec<String>,
}

impl TreeCheck {
    /// Returns true if no violation was found.
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// A B+ tree bound to one root and one block provider.
///
/// Read operations need only [`BlockRead`]; mutations need [`BlockMgr`] and
/// move the root as copy-on-write re-points the path from the changed leaf.
pub struct BPlusTree<P> {
    /// Block provider for reading/writing nodes.
    provider: P,
    /// Root block id (0 = empty tree).
    root: BlockId,
    /// Node splits performed through this handle.
    split_count: u64,
}

impl<P: BlockRead> BPlusTree<P> {
    /// Creates a tree accessor.
    pub fn new(root: BlockId, provider: P) -> Self {
        Self { provider, root, split_count: 0 }
    }

    /// Returns the root block id.
    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Checks if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Returns the number of node splits performed through this handle.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Record layout and node capacities.
    pub fn layout(&self) -> &TreeLayout {
        self.provider.layout()
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordSize`] for keys of the wrong width, or any block
    /// read error.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.layout().check_key(key)?;
        if self.root == 0 {
            return Ok(None);
        }

        let mut current = self.root;
        loop {
            let block = self.provider.get_read(current)?;
            match block.kind()? {
                BlockKind::Branch => {
                    let branch = BranchPage::decode(&block, self.layout())?;
                    current = branch.children[branch.child_index(key)];
                },
                BlockKind::Leaf => {
                    let mut leaf = LeafPage::decode(&block, self.layout())?;
                    return Ok(leaf.search(key).ok().map(|i| leaf.records.swap_remove(i).value));
                },
                found => return Err(Error::BlockKindMismatch { expected: BlockKind::Leaf, found }),
            }
        }
    }

    /// Returns true if `key` is present.
    ///
    /// # Errors
    ///
    /// As [`find`](Self::find).
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Creates an iterator over all records.
    pub fn iter(&self) -> BTreeIterator<&P> {
        self.range(Range::all())
    }

    /// Creates an iterator over a range of records.
    pub fn range(&self, range: Range) -> BTreeIterator<&P> {
        BTreeIterator::new(&self.provider, self.root, range)
    }

    /// Returns the record with the smallest key.
    ///
    /// # Errors
    ///
    /// Returns an error if a block read fails.
    pub fn min(&self) -> Result<Option<Record>> {
        self.edge_record(false)
    }

    /// Returns the record with the largest key.
    ///
    /// # Errors
    ///
    /// Returns an error if a block read fails.
    pub fn max(&self) -> Result<Option<Record>> {
        self.edge_record(true)
    }

    fn edge_record(&self, last: bool) -> Result<Option<Record>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut current = self.root;
        loop {
            let block = self.provider.get_read(current)?;
            if block.kind()? == BlockKind::Branch {
                let branch = BranchPage::decode(&block, self.layout())?;
                current = if last { branch.children[branch.keys.len()] } else { branch.children[0] };
            } else {
                let mut leaf = LeafPage::decode(&block, self.layout())?;
                return Ok(if last { leaf.records.pop() } else { leaf.records.into_iter().next() });
            }
        }
    }

    /// Computes the depth of the tree (0 = empty, 1 = root is a leaf).
    ///
    /// # Errors
    ///
    /// Returns an error if a block read fails.
    pub fn depth(&self) -> Result<u32> {
        if self.root == 0 {
            return Ok(0);
        }
        let mut depth = 1;
        let mut current = self.root;
        loop {
            let block = self.provider.get_read(current)?;
            if block.kind()? != BlockKind::Branch {
                return Ok(depth);
            }
            current = BranchPage::decode(&block, self.layout())?.children[0];
            depth += 1;
        }
    }

    /// Counts records by summing leaf item counts.
    ///
    /// # Errors
    ///
    /// Returns an error if a block read fails.
    pub fn count(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut stack = if self.root == 0 { Vec::new() } else { vec![self.root] };
        while let Some(block_id) = stack.pop() {
            let block = self.provider.get_read(block_id)?;
            if block.kind()? == BlockKind::Branch {
                stack.extend(BranchPage::decode(&block, self.layout())?.children);
            } else {
                total += u64::from(block.item_count()?);
            }
        }
        Ok(total)
    }

    /// Walks the whole tree checking key order, separator bounds, fill and
    /// uniform leaf depth. Unreadable blocks are reported, not returned.
    pub fn check(&self) -> TreeCheck {
        let mut report = TreeCheck::default();
        if self.root == 0 {
            return report;
        }
        let mut leaf_level = None;
        self.check_node(self.root, None, None, 1, true, &mut leaf_level, &mut report);
        report.depth = leaf_level.unwrap_or(0);
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        block_id: BlockId,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        level: u32,
        is_root: bool,
        leaf_level: &mut Option<u32>,
        report: &mut TreeCheck,
    ) {
        let layout = *self.layout();
        let in_bounds = |key: &[u8]| lower.is_none_or(|lo| key >= lo) && upper.is_none_or(|hi| key < hi);

        let block = match self.provider.get_read(block_id) {
            Ok(block) => block,
            Err(err) => {
                report.problems.push(format!("block {block_id}: {err}"));
                return;
            },
        };

        match block.kind() {
            Ok(BlockKind::Leaf) => {
                let leaf = match LeafPage::decode(&block, &layout) {
                    Ok(leaf) => leaf,
                    Err(err) => {
                        report.problems.push(format!("leaf {block_id}: {err}"));
                        return;
                    },
                };
                report.leaves += 1;
                report.records += leaf.records.len() as u64;

                match *leaf_level {
                    None => *leaf_level = Some(level),
                    Some(expected) if expected != level => report
                        .problems
                        .push(format!("leaf {block_id} at depth {level}, expected {expected}")),
                    Some(_) => {},
                }
                if !is_root && leaf.records.len() < layout.min_leaf_records().max(1) {
                    report.problems.push(format!(
                        "leaf {block_id} underfull: {} records",
                        leaf.records.len()
                    ));
                }
                if leaf.records.len() > layout.max_leaf_records {
                    report.problems.push(format!("leaf {block_id} overfull"));
                }
                if leaf.records.windows(2).any(|w| w[0].key >= w[1].key) {
                    report.problems.push(format!("leaf {block_id} keys out of order"));
                }
                if leaf.records.iter().any(|r| !in_bounds(r.key.as_slice())) {
                    report.problems.push(format!("leaf {block_id} key outside separator bounds"));
                }
            },
            Ok(BlockKind::Branch) => {
                let branch = match BranchPage::decode(&block, &layout) {
                    Ok(branch) => branch,
                    Err(err) => {
                        report.problems.push(format!("branch {block_id}: {err}"));
                        return;
                    },
                };
                report.branches += 1;

                let min = if is_root { 1 } else { layout.min_branch_keys() };
                if branch.keys.len() < min {
                    report.problems.push(format!(
                        "branch {block_id} underfull: {} keys",
                        branch.keys.len()
                    ));
                }
                if branch.keys.len() > layout.max_branch_keys {
                    report.problems.push(format!("branch {block_id} overfull"));
                }
                if branch.keys.windows(2).any(|w| w[0] >= w[1]) {
                    report.problems.push(format!("branch {block_id} keys out of order"));
                }
                if branch.keys.iter().any(|k| !in_bounds(k.as_slice())) {
                    report.problems.push(format!("branch {block_id} key outside separator bounds"));
                }

                for (i, &child) in branch.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(branch.keys[i - 1].as_slice()) };
                    let hi = branch.keys.get(i).map(Vec::as_slice).or(upper);
                    self.check_node(child, lo, hi, level + 1, false, leaf_level, report);
                }
            },
            Ok(found) => report.problems.push(format!("block {block_id} is a {found:?} block")),
            Err(err) => report.problems.push(format!("block {block_id}: {err}")),
        }
    }
}

impl<P: BlockMgr> BPlusTree<P> {
    /// Inserts a record, returning the previous value if the key existed.
    ///
    /// Overwriting with an identical value changes nothing and copies no
    /// blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordSize`] for mis-sized keys or values,
    /// [`Error::DuplicateKey`] under [`DuplicatePolicy::Reject`], and
    /// [`Error::ReadOnly`] for read-only providers.
    pub fn insert(
        &mut self,
        key: &[u8],
        value: &[u8],
        policy: DuplicatePolicy,
    ) -> Result<Option<Vec<u8>>> {
        let layout = *self.layout();
        layout.check_key(key)?;
        layout.check_value(value)?;

        if self.root == 0 {
            let mut block = self.provider.allocate(BlockKind::Leaf)?;
            LeafPage { id: block.id, records: vec![Record::new(key, value)] }
                .encode(&mut block, &layout)?;
            self.root = block.id;
            self.provider.write(block)?;
            return Ok(None);
        }

        let mut old_value = None;
        match self.insert_recursive(self.root, key, value, policy, &mut old_value)? {
            InsertOutcome::Unchanged => {},
            InsertOutcome::Replaced { id, split: None } => self.root = id,
            InsertOutcome::Replaced { id, split: Some(split) } => {
                // Root was split, grow a new root.
                let mut block = self.provider.allocate(BlockKind::Branch)?;
                BranchPage {
                    id: block.id,
                    keys: vec![split.separator_key],
                    children: vec![id, split.new_block_id],
                }
                .encode(&mut block, &layout)?;
                self.root = block.id;
                self.provider.write(block)?;
            },
        }
        Ok(old_value)
    }

    fn insert_recursive(
        &mut self,
        block_id: BlockId,
        key: &[u8],
        value: &[u8],
        policy: DuplicatePolicy,
        old_value: &mut Option<Vec<u8>>,
    ) -> Result<InsertOutcome> {
        let layout = *self.layout();
        let block = self.provider.get_read(block_id)?;

        match block.kind()? {
            BlockKind::Leaf => {
                let mut leaf = LeafPage::decode(&block, &layout)?;
                match leaf.search(key) {
                    Ok(index) => {
                        if policy == DuplicatePolicy::Reject {
                            return Err(Error::DuplicateKey);
                        }
                        let previous =
                            std::mem::replace(&mut leaf.records[index].value, value.to_vec());
                        let unchanged = previous == value;
                        *old_value = Some(previous);
                        if unchanged {
                            return Ok(InsertOutcome::Unchanged);
                        }
                        let id = write_leaf(&mut self.provider, block_id, &leaf)?;
                        Ok(replaced(block_id, id, None))
                    },
                    Err(index) => {
                        leaf.records.insert(index, Record::new(key, value));
                        if leaf.records.len() <= layout.max_leaf_records {
                            let id = write_leaf(&mut self.provider, block_id, &leaf)?;
                            return Ok(replaced(block_id, id, None));
                        }
                        self.split_count += 1;
                        let (id, split) = split_leaf(&mut self.provider, block_id, leaf)?;
                        Ok(replaced(block_id, id, Some(split)))
                    },
                }
            },
            BlockKind::Branch => {
                let mut branch = BranchPage::decode(&block, &layout)?;
                let index = branch.child_index(key);
                let (child_id, split) = match self.insert_recursive(
                    branch.children[index],
                    key,
                    value,
                    policy,
                    old_value,
                )? {
                    InsertOutcome::Unchanged => return Ok(InsertOutcome::Unchanged),
                    InsertOutcome::Replaced { id, split } => (id, split),
                };

                branch.children[index] = child_id;
                if let Some(split) = split {
                    branch.keys.insert(index, split.separator_key);
                    branch.children.insert(index + 1, split.new_block_id);
                }

                if branch.keys.len() <= layout.max_branch_keys {
                    let id = write_branch(&mut self.provider, block_id, &branch)?;
                    return Ok(replaced(block_id, id, None));
                }
                self.split_count += 1;
                let (id, split) = split_branch(&mut self.provider, block_id, branch)?;
                Ok(replaced(block_id, id, Some(split)))
            },
            found => Err(Error::BlockKindMismatch { expected: BlockKind::Leaf, found }),
        }
    }

    /// Deletes a key, returning its former value.
    ///
    /// Underflowing nodes borrow from a sibling with spare entries, else merge
    /// with one. A root branch left with a single child is replaced by it and
    /// an emptied root leaf leaves the tree empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecordSize`] for mis-sized keys and
    /// [`Error::ReadOnly`] for read-only providers.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.layout().check_key(key)?;
        if self.root == 0 {
            return Ok(None);
        }

        let mut old_value = None;
        match self.delete_recursive(self.root, key, &mut old_value)? {
            DeleteOutcome::NotFound => return Ok(None),
            DeleteOutcome::Removed { id, .. } => self.root = id,
        }
        self.shrink_root()?;
        Ok(old_value)
    }

    fn delete_recursive(
        &mut self,
        block_id: BlockId,
        key: &[u8],
        old_value: &mut Option<Vec<u8>>,
    ) -> Result<DeleteOutcome> {
        let layout = *self.layout();
        let block = self.provider.get_read(block_id)?;

        match block.kind()? {
            BlockKind::Leaf => {
                let mut leaf = LeafPage::decode(&block, &layout)?;
                let Ok(index) = leaf.search(key) else {
                    return Ok(DeleteOutcome::NotFound);
                };
                *old_value = Some(leaf.records.remove(index).value);
                let underflow = leaf.records.len() < layout.min_leaf_records().max(1);
                let id = write_leaf(&mut self.provider, block_id, &leaf)?;
                Ok(DeleteOutcome::Removed { id, underflow })
            },
            BlockKind::Branch => {
                let mut branch = BranchPage::decode(&block, &layout)?;
                let index = branch.child_index(key);
                let (child_id, child_underflow) =
                    match self.delete_recursive(branch.children[index], key, old_value)? {
                        DeleteOutcome::NotFound => return Ok(DeleteOutcome::NotFound),
                        DeleteOutcome::Removed { id, underflow } => (id, underflow),
                    };

                if child_id == branch.children[index] && !child_underflow {
                    return Ok(DeleteOutcome::Removed { id: block_id, underflow: false });
                }
                branch.children[index] = child_id;
                if child_underflow {
                    fix_underflow(&mut self.provider, &mut branch, index)?;
                }
                let underflow = branch.keys.len() < layout.min_branch_keys();
                let id = write_branch(&mut self.provider, block_id, &branch)?;
                Ok(DeleteOutcome::Removed { id, underflow })
            },
            found => Err(Error::BlockKindMismatch { expected: BlockKind::Leaf, found }),
        }
    }

    fn shrink_root(&mut self) -> Result<()> {
        while self.root != 0 {
            let block = self.provider.get_read(self.root)?;
            match block.kind()? {
                BlockKind::Leaf => {
                    if block.item_count()? == 0 {
                        self.provider.free(self.root)?;
                        self.root = 0;
                    }
                    return Ok(());
                },
                BlockKind::Branch => {
                    let branch = BranchPage::decode(&block, self.layout())?;
                    if !branch.keys.is_empty() {
                        return Ok(());
                    }
                    self.provider.free(self.root)?;
                    self.root = branch.children[0];
                },
                found => return Err(Error::BlockKindMismatch { expected: BlockKind::Branch, found }),
            }
        }
        Ok(())
    }
}

fn replaced(old_id: BlockId, new_id: BlockId, split: Option<SplitResult>) -> InsertOutcome {
    if old_id == new_id && split.is_none() {
        InsertOutcome::Unchanged
    } else {
        InsertOutcome::Replaced { id: new_id, split }
    }
}
