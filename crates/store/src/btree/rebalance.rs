//! Node splitting on insert and redistribution/merging on delete.
//!
//! Splits work on decoded nodes that have already overflowed by one entry.
//! Underflow repair works on a decoded parent: it fixes the child at a given
//! index by borrowing from a sibling with spare entries, or merging with a
//! sibling and removing the separator between them.

use crate::{
    block::BlockMgr,
    codec::{BranchPage, LeafPage},
    error::{BlockId, BlockKind, Error, Result},
};

/// Result of splitting a node: the separator to push up and the new right node.
#[derive(Debug)]
pub struct SplitResult {
    /// Separator key for the parent (first key covered by the right node).
    pub separator_key: Vec<u8>,
    /// Block id of the new right node.
    pub new_block_id: BlockId,
}

/// Writes the lower half of an overflowing leaf to `left_id` (via copy-on-write)
/// and the upper half to a new block.
///
/// Returns the (possibly new) left id and the split result.
pub fn split_leaf<M: BlockMgr>(
    provider: &mut M,
    left_id: BlockId,
    mut leaf: LeafPage,
) -> Result<(BlockId, SplitResult)> {
    let right_records = leaf.records.split_off(leaf.records.len() / 2);
    let separator_key = right_records[0].key.clone();

    let left_id = write_leaf(provider, left_id, &leaf)?;
    let mut right_block = provider.allocate(BlockKind::Leaf)?;
    let right = LeafPage { id: right_block.id, records: right_records };
    right.encode(&mut right_block, provider.layout())?;
    let new_block_id = right_block.id;
    provider.write(right_block)?;

    Ok((left_id, SplitResult { separator_key, new_block_id }))
}

/// Splits an overflowing branch around its middle key, which moves up.
pub fn split_branch<M: BlockMgr>(
    provider: &mut M,
    left_id: BlockId,
    mut branch: BranchPage,
) -> Result<(BlockId, SplitResult)> {
    let mid = branch.keys.len() / 2;
    let right_keys = branch.keys.split_off(mid + 1);
    let right_children = branch.children.split_off(mid + 1);
    let separator_key = branch.keys.pop().unwrap_or_default();

    let left_id = write_branch(provider, left_id, &branch)?;
    let mut right_block = provider.allocate(BlockKind::Branch)?;
    let right = BranchPage { id: right_block.id, keys: right_keys, children: right_children };
    right.encode(&mut right_block, provider.layout())?;
    let new_block_id = right_block.id;
    provider.write(right_block)?;

    Ok((left_id, SplitResult { separator_key, new_block_id }))
}

/// Writes a leaf through `get_write`, returning the id it now lives at.
pub fn write_leaf<M: BlockMgr>(provider: &mut M, id: BlockId, leaf: &LeafPage) -> Result<BlockId> {
    let mut block = provider.get_write(id)?;
    leaf.encode(&mut block, provider.layout())?;
    let new_id = block.id;
    provider.write(block)?;
    Ok(new_id)
}

/// Writes a branch through `get_write`, returning the id it now lives at.
pub fn write_branch<M: BlockMgr>(
    provider: &mut M,
    id: BlockId,
    branch: &BranchPage,
) -> Result<BlockId> {
    let mut block = provider.get_write(id)?;
    branch.encode(&mut block, provider.layout())?;
    let new_id = block.id;
    provider.write(block)?;
    Ok(new_id)
}

/// Repairs an underflowing child at `index` of `parent`.
///
/// `parent` is updated in memory (child ids, separators); the caller writes it.
pub fn fix_underflow<M: BlockMgr>(
    provider: &mut M,
    parent: &mut BranchPage,
    index: usize,
) -> Result<()> {
    if parent.children.len() < 2 {
        return Err(Error::Corrupted {
            reason: format!("branch {} has a single child", parent.id),
        });
    }
    let child_block = provider.get_read(parent.children[index])?;
    match child_block.kind()? {
        BlockKind::Leaf => {
            let child = LeafPage::decode(&child_block, provider.layout())?;
            fix_leaf(provider, parent, index, child)
        },
        _ => {
            let child = BranchPage::decode(&child_block, provider.layout())?;
            fix_branch(provider, parent, index, child)
        },
    }
}

fn fix_leaf<M: BlockMgr>(
    provider: &mut M,
    parent: &mut BranchPage,
    index: usize,
    mut child: LeafPage,
) -> Result<()> {
    let min = provider.layout().min_leaf_records();

    if index > 0 {
        let left_id = parent.children[index - 1];
        let mut left = LeafPage::decode(&provider.get_read(left_id)?, provider.layout())?;
        if left.records.len() > min {
            if let Some(moved) = left.records.pop() {
                child.records.insert(0, moved);
            }
            parent.keys[index - 1] = child.records[0].key.clone();
            parent.children[index - 1] = write_leaf(provider, left_id, &left)?;
            parent.children[index] = write_leaf(provider, parent.children[index], &child)?;
            return Ok(());
        }
    }

    if index + 1 < parent.children.len() {
        let right_id = parent.children[index + 1];
        let mut right = LeafPage::decode(&provider.get_read(right_id)?, provider.layout())?;
        if right.records.len() > min {
            child.records.push(right.records.remove(0));
            parent.keys[index] = right.records[0].key.clone();
            parent.children[index + 1] = write_leaf(provider, right_id, &right)?;
            parent.children[index] = write_leaf(provider, parent.children[index], &child)?;
            return Ok(());
        }

        if index == 0 {
            // Merge the right sibling into the child.
            child.records.append(&mut right.records);
            parent.children[index] = write_leaf(provider, parent.children[index], &child)?;
            provider.free(right_id)?;
            parent.keys.remove(index);
            parent.children.remove(index + 1);
            return Ok(());
        }
    }

    // Merge the child into its left sibling.
    let left_id = parent.children[index - 1];
    let mut left = LeafPage::decode(&provider.get_read(left_id)?, provider.layout())?;
    left.records.append(&mut child.records);
    parent.children[index - 1] = write_leaf(provider, left_id, &left)?;
    provider.free(parent.children[index])?;
    parent.keys.remove(index - 1);
    parent.children.remove(index);
    Ok(())
}

fn fix_branch<M: BlockMgr>(
    provider: &mut M,
    parent: &mut BranchPage,
    index: usize,
    mut child: BranchPage,
) -> Result<()> {
    let min = provider.layout().min_branch_keys();

    if index > 0 {
        let left_id = parent.children[index - 1];
        let mut left = BranchPage::decode(&provider.get_read(left_id)?, provider.layout())?;
        if left.keys.len() > min {
            if let (Some(key), Some(grandchild)) = (left.keys.pop(), left.children.pop()) {
                let down = std::mem::replace(&mut parent.keys[index - 1], key);
                child.keys.insert(0, down);
                child.children.insert(0, grandchild);
            }
            parent.children[index - 1] = write_branch(provider, left_id, &left)?;
            parent.children[index] = write_branch(provider, parent.children[index], &child)?;
            return Ok(());
        }
    }

    if index + 1 < parent.children.len() {
        let right_id = parent.children[index + 1];
        let mut right = BranchPage::decode(&provider.get_read(right_id)?, provider.layout())?;
        if right.keys.len() > min {
            let up = right.keys.remove(0);
            let down = std::mem::replace(&mut parent.keys[index], up);
            child.keys.push(down);
            child.children.push(right.children.remove(0));
            parent.children[index + 1] = write_branch(provider, right_id, &right)?;
            parent.children[index] = write_branch(provider, parent.children[index], &child)?;
            return Ok(());
        }

        if index == 0 {
            child.keys.push(parent.keys.remove(index));
            child.keys.append(&mut right.keys);
            child.children.append(&mut right.children);
            parent.children[index] = write_branch(provider, parent.children[index], &child)?;
            provider.free(right_id)?;
            parent.children.remove(index + 1);
            return Ok(());
        }
    }

    let left_id = parent.children[index - 1];
    let mut left = BranchPage::decode(&provider.get_read(left_id)?, provider.layout())?;
    left.keys.push(parent.keys.remove(index - 1));
    left.keys.append(&mut child.keys);
    left.children.append(&mut child.children);
    parent.children[index - 1] = write_branch(provider, left_id, &left)?;
    provider.free(parent.children[index])?;
    parent.children.remove(index);
    Ok(())
}
