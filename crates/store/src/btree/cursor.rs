//! Range bounds and the stack-based range iterator.
//!
//! Copy-on-write trees carry no sibling links (a sibling pointer would force
//! every neighbour of a changed leaf to be copied too), so the iterator keeps
//! the path of branch nodes from the root and climbs it to reach the next
//! leaf. Because committed blocks are immutable, an iterator over one root
//! is never disturbed by a concurrent writer.

use crate::{
    block::BlockRead,
    codec::{BranchPage, LeafPage, Record},
    error::{BlockId, BlockKind, Result},
};

/// One end of a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    /// No bound (unbounded).
    Unbounded,
    /// Inclusive bound.
    Included(Vec<u8>),
    /// Exclusive bound.
    Excluded(Vec<u8>),
}

/// Key range for scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Lower bound.
    pub start: Bound,
    /// Upper bound.
    pub end: Bound,
}

impl Range {
    /// Creates a range covering all keys.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// Creates a range from start (inclusive) to end (exclusive).
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self { start: Bound::Included(start.into()), end: Bound::Excluded(end.into()) }
    }

    /// Creates a range starting from a key (inclusive).
    pub fn from(start: impl Into<Vec<u8>>) -> Self {
        Self { start: Bound::Included(start.into()), end: Bound::Unbounded }
    }

    /// Creates a range of exactly the keys beginning with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        let end = match prefix_successor(&prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        Self { start: Bound::Included(prefix), end }
    }

    /// Checks if a key is within this range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Unbounded => true,
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
        };
        after_start && self.should_continue(key)
    }

    /// Checks if iteration should continue based on current key.
    pub fn should_continue(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
        }
    }
}

/// Smallest key greater than every key with this prefix, if any.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Iterator over tree records in ascending key order.
///
/// Leaves are loaded on demand. After the tree has moved on to a new root
/// (a later generation), [`reseek`](Self::reseek) continues after the last
/// yielded key in the new tree.
pub struct BTreeIterator<P: BlockRead> {
    provider: P,
    root: BlockId,
    range: Range,
    /// Branches from the root down, each with the index of the child in use.
    stack: Vec<(BranchPage, usize)>,
    leaf: Option<LeafPage>,
    position: usize,
    last_key: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl<P: BlockRead> BTreeIterator<P> {
    /// Creates an iterator over `range` in the tree rooted at `root`.
    pub fn new(provider: P, root: BlockId, range: Range) -> Self {
        Self {
            provider,
            root,
            range,
            stack: Vec::new(),
            leaf: None,
            position: 0,
            last_key: None,
            started: false,
            done: false,
        }
    }

    /// Restarts iteration in the tree rooted at `new_root`, resuming after
    /// the last record returned so far.
    pub fn reseek(&mut self, new_root: BlockId) {
        self.root = new_root;
        if let Some(last) = self.last_key.clone() {
            self.range.start = Bound::Excluded(last);
        }
        self.stack.clear();
        self.leaf = None;
        self.position = 0;
        self.started = false;
        self.done = false;
    }

    /// Key of the last record returned.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    fn seek_to_start(&mut self) -> Result<()> {
        self.started = true;
        if self.root == 0 {
            self.done = true;
            return Ok(());
        }

        let start_key = match &self.range.start {
            Bound::Unbounded => None,
            Bound::Included(k) | Bound::Excluded(k) => Some(k.clone()),
        };

        let mut current = self.root;
        loop {
            let block = self.provider.get_read(current)?;
            match block.kind()? {
                BlockKind::Branch => {
                    let branch = BranchPage::decode(&block, self.provider.layout())?;
                    let index = start_key.as_deref().map_or(0, |k| branch.child_index(k));
                    current = branch.children[index];
                    self.stack.push((branch, index));
                },
                _ => {
                    let leaf = LeafPage::decode(&block, self.provider.layout())?;
                    self.position = match (&self.range.start, start_key.as_deref()) {
                        (Bound::Excluded(_), Some(k)) => match leaf.search(k) {
                            Ok(i) => i + 1,
                            Err(i) => i,
                        },
                        (_, Some(k)) => leaf.search(k).unwrap_or_else(|i| i),
                        (_, None) => 0,
                    };
                    self.leaf = Some(leaf);
                    return Ok(());
                },
            }
        }
    }

    /// Moves to the first record of the next leaf, climbing the branch stack.
    fn next_leaf(&mut self) -> Result<bool> {
        while let Some((branch, index)) = self.stack.last_mut() {
            if *index + 1 < branch.children.len() {
                *index += 1;
                let mut current = branch.children[*index];
                loop {
                    let block = self.provider.get_read(current)?;
                    if block.kind()? == BlockKind::Branch {
                        let child = BranchPage::decode(&block, self.provider.layout())?;
                        current = child.children[0];
                        self.stack.push((child, 0));
                    } else {
                        self.leaf = Some(LeafPage::decode(&block, self.provider.layout())?);
                        self.position = 0;
                        return Ok(true);
                    }
                }
            }
            self.stack.pop();
        }
        Ok(false)
    }

    /// Returns the next record in range.
    ///
    /// # Errors
    ///
    /// Returns an error if a block read or decode fails.
    pub fn next_entry(&mut self) -> Result<Option<Record>> {
        if !self.started {
            self.seek_to_start()?;
        }

        loop {
            if self.done {
                return Ok(None);
            }
            let Some(leaf) = &self.leaf else {
                self.done = true;
                return Ok(None);
            };

            if let Some(record) = leaf.records.get(self.position) {
                if !self.range.should_continue(&record.key) {
                    self.done = true;
                    return Ok(None);
                }
                let record = record.clone();
                self.position += 1;
                self.last_key = Some(record.key.clone());
                return Ok(Some(record));
            }

            if !self.next_leaf()? {
                self.done = true;
            }
        }
    }
}

impl<P: BlockRead> Iterator for BTreeIterator<P> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}
