//! Consistency checks over a committed generation.
//!
//! [`StoreConnection::verify`] walks every tree of the latest generation and
//! cross-checks the node table. It reports problems instead of failing on the
//! first one, so a damaged store can be inspected before it is compacted or
//! restored.

use std::collections::HashSet;

use crate::{
    btree::{Range, TreeCheck},
    error::{FileId, Result},
    nodetable::{NodeId, term_hash},
    store::StoreConnection,
    txn::{Generation, HASH_TREE, ID_TREE, Transaction, TxnType},
};

/// Findings for one tree file.
#[derive(Debug, Clone)]
pub struct TreeReport {
    /// Index name.
    pub name: String,
    /// Structural check of the tree.
    pub check: TreeCheck,
    /// Block accounting problems: reachable blocks that are free or beyond
    /// the committed extent.
    pub problems: Vec<String>,
}

impl TreeReport {
    /// Returns true if the tree has no problems of either kind.
    pub fn is_ok(&self) -> bool {
        self.check.is_ok() && self.problems.is_empty()
    }
}

/// Result of [`StoreConnection::verify`].
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// Generation that was checked.
    pub generation: Generation,
    /// One entry per tree file, node table trees first.
    pub trees: Vec<TreeReport>,
    /// Mismatches between the node trees and the data file.
    pub node_problems: Vec<String>,
}

impl VerifyReport {
    /// Returns true if nothing was found.
    pub fn is_ok(&self) -> bool {
        self.trees.iter().all(TreeReport::is_ok) && self.node_problems.is_empty()
    }

    /// Every problem, prefixed with the tree it was found in.
    pub fn problems(&self) -> Vec<String> {
        let mut all = Vec::new();
        for tree in &self.trees {
            for problem in tree.check.problems.iter().chain(&tree.problems) {
                all.push(format!("{}: {problem}", tree.name));
            }
        }
        all.extend(self.node_problems.iter().map(|problem| format!("nodes: {problem}")));
        all
    }
}

impl StoreConnection {
    /// Checks the latest committed generation.
    ///
    /// Runs inside a read transaction, so writers may continue meanwhile.
    ///
    /// # Errors
    ///
    /// Returns an error only if the read transaction cannot begin; damage
    /// found while checking is reported in the [`VerifyReport`].
    pub fn verify(&self) -> Result<VerifyReport> {
        let txn = self.begin(TxnType::Read)?;
        let generation = txn.generation();

        let mut trees = Vec::with_capacity(self.trees.len());
        for (f, name) in self.tree_names.iter().enumerate() {
            trees.push(self.verify_tree(&txn, f as FileId, name));
        }
        let node_problems = self.verify_nodes(&txn);

        let report = VerifyReport { generation, trees, node_problems };
        if report.is_ok() {
            tracing::debug!(location = %self.location, generation = generation.raw(), "Verified store");
        } else {
            tracing::warn!(
                location = %self.location,
                generation = generation.raw(),
                problems = report.problems().len(),
                "Store verification found problems"
            );
        }
        Ok(report)
    }

    fn verify_tree(&self, txn: &Transaction<'_>, file_id: FileId, name: &str) -> TreeReport {
        let check = match txn.tree(file_id) {
            Ok(tree) => tree.check(),
            Err(err) => TreeCheck { problems: vec![err.to_string()], ..TreeCheck::default() },
        };

        let storage = &self.trees[file_id as usize];
        let committed = txn.snapshot().trees[file_id as usize];
        let mut problems = Vec::new();
        match storage.reachable(committed.root) {
            Ok(blocks) => {
                for block_id in blocks {
                    if block_id >= committed.total_blocks {
                        problems.push(format!(
                            "block {block_id} is past the committed extent {}",
                            committed.total_blocks
                        ));
                    } else if storage.allocator().is_free(block_id) {
                        problems.push(format!("block {block_id} is reachable but free"));
                    }
                }
            },
            Err(err) => problems.push(format!("walk failed: {err}")),
        }

        TreeReport { name: name.to_string(), check, problems }
    }

    fn verify_nodes(&self, txn: &Transaction<'_>) -> Vec<String> {
        let mut problems = Vec::new();
        let state = txn.snapshot();

        let hash_tree = match txn.tree(HASH_TREE) {
            Ok(tree) => tree,
            Err(err) => return vec![err.to_string()],
        };
        let scan = match txn.scan_file(ID_TREE, Range::all()) {
            Ok(scan) => scan,
            Err(err) => return vec![err.to_string()],
        };

        let mut offsets = HashSet::new();
        let mut ids = 0u64;
        for record in scan {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    problems.push(format!("id tree scan stopped: {err}"));
                    break;
                },
            };
            ids += 1;
            let id = match NodeId::from_bytes(&record.key) {
                Ok(id) => id,
                Err(err) => {
                    problems.push(err.to_string());
                    continue;
                },
            };
            match id.index() {
                Some(index) if index < state.next_node_id => {},
                _ => problems.push(format!("node {id} is outside the allocated range")),
            }

            let Ok(raw) = <[u8; 8]>::try_from(record.value.as_slice()) else {
                problems.push(format!("node {id}: offset is {} bytes", record.value.len()));
                continue;
            };
            let offset = u64::from_be_bytes(raw);
            if offset >= state.node_data_len {
                problems.push(format!(
                    "node {id}: offset {offset} is past the data length {}",
                    state.node_data_len
                ));
                continue;
            }
            if !offsets.insert(offset) {
                problems.push(format!("node {id}: offset {offset} is shared"));
            }

            let term = match self.node_table.read_entry(offset) {
                Ok(term) => term,
                Err(err) => {
                    problems.push(format!("node {id}: {err}"));
                    continue;
                },
            };
            match hash_tree.find(&term_hash(&term)) {
                Ok(Some(value)) if value == id.to_bytes() => {},
                Ok(Some(_)) => problems.push(format!("node {id}: hash entry names another id")),
                Ok(None) => problems.push(format!("node {id}: term has no hash entry")),
                Err(err) => problems.push(format!("node {id}: {err}")),
            }
        }

        match hash_tree.count() {
            Ok(hashes) if hashes != ids => {
                problems.push(format!("hash tree has {hashes} entries, id tree has {ids}"));
            },
            Ok(_) => {},
            Err(err) => problems.push(format!("hash tree count failed: {err}")),
        }
        problems
    }
}
