//! Persistent store parameters.
//!
//! Parameters are written to `params.json` when a location is created. On
//! reopen, the persisted block size and index layout are authoritative; only
//! the cache sizes may be changed by the caller.

use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{
    codec::{BLOCK_HEADER_SIZE, BRANCH_POINTER_SIZE},
    error::{Error, Result},
};

/// Format version written to `params.json`, block meta blocks and the state file.
pub const FORMAT_VERSION: u16 = 1;

/// Default block size: 8 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Name of the tree mapping term hashes to node ids.
pub const NODE_HASH_INDEX: &str = "nodes-hash";

/// Name of the tree mapping node ids to data file offsets.
pub const NODE_ID_INDEX: &str = "nodes-id";

/// Width of a node id in index records.
pub const NODE_ID_LEN: usize = 8;

/// Width of a term hash key (XXH3-128).
pub const TERM_HASH_LEN: usize = 16;

/// Parameter validation error.
#[derive(Debug, Snafu)]
pub enum ParamsError {
    /// A parameter is outside its valid range or conflicts with another.
    #[snafu(display("invalid params: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Layout of one fixed-length record index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name; also the stem of its block file.
    pub name: String,
    /// Key width in bytes.
    pub key_len: usize,
    /// Value width in bytes (0 for set-membership indexes).
    #[serde(default)]
    pub value_len: usize,
}

impl IndexSpec {
    /// Creates an index layout.
    pub fn new(name: impl Into<String>, key_len: usize, value_len: usize) -> Self {
        Self { name: name.into(), key_len, value_len }
    }

    /// Total record width.
    pub fn record_len(&self) -> usize {
        self.key_len + self.value_len
    }
}

/// Parameters describing the physical layout and cache sizing of a store.
///
/// # Validation Rules
///
/// - `block_size` must be a power of two in 512..=65536
/// - cache sizes must be at least 1
/// - index names must be unique, non-empty and not reserved for the node table
/// - every index must fit three records per leaf and two keys per branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    /// On-disk format version.
    #[serde(default = "default_format_version")]
    pub format_version: u16,
    /// Block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Blocks cached per block file.
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: usize,
    /// Terms cached by the node table.
    #[serde(default = "default_node_cache_size")]
    pub node_cache_size: usize,
    /// Record indexes, in file order after the two node table trees.
    #[serde(default = "default_indexes")]
    pub indexes: Vec<IndexSpec>,
}

#[bon::bon]
impl StoreParams {
    /// Creates validated parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError::Validation`] if any rule listed on the type is violated.
    #[builder]
    pub fn new(
        #[builder(default = default_block_size())] block_size: usize,
        #[builder(default = default_block_cache_size())] block_cache_size: usize,
        #[builder(default = default_node_cache_size())] node_cache_size: usize,
        #[builder(default = default_indexes())] indexes: Vec<IndexSpec>,
    ) -> std::result::Result<Self, ParamsError> {
        let params = Self {
            format_version: FORMAT_VERSION,
            block_size,
            block_cache_size,
            node_cache_size,
            indexes,
        };
        params.validate()?;
        Ok(params)
    }
}

impl StoreParams {
    /// Validates the parameter values.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError::Validation`] describing the first violated rule.
    pub fn validate(&self) -> std::result::Result<(), ParamsError> {
        if self.format_version != FORMAT_VERSION {
            return Err(invalid(format!(
                "format_version {} is not supported (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(invalid(format!(
                "block_size must be a power of two in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}, got {}",
                self.block_size
            )));
        }
        if self.block_cache_size == 0 {
            return Err(invalid("block_cache_size must be >= 1".to_string()));
        }
        if self.node_cache_size == 0 {
            return Err(invalid("node_cache_size must be >= 1".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.indexes {
            if spec.name.is_empty() || spec.name.contains(['/', '\\', '.']) {
                return Err(invalid(format!("index name {:?} is not a valid file stem", spec.name)));
            }
            if spec.name == NODE_HASH_INDEX || spec.name == NODE_ID_INDEX {
                return Err(invalid(format!("index name {} is reserved", spec.name)));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(invalid(format!("index name {} is used twice", spec.name)));
            }
            if spec.key_len == 0 {
                return Err(invalid(format!("index {} has an empty key", spec.name)));
            }
        }

        for spec in self.all_trees() {
            let payload = self.block_size - BLOCK_HEADER_SIZE;
            if payload / spec.record_len() < 3 {
                return Err(invalid(format!(
                    "index {} records of {} bytes do not fit three per block",
                    spec.name,
                    spec.record_len()
                )));
            }
            if (payload - BRANCH_POINTER_SIZE) / (spec.key_len + BRANCH_POINTER_SIZE) < 2 {
                return Err(invalid(format!(
                    "index {} keys of {} bytes do not fit two per branch",
                    spec.name, spec.key_len
                )));
            }
        }
        Ok(())
    }

    /// Every tree in file order: the node hash tree, the node id tree, then
    /// the configured indexes.
    pub fn all_trees(&self) -> Vec<IndexSpec> {
        let mut trees = Vec::with_capacity(self.indexes.len() + 2);
        trees.push(IndexSpec::new(NODE_HASH_INDEX, TERM_HASH_LEN, NODE_ID_LEN));
        trees.push(IndexSpec::new(NODE_ID_INDEX, NODE_ID_LEN, 8));
        trees.extend(self.indexes.iter().cloned());
        trees
    }

    /// Parses and validates parameters from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamsFile`] if the bytes are not valid JSON and
    /// [`Error::InvalidParams`] if validation fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let params: StoreParams =
            serde_json::from_slice(bytes).map_err(|source| Error::ParamsFile { source })?;
        params.validate()?;
        Ok(params)
    }

    /// Serializes parameters as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParamsFile`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|source| Error::ParamsFile { source })
    }

    /// Reads and validates parameters from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn read_from(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read(path)?)
    }

    /// Writes parameters as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] or [`Error::ParamsFile`] on failure.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Merges caller-supplied parameters into persisted ones.
    ///
    /// The persisted layout wins; cache sizes follow the caller. A caller
    /// asking for a different block size or index layout gets a warning.
    pub fn merge_runtime(mut self, requested: &StoreParams) -> Self {
        if requested.block_size != self.block_size || requested.indexes != self.indexes {
            tracing::warn!(
                persisted_block_size = self.block_size,
                requested_block_size = requested.block_size,
                "Ignoring layout parameters that differ from the persisted store"
            );
        }
        self.block_cache_size = requested.block_cache_size;
        self.node_cache_size = requested.node_cache_size;
        self
    }
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            block_size: default_block_size(),
            block_cache_size: default_block_cache_size(),
            node_cache_size: default_node_cache_size(),
            indexes: default_indexes(),
        }
    }
}

fn invalid(message: String) -> ParamsError {
    ParamsError::Validation { message }
}

fn default_format_version() -> u16 {
    FORMAT_VERSION
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_block_cache_size() -> usize {
    1024
}

fn default_node_cache_size() -> usize {
    10_000
}

/// Triple indexes over three node ids, no values.
fn default_indexes() -> Vec<IndexSpec> {
    ["SPO", "POS", "OSP"]
        .into_iter()
        .map(|name| IndexSpec::new(name, 3 * NODE_ID_LEN, 0))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let params = StoreParams::builder().build().expect("defaults should be valid");
        assert_eq!(params.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(params.indexes.len(), 3);
        assert_eq!(params, StoreParams::default());
    }

    #[test]
    fn test_block_size_must_be_power_of_two() {
        let err = StoreParams::builder().block_size(3000).build().unwrap_err();
        assert!(err.to_string().contains("block_size"), "got: {err}");

        assert!(StoreParams::builder().block_size(256).build().is_err());
        assert!(StoreParams::builder().block_size(MAX_BLOCK_SIZE * 2).build().is_err());
        assert!(StoreParams::builder().block_size(MIN_BLOCK_SIZE).build().is_ok());
    }

    #[test]
    fn test_reserved_and_duplicate_names_rejected() {
        let reserved = StoreParams::builder()
            .indexes(vec![IndexSpec::new(NODE_ID_INDEX, 8, 0)])
            .build()
            .unwrap_err();
        assert!(reserved.to_string().contains("reserved"));

        let duplicate = StoreParams::builder()
            .indexes(vec![IndexSpec::new("a", 8, 0), IndexSpec::new("a", 4, 4)])
            .build()
            .unwrap_err();
        assert!(duplicate.to_string().contains("twice"));
    }

    #[test]
    fn test_record_must_fit_block() {
        let err = StoreParams::builder()
            .block_size(512)
            .indexes(vec![IndexSpec::new("wide", 200, 0)])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("wide"), "got: {err}");
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.json");
        let params = StoreParams::builder()
            .block_size(4096)
            .indexes(vec![IndexSpec::new("ints", 8, 4)])
            .build()
            .unwrap();

        params.write_to(&path).unwrap();
        let loaded = StoreParams::read_from(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let params: StoreParams = serde_json::from_str(r#"{"block_size": 4096}"#).unwrap();
        assert_eq!(params.block_size, 4096);
        assert_eq!(params.block_cache_size, 1024);
        assert_eq!(params.indexes, default_indexes());
    }

    #[test]
    fn test_merge_keeps_persisted_layout() {
        let persisted = StoreParams::builder().block_size(4096).build().unwrap();
        let requested = StoreParams::builder().block_size(8192).block_cache_size(7).build().unwrap();

        let merged = persisted.merge_runtime(&requested);
        assert_eq!(merged.block_size, 4096);
        assert_eq!(merged.block_cache_size, 7);
    }

    #[test]
    fn test_all_trees_order() {
        let params = StoreParams::default();
        let names: Vec<_> = params.all_trees().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec![NODE_HASH_INDEX, NODE_ID_INDEX, "SPO", "POS", "OSP"]);
    }
}
