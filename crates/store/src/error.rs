//! Error types for the quarry storage engine.

use std::io;

use snafu::Snafu;

use crate::{params::ParamsError, txn::CommitStage};

/// Block identifier within a single block file.
///
/// Block 0 is the file meta block, so `0` also serves as the "no block"
/// sentinel (an empty tree has root 0).
pub type BlockId = u64;

/// Identifier of a block file within a store (its position in the tree list).
pub type FileId = u32;

/// Result type alias for quarry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during quarry operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A file or block is structurally invalid.
    #[snafu(display("Corrupted store: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// A block id outside the allocated extent of its file was dereferenced.
    #[snafu(display("Invalid block id {block_id} in file {file_id} (extent {extent})"))]
    InvalidBlockId {
        /// The file that was addressed.
        file_id: FileId,
        /// The offending block id.
        block_id: BlockId,
        /// Number of block slots currently allocated in the file.
        extent: u64,
    },

    /// Block checksum verification failed.
    #[snafu(display("Block {block_id} in file {file_id} checksum mismatch"))]
    BlockChecksumMismatch {
        /// The file holding the block.
        file_id: FileId,
        /// The block whose checksum failed.
        block_id: BlockId,
    },

    /// A block held a different node kind than the caller expected.
    #[snafu(display("Block kind mismatch: expected {expected:?}, found {found:?}"))]
    BlockKindMismatch {
        /// The expected kind.
        expected: BlockKind,
        /// The kind found on disk.
        found: BlockKind,
    },

    /// Invalid magic number in a file header.
    #[snafu(display("Invalid magic number in {file}"))]
    InvalidMagic {
        /// Name of the file with the bad magic.
        file: String,
    },

    /// Unsupported on-disk format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Another write transaction holds the writer lock.
    #[snafu(display("Write transaction already in progress"))]
    WriterActive,

    /// Promotion failed because a newer generation has been committed.
    #[snafu(display(
        "Promotion conflict: snapshot generation {snapshot} is older than committed generation {latest}"
    ))]
    PromotionConflict {
        /// Generation pinned by the promoting transaction.
        snapshot: u64,
        /// Latest committed generation.
        latest: u64,
    },

    /// The transaction was begun as a plain read and cannot be promoted.
    #[snafu(display("Transaction is not promotable"))]
    NotPromotable,

    /// The transaction has already committed, aborted or ended.
    #[snafu(display("Transaction is not active"))]
    TransactionNotActive,

    /// A write was attempted through a read-only transaction or view.
    #[snafu(display("Transaction is read-only"))]
    ReadOnly,

    /// Insert of an existing key with [`DuplicatePolicy::Reject`](crate::btree::DuplicatePolicy).
    #[snafu(display("Duplicate key"))]
    DuplicateKey,

    /// A key or value did not match the fixed record layout of its index.
    #[snafu(display("Record field size {actual} does not match layout size {expected}"))]
    RecordSize {
        /// Size required by the index layout.
        expected: usize,
        /// Size supplied by the caller.
        actual: usize,
    },

    /// The named index is not part of this store.
    #[snafu(display("Unknown index: {name}"))]
    UnknownIndex {
        /// The requested index name.
        name: String,
    },

    /// The location lock is held by another process or connection.
    #[snafu(display("Location is locked by process {pid}"))]
    LockHeld {
        /// Process id recorded in the lock file.
        pid: u32,
    },

    /// The lock file was written in an unknown or incompatible format.
    #[snafu(display("Incompatible lock file: {reason}"))]
    LockFormat {
        /// Description of the incompatibility.
        reason: String,
    },

    /// A journal entry could not be decoded at a position that must be valid.
    #[snafu(display("Journal corrupted at offset {position}: {reason}"))]
    JournalCorrupted {
        /// Byte offset of the bad entry.
        position: u64,
        /// Description of the problem.
        reason: String,
    },

    /// A commit failed after its journal was made durable; the connection must
    /// be reopened so that replay can complete it.
    #[snafu(display("Recovery required: reopen the location to replay the journal"))]
    RecoveryRequired,

    /// The connection was expelled from its registry and no longer accepts
    /// transactions.
    #[snafu(display("Connection to {location} is closed"))]
    ConnectionClosed {
        /// Display form of the connection's location.
        location: String,
    },

    /// The connection cannot close while transactions on it are running.
    #[snafu(display(
        "Connection to {location} is busy: {active} active transactions, writer held: {writer}"
    ))]
    ConnectionBusy {
        /// Display form of the connection's location.
        location: String,
        /// Live transactions at the time of the request.
        active: u64,
        /// Whether a writer or bulk loader held the writer lock.
        writer: bool,
    },

    /// A commit hook stopped the commit at the given stage.
    #[snafu(display("Commit interrupted at {stage:?}"))]
    CommitInterrupted {
        /// The stage at which the commit stopped.
        stage: CommitStage,
    },

    /// Store parameters failed validation.
    #[snafu(display("Invalid store parameters: {source}"))]
    InvalidParams {
        /// The validation failure.
        source: ParamsError,
    },

    /// The params file could not be parsed or written.
    #[snafu(display("Params file error: {source}"))]
    ParamsFile {
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// Bulk loading was refused.
    #[snafu(display("Bulk load rejected: {reason}"))]
    BulkLoadRejected {
        /// Why the loader could not start.
        reason: String,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<ParamsError> for Error {
    fn from(source: ParamsError) -> Self {
        Error::InvalidParams { source }
    }
}

impl Error {
    /// Returns true for contention errors the caller may retry with a fresh
    /// transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriterActive | Error::PromotionConflict { .. } | Error::ConnectionBusy { .. }
        )
    }

    /// Returns true if this error, raised inside a write transaction, must
    /// abort that transaction.
    ///
    /// Caller-level conditions (duplicate keys, bad record sizes, unknown
    /// indexes, read-only misuse) leave the transaction usable.
    pub fn aborts_transaction(&self) -> bool {
        !matches!(
            self,
            Error::DuplicateKey
                | Error::RecordSize { .. }
                | Error::UnknownIndex { .. }
                | Error::ReadOnly
                | Error::NotPromotable
                | Error::TransactionNotActive
        )
    }
}

/// Kind tag stored in the first byte of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    /// Unused block (all zeros).
    Free = 0,
    /// File meta block (always block 0).
    Meta = 1,
    /// B+ tree branch node.
    Branch = 2,
    /// B+ tree leaf node.
    Leaf = 3,
}

impl TryFrom<u8> for BlockKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Meta),
            2 => Ok(Self::Branch),
            3 => Ok(Self::Leaf),
            _ => Err(Error::Corrupted { reason: format!("Invalid block kind: {value}") }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        let display = format!("{err}");
        assert!(display.starts_with("I/O error:"), "got: {display}");
    }

    #[test]
    fn test_error_display_corrupted() {
        let err = Error::Corrupted { reason: "bad header".to_string() };
        assert_eq!(format!("{err}"), "Corrupted store: bad header");
    }

    #[test]
    fn test_error_display_invalid_block_id() {
        let err = Error::InvalidBlockId { file_id: 2, block_id: 99, extent: 10 };
        assert_eq!(format!("{err}"), "Invalid block id 99 in file 2 (extent 10)");
    }

    #[test]
    fn test_error_display_checksum_mismatch() {
        let err = Error::BlockChecksumMismatch { file_id: 0, block_id: 42 };
        assert_eq!(format!("{err}"), "Block 42 in file 0 checksum mismatch");
    }

    #[test]
    fn test_error_display_kind_mismatch() {
        let err = Error::BlockKindMismatch { expected: BlockKind::Leaf, found: BlockKind::Meta };
        let display = format!("{err}");
        assert!(display.contains("Leaf"), "got: {display}");
        assert!(display.contains("Meta"), "got: {display}");
    }

    #[test]
    fn test_error_display_promotion_conflict() {
        let err = Error::PromotionConflict { snapshot: 3, latest: 5 };
        assert_eq!(
            format!("{err}"),
            "Promotion conflict: snapshot generation 3 is older than committed generation 5"
        );
    }

    #[test]
    fn test_error_display_lock_held() {
        let err = Error::LockHeld { pid: 4242 };
        assert_eq!(format!("{err}"), "Location is locked by process 4242");
    }

    #[test]
    fn test_error_display_commit_interrupted() {
        let err = Error::CommitInterrupted { stage: CommitStage::JournalSynced };
        assert_eq!(format!("{err}"), "Commit interrupted at JournalSynced");
    }

    #[test]
    fn test_contention_errors_are_retryable() {
        assert!(Error::WriterActive.is_retryable());
        assert!(Error::PromotionConflict { snapshot: 1, latest: 2 }.is_retryable());
        assert!(
            Error::ConnectionBusy { location: "mem:a".to_string(), active: 1, writer: false }
                .is_retryable()
        );
        assert!(!Error::DuplicateKey.is_retryable());
        assert!(!Error::RecoveryRequired.is_retryable());
    }

    #[test]
    fn test_caller_errors_do_not_abort() {
        assert!(!Error::DuplicateKey.aborts_transaction());
        assert!(!Error::RecordSize { expected: 8, actual: 4 }.aborts_transaction());
        assert!(Error::Corrupted { reason: String::new() }.aborts_transaction());
        assert!(Error::BlockChecksumMismatch { file_id: 0, block_id: 1 }.aborts_transaction());
    }

    #[test]
    fn test_block_kind_round_trip() {
        for kind in [BlockKind::Free, BlockKind::Meta, BlockKind::Branch, BlockKind::Leaf] {
            assert_eq!(BlockKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(BlockKind::try_from(9).is_err());
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as StdError;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.source().is_some(), "Error::Io should have a source");
    }
}
