//! quarry-store: a transactional B+ tree store for fixed-length records.
//!
//! A store holds a set of named indexes of fixed-size records plus a node
//! table mapping RDF terms to 8-byte node ids. One writer and any number of
//! readers run concurrently; readers see the generation they pinned and never
//! block.
//!
//! - **Copy-on-write trees**: a writer never touches a block a reader can see
//! - **Checksummed blocks**: XXH3-64 over every block image
//! - **Redo journal**: commits are durable once the journal is synced and are
//!   completed by replay after a crash
//! - **Dual-slot state file**: the committed roots switch atomically
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      LocationRegistry / StoreConnection      │
//! │   (open, recover, begin, bulk load, verify)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer                │
//! │ (snapshots, promotion, journaled commit)     │
//! └──────┬─────────────────────────────┬────────┘
//!        │                             │
//! ┌──────▼──────────────┐   ┌──────────▼────────┐
//! │    B+ Tree Layer     │   │    Node Table     │
//! │ (find, scan, insert) │   │ (term <-> NodeId) │
//! └──────┬──────────────┘   └──────────┬────────┘
//!        │                             │
//! ┌──────▼─────────────────────────────▼────────┐
//! │     Block Layer (views, allocator, cache)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                   │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use quarry_store::{Location, LocationRegistry, StoreConfig, Term};
//!
//! let registry = LocationRegistry::new();
//! let conn = registry.make(&Location::memory("demo"), StoreConfig::default())?;
//!
//! let mut txn = conn.begin_write()?;
//! let s = txn.get_allocate_id(&Term::iri("http://example.org/s"))?;
//! let mut key = s.to_bytes().to_vec();
//! key.extend_from_slice(&[0; 16]);
//! txn.insert("SPO", &key, &[])?;
//! txn.commit()?;
//!
//! let txn = conn.begin_read()?;
//! assert!(txn.contains("SPO", &key)?);
//! # Ok::<(), quarry_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// B+ tree operations use complex return types for split propagation
#![allow(clippy::type_complexity)]

pub mod backend;
pub mod block;
pub mod btree;
pub mod codec;
pub mod error;
pub mod integrity;
pub mod journal;
pub mod nodetable;
pub mod params;
pub mod store;
pub mod txn;

pub use backend::{FileBackend, InMemoryBackend, StorageBackend};
pub use btree::{BPlusTree, Bound, DuplicatePolicy, Range, TreeCheck};
pub use codec::Record;
pub use error::{BlockId, Error, FileId, Result};
pub use integrity::{TreeReport, VerifyReport};
pub use nodetable::{NodeId, Term};
pub use params::{IndexSpec, StoreParams};
pub use store::{
    BulkLoader, Location, LocationRegistry, LockFile, StoreConfig, StoreConnection, StoreStats,
    TreeStats,
};
pub use txn::{
    CommitHook, CommitStage, Generation, PromoteMode, Scan, Transaction, TxnType, WriterPolicy,
};
