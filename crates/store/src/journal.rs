//! Append-only redo journal.
//!
//! A commit appends one `Redo` entry per changed block, one `State` entry
//! carrying the encoded commit state, then a `Commit` marker, and syncs.
//! Once the commit has been applied to the block files and published, the
//! journal is truncated. A journal found non-empty on open therefore holds
//! at most one committed-but-unapplied transaction (plus possibly a torn
//! tail), and replaying it is idempotent because entries carry whole block
//! images and a whole state.
//!
//! # Entry layout
//!
//! ```text
//! ┌─────────┬──────┬─────────┬──────────┬─────────┬──────────┐
//! │ len u32 │ kind │ file u32│ block u64│ payload │ xxh3 u64 │
//! └─────────┴──────┴─────────┴──────────┴─────────┴──────────┘
//! ```
//!
//! `len` is the payload length. The checksum covers header and payload.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::{
    backend::StorageBackend,
    error::{BlockId, Error, FileId, Result},
};

/// Size of the fixed entry header.
pub const ENTRY_HEADER_SIZE: usize = 17;

/// Size of the checksum trailer.
pub const ENTRY_TRAILER_SIZE: usize = 8;

/// Journal entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Full image of one block.
    Redo = 1,
    /// Encoded commit state.
    State = 2,
    /// Closes a group of entries as committed.
    Commit = 3,
    /// Discards the open group.
    Abort = 4,
}

impl EntryKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Redo),
            2 => Some(Self::State),
            3 => Some(Self::Commit),
            4 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Block file the entry applies to (0 for non-block entries).
    pub file_id: FileId,
    /// Block the entry applies to (0 for non-block entries).
    pub block_id: BlockId,
    /// Block image or encoded state.
    pub payload: Vec<u8>,
}

impl JournalEntry {
    /// A block image to re-apply.
    pub fn redo(file_id: FileId, block_id: BlockId, image: impl Into<Vec<u8>>) -> Self {
        Self { kind: EntryKind::Redo, file_id, block_id, payload: image.into() }
    }

    /// An encoded commit state.
    pub fn state(payload: impl Into<Vec<u8>>) -> Self {
        Self { kind: EntryKind::State, file_id: 0, block_id: 0, payload: payload.into() }
    }

    /// A commit marker.
    pub fn commit() -> Self {
        Self { kind: EntryKind::Commit, file_id: 0, block_id: 0, payload: Vec::new() }
    }

    /// An abort marker.
    pub fn abort() -> Self {
        Self { kind: EntryKind::Abort, file_id: 0, block_id: 0, payload: Vec::new() }
    }

    /// Bytes this entry occupies in the journal.
    pub fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.payload.len() + ENTRY_TRAILER_SIZE
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        LittleEndian::write_u32(&mut buf[0..4], self.payload.len() as u32);
        buf[4] = self.kind as u8;
        LittleEndian::write_u32(&mut buf[5..9], self.file_id);
        LittleEndian::write_u64(&mut buf[9..17], self.block_id);
        let body_end = ENTRY_HEADER_SIZE + self.payload.len();
        buf[ENTRY_HEADER_SIZE..body_end].copy_from_slice(&self.payload);
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..body_end]);
        LittleEndian::write_u64(&mut buf[body_end..], checksum);
        buf
    }
}

/// The journal file of one store.
pub struct Journal {
    backend: Arc<dyn StorageBackend>,
    /// Append position.
    end: Mutex<u64>,
}

impl Journal {
    /// Opens a journal, appending after any existing content.
    ///
    /// Callers replay and truncate a non-empty journal before writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file length cannot be read.
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let end = backend.len()?;
        Ok(Self { backend, end: Mutex::new(end) })
    }

    /// Backing file name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Appends an entry and returns its byte offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write fails.
    pub fn write(&self, entry: &JournalEntry) -> Result<u64> {
        let bytes = entry.encode();
        let mut end = self.end.lock();
        let position = *end;
        self.backend.write_at(position, &bytes)?;
        *end += bytes.len() as u64;
        Ok(position)
    }

    /// Reads the entry at `position`, returning it with the offset of the
    /// next entry. Never moves the append position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JournalCorrupted`] for a short or damaged entry.
    pub fn read(&self, position: u64) -> Result<(JournalEntry, u64)> {
        let file_len = self.backend.len()?;
        let corrupted = |reason: &str| Error::JournalCorrupted { position, reason: reason.into() };

        if position + (ENTRY_HEADER_SIZE + ENTRY_TRAILER_SIZE) as u64 > file_len {
            return Err(corrupted("truncated header"));
        }
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        self.backend.read_exact_at(position, &mut header)?;

        let len = LittleEndian::read_u32(&header[0..4]) as u64;
        let total = ENTRY_HEADER_SIZE as u64 + len + ENTRY_TRAILER_SIZE as u64;
        if position + total > file_len {
            return Err(corrupted("truncated payload"));
        }

        let mut buf = vec![0u8; total as usize];
        self.backend.read_exact_at(position, &mut buf)?;
        let body_end = ENTRY_HEADER_SIZE + len as usize;
        let stored = LittleEndian::read_u64(&buf[body_end..]);
        if xxhash_rust::xxh3::xxh3_64(&buf[..body_end]) != stored {
            return Err(corrupted("checksum mismatch"));
        }

        let kind = EntryKind::from_u8(buf[4]).ok_or_else(|| corrupted("unknown entry kind"))?;
        let entry = JournalEntry {
            kind,
            file_id: LittleEndian::read_u32(&buf[5..9]),
            block_id: LittleEndian::read_u64(&buf[9..17]),
            payload: buf[ENTRY_HEADER_SIZE..body_end].to_vec(),
        };
        Ok((entry, position + total))
    }

    /// Iterates entries from the start, stopping at a torn tail.
    pub fn entries(&self) -> Entries<'_> {
        Entries { journal: self, position: 0, done: false }
    }

    /// Groups entries into committed transactions.
    ///
    /// Groups closed by `Abort` and an unterminated tail are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the journal cannot be read.
    pub fn committed_groups(&self) -> Result<Vec<Vec<JournalEntry>>> {
        let mut groups = Vec::new();
        let mut open = Vec::new();
        for item in self.entries() {
            let (_, entry) = item?;
            match entry.kind {
                EntryKind::Redo | EntryKind::State => open.push(entry),
                EntryKind::Commit => groups.push(std::mem::take(&mut open)),
                EntryKind::Abort => open.clear(),
            }
        }
        if !open.is_empty() {
            tracing::debug!(
                journal = self.name(),
                entries = open.len(),
                "Dropping unterminated journal tail"
            );
        }
        Ok(groups)
    }

    /// Makes appended entries durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.backend.sync()
    }

    /// Empties the journal and syncs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the truncate or sync fails.
    pub fn truncate(&self) -> Result<()> {
        let mut end = self.end.lock();
        self.backend.set_len(0)?;
        self.backend.sync()?;
        *end = 0;
        Ok(())
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        *self.end.lock() == 0
    }

    /// Current append position.
    pub fn position(&self) -> u64 {
        *self.end.lock()
    }
}

/// Iterator over `(position, entry)` pairs.
pub struct Entries<'a> {
    journal: &'a Journal,
    position: u64,
    done: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<(u64, JournalEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.journal.read(self.position) {
            Ok((entry, next)) => {
                let position = self.position;
                self.position = next;
                Some(Ok((position, entry)))
            },
            Err(Error::JournalCorrupted { position, reason }) => {
                self.done = true;
                let file_len = self.journal.backend.len().unwrap_or(0);
                if position < file_len {
                    tracing::debug!(
                        journal = self.journal.name(),
                        position,
                        reason = %reason,
                        "Journal ends in a torn entry"
                    );
                }
                None
            },
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}
