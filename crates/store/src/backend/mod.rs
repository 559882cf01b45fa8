//! Storage backend abstraction for the store engine.
//!
//! A backend is a byte-addressed file with positional reads and writes. Every
//! on-disk artifact of a store goes through this trait: block files (one per
//! B+ tree), the journal, the node data file and the commit state file.
//!
//! Two implementations exist: [`FileBackend`] for directory locations and
//! [`InMemoryBackend`] for memory locations and tests.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use crate::error::{Error, Result};

/// Positional byte storage.
///
/// Reads take `&self` and never disturb a concurrent writer's position, so
/// journal replay and random-access reads are safe while entries are appended.
pub trait StorageBackend: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning the number read.
    ///
    /// A short count means end of file was reached.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `data` at `offset`, extending the file if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Returns the current length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn len(&self) -> Result<u64>;

    /// Truncates or extends the file to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be resized.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Name of the backing file, for logs and error messages.
    fn name(&self) -> &str;

    /// Returns true if the file holds no bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] with `UnexpectedEof` if the file is too short.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let read = self.read_at(offset, buf)?;
        if read < buf.len() {
            return Err(Error::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "{}: wanted {} bytes at offset {offset}, got {read}",
                        self.name(),
                        buf.len()
                    ),
                ),
            });
        }
        Ok(())
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_all(&self) -> Result<Vec<u8>> {
        let len = self.len()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact_at(0, &mut buf)?;
        Ok(buf)
    }
}
