//! File-based storage backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_at()` takes `&self` and never touches the file cursor, allowing
//! concurrent reads from multiple threads with zero synchronization.
//!
//! Writes are serialized via a [`parking_lot::Mutex`] guard (a unit `()`
//! sentinel, not wrapping the `File`) so that file extension and the write
//! that follows it cannot interleave with another writer.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::Path,
};

use parking_lot::Mutex;

use super::StorageBackend;
use crate::error::Result;

/// File-based storage backend.
///
/// Durability requires the caller to invoke [`sync`](StorageBackend::sync)
/// after writes; data is not guaranteed on disk until `fsync` completes.
pub struct FileBackend {
    /// The underlying file handle.
    file: File,
    /// Serializes writes and resizes.
    write_lock: Mutex<()>,
    /// Display name (file path).
    name: String,
}

impl FileBackend {
    /// Opens the file at `path`, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        Ok(Self { file, write_lock: Mutex::new(()), name: path.display().to_string() })
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = read_at_offset(&self.file, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_all_at_offset(&self.file, data, offset)
    }

    fn len(&self) -> Result<u64> {
        // metadata() takes &self, so no lock.
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    Ok(file.read_at(buf, offset)?)
}

/// Windows fallback: `seek_read` moves the file cursor. Positional reads in
/// this crate never depend on the cursor, so this is still correct.
#[cfg(windows)]
fn read_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    Ok(file.seek_read(buf, offset)?)
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
