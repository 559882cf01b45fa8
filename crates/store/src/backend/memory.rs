//! In-memory storage backend.

use parking_lot::RwLock;

use super::StorageBackend;
use crate::error::Result;

/// In-memory storage backend.
///
/// Backs memory locations and tests. Data lives as long as the backend
/// value; a memory location keeps its backends alive across reconnects so
/// that recovery paths can be exercised without touching the filesystem.
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
    name: String,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new(name: impl Into<String>) -> Self {
        Self { data: RwLock::new(Vec::new()), name: name.into() }
    }

    /// Overwrites bytes in place without growing the buffer (for corruption tests).
    pub fn corrupt(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.write();
        let end = (offset + bytes.len()).min(data.len());
        if offset < end {
            data[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
