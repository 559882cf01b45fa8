//! Where a store lives.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    backend::{FileBackend, InMemoryBackend, StorageBackend},
    error::Result,
};

/// Identity of a store: a directory on disk or a named in-memory area.
///
/// Memory locations keep their files for the lifetime of the
/// [`LocationRegistry`](super::LocationRegistry) that created them, so a
/// connection can be expelled and remade to exercise recovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    /// A directory holding the store files.
    Directory(PathBuf),
    /// A named in-memory area.
    Memory(String),
}

impl Location {
    /// A directory location.
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    /// A memory location.
    pub fn memory(name: impl Into<String>) -> Self {
        Self::Memory(name.into())
    }

    /// Directory path, for directory locations.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Location::Directory(path) => Some(path),
            Location::Memory(_) => None,
        }
    }

    /// Returns true for memory locations.
    pub fn is_memory(&self) -> bool {
        matches!(self, Location::Memory(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Directory(path) => write!(f, "{}", path.display()),
            Location::Memory(name) => write!(f, "mem:{name}"),
        }
    }
}

/// Files of one memory location, by name.
#[derive(Default)]
pub(crate) struct MemoryArea {
    files: Mutex<HashMap<String, Arc<InMemoryBackend>>>,
}

impl MemoryArea {
    fn open(&self, name: &str) -> Arc<InMemoryBackend> {
        self.files
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryBackend::new(name)))
            .clone()
    }

    /// The backend of an existing file, if any.
    #[cfg(test)]
    pub(crate) fn file(&self, name: &str) -> Option<Arc<InMemoryBackend>> {
        self.files.lock().get(name).cloned()
    }
}

/// Opens the files of one location.
pub(crate) enum FileSet {
    Directory(PathBuf),
    Memory(Arc<MemoryArea>),
}

impl FileSet {
    /// Opens (creating if needed) the file called `name`.
    pub(crate) fn open(&self, name: &str) -> Result<Arc<dyn StorageBackend>> {
        match self {
            FileSet::Directory(dir) => Ok(Arc::new(FileBackend::open(dir.join(name))?)),
            FileSet::Memory(area) => Ok(area.open(name)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Location::memory("db").to_string(), "mem:db");
        assert_eq!(Location::directory("/tmp/db").to_string(), "/tmp/db");
        assert!(Location::memory("db").is_memory());
        assert!(Location::memory("db").path().is_none());
    }

    #[test]
    fn test_memory_files_persist_across_opens() {
        let files = FileSet::Memory(Arc::new(MemoryArea::default()));
        files.open("nodes.dat").unwrap().write_at(0, b"abc").unwrap();
        assert_eq!(files.open("nodes.dat").unwrap().read_all().unwrap(), b"abc");
    }
}
