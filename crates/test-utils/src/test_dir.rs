//! Temporary directories for on-disk stores.

// Test utilities are expected to panic on failure
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use quarry_store::Location;
use tempfile::TempDir;

/// A temporary directory, removed on drop.
///
/// ```
/// use quarry_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let location = dir.location("store");
/// // Make a connection at `location`...
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// Path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// `path` joined onto the directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// A store location in a subdirectory called `name`.
    #[must_use]
    pub fn location(&self, name: &str) -> Location {
        Location::directory(self.join(name))
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
