//! Location lock file.
//!
//! A directory location is owned by one connection at a time. Ownership is an
//! advisory exclusive lock (`flock` on Unix, `LockFileEx` on Windows) on
//! `quarry.lock`, which the OS drops if the process dies. The file records the
//! owner's pid so that a rejected caller can report who holds it:
//!
//! ```text
//! quarry-lock 1
//! 4242
//! ```
//!
//! A file with content but no OS lock was left by a process that exited
//! without releasing; it is taken over.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;

use crate::{
    error::{Error, Result},
    params::FORMAT_VERSION,
};

const LOCK_TAG: &str = "quarry-lock";

/// Exclusive ownership of a directory location.
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Creates an unowned handle for the lock file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: None }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while this handle holds the lock.
    pub fn is_owned(&self) -> bool {
        self.file.is_some()
    }

    /// Returns true if [`obtain`](Self::obtain) would currently succeed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockFormat`] for a foreign or incompatible file and
    /// [`Error::Io`] if it cannot be opened.
    pub fn can_obtain(&self) -> Result<bool> {
        if self.is_owned() {
            return Ok(true);
        }
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        parse_owner(&read_content(&mut file)?)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                FileExt::unlock(&file)?;
                Ok(true)
            },
            Err(err) if is_contended(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Takes the lock and records this process as its owner.
    ///
    /// Obtaining a lock this handle already owns does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockHeld`] if another handle owns the lock,
    /// [`Error::LockFormat`] for a foreign or incompatible file, and
    /// [`Error::Io`] on filesystem errors.
    pub fn obtain(&mut self) -> Result<()> {
        if self.is_owned() {
            return Ok(());
        }
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&self.path)?;
        let previous = parse_owner(&read_content(&mut file)?)?;

        if let Err(err) = file.try_lock_exclusive() {
            if is_contended(&err) {
                let pid = previous.unwrap_or(0);
                tracing::debug!(path = %self.path.display(), pid, "Location lock is held");
                return Err(Error::LockHeld { pid });
            }
            return Err(err.into());
        }

        if let Some(pid) = previous {
            tracing::warn!(
                path = %self.path.display(),
                stale_pid = pid,
                "Taking over lock file left by a process that did not release it"
            );
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{LOCK_TAG} {FORMAT_VERSION}\n{}\n", std::process::id())?;
        file.sync_all()?;
        self.file = Some(file);
        Ok(())
    }

    /// Clears the owner record and drops the lock.
    ///
    /// The file itself is left in place. Releasing an unowned handle does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be cleared or unlocked.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        file.set_len(0)?;
        file.sync_all()?;
        FileExt::unlock(&file)?;
        tracing::debug!(path = %self.path.display(), "Released location lock");
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::error!(
                path = %self.path.display(),
                error = %err,
                "Failed to release location lock"
            );
        }
    }
}

impl std::fmt::Debug for LockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFile")
            .field("path", &self.path)
            .field("owned", &self.is_owned())
            .finish()
    }
}

fn read_content(file: &mut File) -> Result<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content).map_err(|_| Error::LockFormat {
        reason: "lock file is not text".to_string(),
    })?;
    Ok(content)
}

/// Parses the recorded owner; an empty file has none.
///
/// An unreadable pid on an otherwise valid file is treated as unknown.
fn parse_owner(content: &str) -> Result<Option<u32>> {
    if content.is_empty() {
        return Ok(None);
    }
    let mut lines = content.lines();
    let header = lines.next().unwrap_or_default();
    let version = header
        .strip_prefix(LOCK_TAG)
        .map(str::trim)
        .ok_or_else(|| Error::LockFormat { reason: format!("unexpected header {header:?}") })?;
    if version != FORMAT_VERSION.to_string() {
        return Err(Error::LockFormat {
            reason: format!("lock format {version}, expected {FORMAT_VERSION}"),
        });
    }
    Ok(Some(lines.next().and_then(|pid| pid.trim().parse().ok()).unwrap_or(0)))
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
