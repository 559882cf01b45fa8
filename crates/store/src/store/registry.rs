//! Explicit registry of open connections.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{
    StoreConfig, StoreConnection,
    location::{FileSet, Location, MemoryArea},
};
use crate::error::{Error, Result};

/// Hands out one shared [`StoreConnection`] per [`Location`].
///
/// A registry is an ordinary value: callers create one and pass it by
/// reference, and tests use one per case to stay isolated. Memory locations
/// keep their files in the registry until [`reset`](Self::reset), so an
/// expelled memory store can be reconnected (and recovered) like a directory.
#[derive(Default)]
pub struct LocationRegistry {
    connections: Mutex<HashMap<Location, Arc<StoreConnection>>>,
    areas: Mutex<HashMap<String, Arc<MemoryArea>>>,
}

impl LocationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection for `location`, opening (and creating or
    /// recovering) the store if none is registered.
    ///
    /// `config` is ignored when a connection already exists.
    ///
    /// # Errors
    ///
    /// Returns any error from opening the store, such as
    /// [`Error::LockHeld`](crate::Error::LockHeld) or a replay failure.
    pub fn make(&self, location: &Location, config: StoreConfig) -> Result<Arc<StoreConnection>> {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(location) {
            return Ok(Arc::clone(conn));
        }

        let files = match location {
            Location::Directory(path) => FileSet::Directory(path.clone()),
            Location::Memory(name) => {
                FileSet::Memory(Arc::clone(self.areas.lock().entry(name.clone()).or_default()))
            },
        };
        let conn = Arc::new(StoreConnection::open(location.clone(), files, config)?);
        connections.insert(location.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// The registered connection for `location`, if any.
    pub fn get(&self, location: &Location) -> Option<Arc<StoreConnection>> {
        self.connections.lock().get(location).cloned()
    }

    /// Returns true if `location` has a registered connection.
    pub fn contains(&self, location: &Location) -> bool {
        self.connections.lock().contains_key(location)
    }

    /// Every location with a registered connection.
    pub fn locations(&self) -> Vec<Location> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Closes and unregisters the connection for `location`.
    ///
    /// Outstanding handles to the connection stay valid but refuse new
    /// transactions. Returns false if nothing was registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionBusy`](crate::Error::ConnectionBusy) while a
    /// transaction or bulk load on the connection is running; the connection
    /// then stays registered and open. Returns [`Error::Io`](crate::Error::Io)
    /// if the location lock cannot be released.
    pub fn expel(&self, location: &Location) -> Result<bool> {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get(location) else {
            return Ok(false);
        };
        let closed = conn.close();
        if !matches!(closed, Err(Error::ConnectionBusy { .. })) {
            connections.remove(location);
        }
        closed?;
        tracing::info!(location = %location, "Expelled store connection");
        Ok(true)
    }

    /// Expels every connection and forgets all memory locations.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while closing. Busy connections stay
    /// registered; every other connection is expelled.
    pub fn reset(&self) -> Result<()> {
        let mut connections = self.connections.lock();
        let mut result = Ok(());
        connections.retain(|location, conn| match conn.close() {
            Ok(()) => false,
            Err(err) => {
                tracing::warn!(location = %location, error = %err, "Failed to close connection");
                let busy = matches!(err, Error::ConnectionBusy { .. });
                if result.is_ok() {
                    result = Err(err);
                }
                busy
            },
        });
        drop(connections);
        self.areas.lock().clear();
        result
    }

    /// Files of a memory location.
    #[cfg(test)]
    pub(crate) fn memory_area(&self, name: &str) -> Option<Arc<MemoryArea>> {
        self.areas.lock().get(name).cloned()
    }
}

impl std::fmt::Debug for LocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationRegistry").field("locations", &self.locations()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_make_returns_shared_connection() {
        let registry = LocationRegistry::new();
        let location = Location::memory("shared");
        let a = registry.make(&location, StoreConfig::default()).unwrap();
        let b = registry.make(&location, StoreConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.contains(&location));
        assert!(Arc::ptr_eq(&registry.get(&location).unwrap(), &a));
    }

    #[test]
    fn test_expel_closes_connection() {
        let registry = LocationRegistry::new();
        let location = Location::memory("expel");
        let conn = registry.make(&location, StoreConfig::default()).unwrap();

        assert!(registry.expel(&location).unwrap());
        assert!(!registry.expel(&location).unwrap());
        assert!(conn.is_closed());
        assert!(matches!(conn.begin_read(), Err(Error::ConnectionClosed { .. })));
    }

    #[test]
    fn test_expel_refused_during_bulk_load() {
        let registry = LocationRegistry::new();
        let location = Location::memory("loading");
        let conn = registry.make(&location, StoreConfig::default()).unwrap();

        let mut loader = conn.bulk_loader().unwrap();
        loader.insert("SPO", &[1u8; 24], &[]).unwrap();
        let err = registry.expel(&location).unwrap_err();
        assert!(matches!(err, Error::ConnectionBusy { active: 0, writer: true, .. }));
        assert!(!conn.is_closed());

        loader.finish().unwrap();
        assert!(registry.expel(&location).unwrap());
        assert!(matches!(conn.bulk_loader(), Err(Error::ConnectionClosed { .. })));
    }

    #[test]
    fn test_memory_data_survives_expel_until_reset() {
        let registry = LocationRegistry::new();
        let location = Location::memory("survive");
        let key = [7u8; 24];

        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        let mut txn = conn.begin_write().unwrap();
        txn.insert("SPO", &key, &[]).unwrap();
        txn.commit().unwrap();
        registry.expel(&location).unwrap();

        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        assert!(conn.begin_read().unwrap().contains("SPO", &key).unwrap());

        registry.reset().unwrap();
        assert!(registry.locations().is_empty());
        let conn = registry.make(&location, StoreConfig::default()).unwrap();
        assert!(!conn.begin_read().unwrap().contains("SPO", &key).unwrap());
    }

    #[test]
    fn test_directory_is_locked_per_registry() {
        let dir = tempdir().unwrap();
        let location = Location::directory(dir.path().join("db"));

        let first = LocationRegistry::new();
        first.make(&location, StoreConfig::default()).unwrap();

        let second = LocationRegistry::new();
        assert!(matches!(
            second.make(&location, StoreConfig::default()),
            Err(Error::LockHeld { .. })
        ));

        first.expel(&location).unwrap();
        second.make(&location, StoreConfig::default()).unwrap();
    }
}
