//! Crash recovery across every stage of the commit sequence.
//!
//! Each test writes a base generation, arms a [`CrashInjector`], runs a
//! commit that stops at the injected point, then expels and remakes the
//! location so that open runs journal replay and node data truncation.
//!
//! ```text
//! commit:
//!   1. append node data, sync        ← CrashPoint::AfterNodeData
//!   2. journal redo + state, sync    ← CrashPoint::AfterJournal
//!   3. write blocks + state slot     ← CrashPoint::AfterApply
//!   4. publish generation            ← CrashPoint::AfterPublish
//!   5. truncate journal
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use quarry_store::{
    Error, Generation, Location, LocationRegistry, NodeId, StoreConfig, StoreConnection, Term,
};
use quarry_test_utils::{CrashInjector, CrashPoint, TestDir, init_tracing};

fn iri(n: u64) -> Term {
    Term::iri(format!("http://example.org/crash/{n}"))
}

fn triple(s: NodeId, p: NodeId, o: NodeId) -> Vec<u8> {
    [s.to_bytes(), p.to_bytes(), o.to_bytes()].concat()
}

/// Adds `range` as triples `(n, p, n)` with fresh node table terms.
fn write_batch(conn: &StoreConnection, range: std::ops::Range<u64>) -> Result<(), Error> {
    let mut txn = conn.begin_write()?;
    let p = txn.get_allocate_id(&Term::iri("http://example.org/p"))?;
    for n in range {
        let id = txn.get_allocate_id(&iri(n))?;
        txn.insert("SPO", &triple(id, p, id), &[])?;
        txn.insert("POS", &triple(p, id, id), &[])?;
    }
    txn.commit()
}

fn count(conn: &StoreConnection, index: &str) -> u64 {
    conn.begin_read().unwrap().count(index).unwrap()
}

fn crash_and_recover(location: &Location, point: CrashPoint) {
    let registry = LocationRegistry::new();
    let injector = CrashInjector::new(point);

    let conn = registry.make(location, injector.config()).unwrap();
    write_batch(&conn, 0..200).unwrap();
    assert_eq!(conn.generation(), Generation(1));

    injector.arm();
    let err = write_batch(&conn, 200..400).unwrap_err();
    assert!(matches!(err, Error::CommitInterrupted { .. }), "{point:?}: {err}");
    assert!(injector.has_crashed());
    drop(conn);
    registry.expel(location).unwrap();

    let conn = registry.make(location, StoreConfig::default()).unwrap();
    let report = conn.verify().unwrap();
    assert!(report.is_ok(), "{point:?}: {:?}", report.problems());

    let txn = conn.begin_read().unwrap();
    if point.is_durable() {
        assert_eq!(conn.generation(), Generation(2), "{point:?}");
        assert_eq!(txn.count("SPO").unwrap(), 400);
        assert_eq!(txn.count("POS").unwrap(), 400);
        let id = txn.get_id(&iri(399)).unwrap().unwrap();
        assert_eq!(txn.get_term(id).unwrap(), Some(iri(399)));
    } else {
        assert_eq!(conn.generation(), Generation(1), "{point:?}");
        assert_eq!(txn.count("SPO").unwrap(), 200);
        assert_eq!(txn.get_id(&iri(399)).unwrap(), None);
    }
    drop(txn);

    // The store keeps working after recovery.
    write_batch(&conn, 400..450).unwrap();
    let expected = if point.is_durable() { 450 } else { 250 };
    assert_eq!(count(&conn, "SPO"), expected);
    assert!(conn.verify().unwrap().is_ok());
}

#[test]
fn test_recovery_on_disk_at_every_point() {
    init_tracing();
    for point in CrashPoint::ALL {
        let dir = TestDir::new();
        crash_and_recover(&dir.location("store"), point);
    }
}

#[test]
fn test_recovery_in_memory_at_every_point() {
    init_tracing();
    for point in CrashPoint::ALL {
        crash_and_recover(&Location::memory(format!("{point:?}")), point);
    }
}

#[test]
fn test_interrupted_commit_blocks_connection_until_reopen() {
    let registry = LocationRegistry::new();
    let location = Location::memory("blocked");
    let injector = CrashInjector::new(CrashPoint::AfterApply);
    let conn = registry.make(&location, injector.config()).unwrap();

    injector.arm();
    assert!(write_batch(&conn, 0..10).is_err());
    assert!(matches!(conn.begin_read(), Err(Error::RecoveryRequired)));
    assert!(matches!(conn.begin_write(), Err(Error::RecoveryRequired)));
    assert!(matches!(conn.bulk_loader(), Err(Error::RecoveryRequired)));

    drop(conn);
    registry.expel(&location).unwrap();
    let conn = registry.make(&location, StoreConfig::default()).unwrap();
    assert_eq!(count(&conn, "SPO"), 10);
}

#[test]
fn test_lost_node_ids_are_reissued() {
    let registry = LocationRegistry::new();
    let location = Location::memory("reissue");
    let injector = CrashInjector::new(CrashPoint::AfterNodeData);
    let conn = registry.make(&location, injector.config()).unwrap();
    write_batch(&conn, 0..5).unwrap();
    let node_data_len = conn.stats().node_data_len;

    injector.arm();
    assert!(write_batch(&conn, 5..10).is_err());
    drop(conn);
    registry.expel(&location).unwrap();

    let conn = registry.make(&location, StoreConfig::default()).unwrap();
    assert_eq!(conn.stats().node_data_len, node_data_len);
    let mut txn = conn.begin_write().unwrap();
    let id = txn.get_allocate_id(&iri(100)).unwrap();
    // 5 subjects plus the predicate were committed.
    assert_eq!(id.index(), Some(6));
    txn.commit().unwrap();
    assert!(conn.verify().unwrap().is_ok());
}
