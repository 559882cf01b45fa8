//! Store benchmarks.
//!
//! Point lookups, journaled and bulk inserts, prefix scans, node id
//! allocation and compaction over triple-shaped 24-byte keys.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, sync::Arc, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use quarry_store::{Location, LocationRegistry, StoreConfig, StoreConnection, Term};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn key(s: u64, p: u64, o: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&s.to_be_bytes());
    key[8..16].copy_from_slice(&p.to_be_bytes());
    key[16..].copy_from_slice(&o.to_be_bytes());
    key
}

/// Adds `count` triples with 16 objects per subject, `batch_size` per commit.
fn populate(conn: &StoreConnection, count: u64, batch_size: u64) {
    for batch_start in (0..count).step_by(batch_size as usize) {
        let batch_end = (batch_start + batch_size).min(count);
        let mut txn = conn.begin_write().expect("write txn");
        for i in batch_start..batch_end {
            txn.insert("SPO", &key(i / 16, 1, i % 16), &[]).expect("insert");
        }
        txn.commit().expect("commit");
    }
}

fn memory_store(registry: &LocationRegistry, name: &str) -> Arc<StoreConnection> {
    registry.make(&Location::memory(name), StoreConfig::default()).expect("make store")
}

// =============================================================================
// Lookups
// =============================================================================

fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000u64, 10_000, 100_000] {
        let registry = LocationRegistry::new();
        let conn = memory_store(&registry, "lookup");
        populate(&conn, count, 5_000);

        group.bench_with_input(
            BenchmarkId::new("hit", format!("{}k", count / 1000)),
            &count,
            |b, &count| {
                let mut n = 0u64;
                b.iter(|| {
                    n = (n + 7) % count;
                    let txn = conn.begin_read().expect("read txn");
                    black_box(txn.contains("SPO", &key(n / 16, 1, n % 16)).expect("find"))
                });
            },
        );
    }
    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

/// Journaled commits to disk, including every sync.
fn bench_commit_to_disk(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/commit");

    for batch_size in [1u64, 100, 1_000] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(BenchmarkId::new("disk", batch_size), &batch_size, |b, &size| {
            let dir = TempDir::new().expect("create temp dir");
            let registry = LocationRegistry::new();
            let conn = registry
                .make(&Location::directory(dir.path().join("bench")), StoreConfig::default())
                .expect("make store");
            let mut next = 0u64;
            b.iter(|| {
                let mut txn = conn.begin_write().expect("write txn");
                for _ in 0..size {
                    txn.insert("SPO", &key(next, 2, 3), &[]).expect("insert");
                    next += 1;
                }
                txn.commit().expect("commit");
            });
        });
    }
    group.finish();
}

fn bench_bulk_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/bulk_load");
    let count = 50_000u64;
    group.throughput(Throughput::Elements(count));

    group.bench_function("50k_triples", |b| {
        b.iter(|| {
            let registry = LocationRegistry::new();
            let conn = memory_store(&registry, "bulk");
            let mut loader = conn.bulk_loader().expect("loader");
            for i in 0..count {
                loader.insert("SPO", &key(i / 16, 1, i % 16), &[]).expect("insert");
            }
            black_box(loader.finish().expect("finish"))
        });
    });
    group.finish();
}

// =============================================================================
// Scans and the node table
// =============================================================================

fn bench_prefix_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/prefix_scan");
    let registry = LocationRegistry::new();
    let conn = memory_store(&registry, "scan");
    populate(&conn, 100_000, 10_000);

    group.throughput(Throughput::Elements(16));
    group.bench_function("subject", |b| {
        let mut s = 0u64;
        b.iter(|| {
            s = (s + 13) % 6_250;
            let txn = conn.begin_read().expect("read txn");
            let found = txn.scan_prefix("SPO", &s.to_be_bytes()).expect("scan").count();
            black_box(found)
        });
    });

    group.throughput(Throughput::Elements(100_000));
    group.bench_function("full", |b| {
        b.iter(|| {
            let txn = conn.begin_read().expect("read txn");
            black_box(txn.count("SPO").expect("count"))
        });
    });
    group.finish();
}

fn bench_node_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/node_table");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("allocate_1k", |b| {
        let registry = LocationRegistry::new();
        let conn = memory_store(&registry, "nodes");
        let mut next = 0u64;
        b.iter(|| {
            let mut txn = conn.begin_write().expect("write txn");
            for _ in 0..1_000 {
                let term = Term::iri(format!("http://example.org/bench/{next}"));
                black_box(txn.get_allocate_id(&term).expect("allocate"));
                next += 1;
            }
            txn.commit().expect("commit");
        });
    });
    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("store/compaction");
    let registry = LocationRegistry::new();
    let source = memory_store(&registry, "source");
    populate(&source, 20_000, 500);

    let mut round = 0u64;
    group.bench_function("20k_after_40_commits", |b| {
        b.iter(|| {
            round += 1;
            let target = memory_store(&registry, &format!("target-{round}"));
            black_box(source.compact_into(&target).expect("compact"))
        });
    });
    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(30);
    targets = bench_commit_to_disk, bench_bulk_load, bench_node_allocation
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_prefix_scan
}

criterion_group! {
    name = compaction_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(20))
        .sample_size(10);
    targets = bench_compaction
}

criterion_main!(lookup_benches, insert_benches, scan_benches, compaction_benches);
