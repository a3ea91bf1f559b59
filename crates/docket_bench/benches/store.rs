//! Local store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docket_bench::{bench_tenant, ids, log_store, memory_store, payload};
use docket_core::Table;

/// Benchmark single writes to new entities.
fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_write");
    let tenant = bench_tenant();

    for size in [64, 1024, 8192].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("memory", size), size, |b, &size| {
            let store = memory_store();
            let body = payload(size);
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let version = store
                    .write(&tenant, Table::Cases, &format!("c-{n}"), black_box(body.clone()))
                    .unwrap();
                black_box(version);
            });
        });
        group.bench_with_input(BenchmarkId::new("log", size), size, |b, &size| {
            let (store, _dir) = log_store();
            let body = payload(size);
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let version = store
                    .write(&tenant, Table::Cases, &format!("c-{n}"), black_box(body.clone()))
                    .unwrap();
                black_box(version);
            });
        });
    }
    group.finish();
}

/// Benchmark repeated edits of one entity, the rapid-typing case.
fn bench_rewrite(c: &mut Criterion) {
    let tenant = bench_tenant();
    c.bench_function("store_rewrite_same_entity", |b| {
        let store = memory_store();
        let body = payload(256);
        b.iter(|| {
            black_box(store.write(&tenant, Table::Tasks, "t-1", body.clone()).unwrap());
        });
    });
}

/// Benchmark point reads.
fn bench_read(c: &mut Criterion) {
    let tenant = bench_tenant();
    let store = memory_store();
    let keys = ids(1000);
    for id in &keys {
        store.write(&tenant, Table::Clients, id, payload(256)).unwrap();
    }

    c.bench_function("store_read", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(store.read(&tenant, Table::Clients, &keys[i]).unwrap());
        });
    });
}

/// Benchmark full-table scans.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_scan");
    let tenant = bench_tenant();

    for count in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let store = memory_store();
            for id in ids(count) {
                store.write(&tenant, Table::Hearings, &id, payload(128)).unwrap();
            }
            b.iter(|| black_box(store.scan(&tenant, Table::Hearings).unwrap().len()));
        });
    }
    group.finish();
}

/// Benchmark acknowledging synced versions.
fn bench_mark_synced(c: &mut Criterion) {
    let tenant = bench_tenant();
    c.bench_function("store_write_then_mark_synced", |b| {
        let store = memory_store();
        let key = docket_core::EntityKey::new(Table::Documents, "d-1");
        b.iter(|| {
            let version = store.write(&tenant, Table::Documents, "d-1", payload(64)).unwrap();
            black_box(store.mark_synced(&tenant, &key, version).unwrap());
        });
    });
}

criterion_group!(benches, bench_write, bench_rewrite, bench_read, bench_scan, bench_mark_synced);
criterion_main!(benches);
