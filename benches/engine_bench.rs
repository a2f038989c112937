//! CANOPY - Performance Benchmarks
//! Measures throughput of data source flushes and reads using Criterion.

use std::path::Path;
use std::sync::Arc;

use canopy::{Config, Context, DataSource, DigestKind, HashRecord, LeafRecord, TableConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn open_table(dir: &Path, threshold: i64) -> (Context, Arc<DataSource>) {
    let context = Context::new(Config::new(dir).with_sync_writes(false)).unwrap();
    let db = context.default_instance().unwrap();
    let config = TableConfig::new(DigestKind::Sha384, 1 << 20, threshold).unwrap();
    let ds = db.create_data_source("bench", &config, false).unwrap();
    (context, ds)
}

fn records(first: i64, last: i64) -> (Vec<HashRecord>, Vec<LeafRecord>) {
    let hashes = (0..=last)
        .map(|path| HashRecord::new(path, vec![(path % 251) as u8; 48]))
        .collect();
    let leaves = (first..=last)
        .map(|path| {
            LeafRecord::new(
                path,
                format!("key_{:08}", path).into_bytes(),
                format!("value_{:08}", path).into_bytes(),
            )
        })
        .collect();
    (hashes, leaves)
}

fn bench_save_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("save_records");
    group.sample_size(20);

    for size in [100i64, 1000] {
        group.bench_with_input(BenchmarkId::new("flush", size), &size, |b, &size| {
            let dir = tempfile::tempdir().unwrap();
            let (_context, ds) = open_table(dir.path(), size / 2);
            b.iter(|| {
                let (hashes, leaves) = records(size - 1, 2 * size - 2);
                ds.save_records(size - 1, 2 * size - 2, hashes, leaves, vec![], false)
                    .unwrap();
            });
            ds.close().unwrap();
        });
    }

    group.finish();
}

fn bench_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("reads");
    let dir = tempfile::tempdir().unwrap();
    let (_context, ds) = open_table(dir.path(), 1000);
    let (hashes, leaves) = records(999, 1998);
    ds.save_records(999, 1998, hashes, leaves, vec![], false)
        .unwrap();

    group.bench_function("load_leaf_record", |b| {
        b.iter(|| black_box(ds.load_leaf_record(b"key_00001500").unwrap()));
    });

    group.bench_function("load_leaf_record_by_path", |b| {
        b.iter(|| black_box(ds.load_leaf_record_by_path(black_box(1500)).unwrap()));
    });

    group.bench_function("load_hash_ram", |b| {
        b.iter(|| black_box(ds.load_hash(black_box(500)).unwrap()));
    });

    group.bench_function("load_hash_disk", |b| {
        b.iter(|| black_box(ds.load_hash(black_box(1500)).unwrap()));
    });

    group.bench_function("find_key_miss", |b| {
        b.iter(|| black_box(ds.find_key(b"nonexistent_key").unwrap()));
    });

    group.finish();
    ds.close().unwrap();
}

criterion_group!(benches, bench_save_records, bench_reads);
criterion_main!(benches);
