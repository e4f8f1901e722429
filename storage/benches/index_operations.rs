//! Index benchmarks: inserts, point lookups and erases in both storage
//! modes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use leafdb_storage::{BPlusTreeIndex, BytewiseComparator, IndexConfig, PoolConfig};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::{tempdir, TempDir};

const PAGE_SIZE: usize = 4096;

fn configs() -> [(&'static str, IndexConfig); 2] {
    [
        ("direct", IndexConfig::default().with_page_size(PAGE_SIZE).without_pool()),
        (
            "pooled",
            IndexConfig::default()
                .with_page_size(PAGE_SIZE)
                .with_pool(PoolConfig::default()),
        ),
    ]
}

fn shuffled_keys(count: usize) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = (0..count).map(|i| format!("key{:08}", i).into_bytes()).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(0x5eed));
    keys
}

fn build(config: &IndexConfig, keys: &[Vec<u8>]) -> (TempDir, BPlusTreeIndex) {
    let dir = tempdir().unwrap();
    let mut tree =
        BPlusTreeIndex::open(dir.path().join("bench.idx"), BytewiseComparator, config.clone()).unwrap();
    for key in keys {
        tree.insert(key, b"value-value-value").unwrap();
    }
    (dir, tree)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_insert");
    group.sample_size(10);

    for count in [1_000, 10_000] {
        let keys = shuffled_keys(count);
        group.throughput(Throughput::Elements(count as u64));

        for (name, config) in configs() {
            group.bench_with_input(BenchmarkId::new(name, count), &keys, |b, keys| {
                b.iter_with_large_drop(|| build(&config, keys));
            });
        }
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_search");
    let keys = shuffled_keys(10_000);

    for (name, config) in configs() {
        let (_dir, tree) = build(&config, &keys);
        let mut i = 0;
        group.bench_function(name, |b| {
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(tree.search(&keys[i]).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_erase(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_erase");
    group.sample_size(10);
    let keys = shuffled_keys(5_000);

    for (name, config) in configs() {
        group.bench_function(name, |b| {
            b.iter_with_setup(
                || build(&config, &keys),
                |(dir, mut tree)| {
                    for key in &keys {
                        tree.erase(key).unwrap();
                    }
                    (dir, tree)
                },
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_erase);
criterion_main!(benches);
