//! Benchmarks for block erasure coding
//!
//! Run with: cargo bench --package xyzfs-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use xyzfs_core::erasure::{ErasureConfig, ErasureEncoder};

/// Generate data shard contents of the given fill level
fn generate_shards(count: usize, len: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| (0..len).map(|j| ((i + j) % 256) as u8).collect())
        .collect()
}

/// Encode a full block at various shard sizes
fn bench_encode_block(c: &mut Criterion) {
    let encoder = ErasureEncoder::new().unwrap();
    let data_shards = encoder.config().data_shards;

    let mut group = c.benchmark_group("erasure_encode_block");

    for shard_size in [
        256 * 1024,       // 256 KB
        1024 * 1024,      // 1 MB
        4 * 1024 * 1024,  // 4 MB
    ] {
        let shards = generate_shards(data_shards, shard_size / 2);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();

        group.throughput(Throughput::Bytes((shard_size * data_shards) as u64));
        group.bench_with_input(
            BenchmarkId::new("half_full", format!("{}KB", shard_size / 1024)),
            &refs,
            |b, refs| b.iter(|| encoder.encode_block(black_box(refs), shard_size)),
        );
    }

    group.finish();
}

/// Reconstruct after losing the maximum number of shards
fn bench_reconstruct(c: &mut Criterion) {
    let config = ErasureConfig::default();
    let encoder = ErasureEncoder::with_config(config).unwrap();
    let shard_size = 1024 * 1024;
    let shards = generate_shards(config.data_shards, shard_size);
    let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
    let parity = encoder.encode_block(&refs, shard_size).unwrap();
    let full: Vec<Vec<u8>> = shards.iter().cloned().chain(parity).collect();

    c.bench_function("erasure_reconstruct_1MB", |b| {
        b.iter(|| {
            let mut damaged: Vec<Option<Vec<u8>>> = full.iter().cloned().map(Some).collect();
            for slot in damaged.iter_mut().take(config.max_failures()) {
                *slot = None;
            }
            encoder.reconstruct(black_box(&mut damaged))
        })
    });
}

criterion_group!(benches, bench_encode_block, bench_reconstruct);
criterion_main!(benches);
