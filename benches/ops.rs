//! Micro-operation benchmarks for the cache directory.
//!
//! Run with: `cargo bench --bench ops`
//!
//! Measures per-operation latency (nanoseconds) for lookups, inserts, build
//! coalescing and expiry sweeps, single-threaded and across threads.

use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use cachedir::{CacheBuilder, CacheKey, DirCache, Lookup, Timestamp};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};

const KEYS: usize = 16_384;
const OPS: u64 = 100_000;

fn keys() -> Vec<CacheKey> {
    (0..KEYS).map(|i| CacheKey::from(format!("key-{i}"))).collect()
}

fn populated(shards: usize, keys: &[CacheKey]) -> DirCache {
    let cache = CacheBuilder::new().shards(shards).try_build().unwrap();
    let payload: Arc<[u8]> = Arc::from(&[0u8; 64][..]);
    for key in keys {
        drop(cache.insert(key.clone(), Arc::clone(&payload), None).unwrap());
    }
    cache
}

// ============================================================================
// Lookup Latency (ns/op)
// ============================================================================

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_ns");
    group.throughput(Throughput::Elements(OPS));
    let keys = keys();

    for shards in [1, 16] {
        group.bench_function(format!("hit_{shards}_shards"), |b| {
            let cache = populated(shards, &keys);
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    for i in 0..OPS {
                        let key = &keys[i as usize % KEYS];
                        black_box(cache.lookup(key));
                    }
                }
                start.elapsed()
            })
        });
    }

    group.bench_function("miss", |b| {
        let cache = populated(16, &keys);
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                for i in 0..OPS {
                    black_box(cache.lookup(i.to_le_bytes()));
                }
            }
            start.elapsed()
        })
    });

    group.finish();
}

// ============================================================================
// Insert / Build Latency (ns/op)
// ============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_ns");
    group.throughput(Throughput::Elements(OPS));
    let keys = keys();
    let payload: Arc<[u8]> = Arc::from(&[0u8; 64][..]);

    group.bench_function("replace", |b| {
        let cache = populated(16, &keys);
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                for i in 0..OPS {
                    let key = keys[i as usize % KEYS].clone();
                    black_box(cache.insert(key, Arc::clone(&payload), None).ok());
                }
            }
            start.elapsed()
        })
    });

    group.bench_function("build_commit", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::ZERO;
            for _ in 0..iters {
                let cache = CacheBuilder::new().shards(16).try_build().unwrap();
                let start = Instant::now();
                for i in 0..OPS {
                    let key = keys[i as usize % KEYS].clone();
                    if let Ok(Lookup::Build(builder)) = cache.lookup_or_create(key, |_| {}) {
                        black_box(builder.commit(Arc::clone(&payload), None).ok());
                    }
                }
                elapsed += start.elapsed();
            }
            elapsed
        })
    });

    group.finish();
}

// ============================================================================
// Expiry Sweep (ns/op)
// ============================================================================

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_ns");
    group.throughput(Throughput::Elements(KEYS as u64));
    let keys = keys();
    let payload: Arc<[u8]> = Arc::from(&[0u8; 64][..]);
    let deadline = Timestamp::from_millis(1_000);

    group.bench_function("expire_all", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::ZERO;
            for _ in 0..iters {
                let cache = CacheBuilder::new().shards(16).try_build().unwrap();
                for key in &keys {
                    drop(
                        cache
                            .insert_at(key.clone(), Arc::clone(&payload), Some(deadline))
                            .unwrap(),
                    );
                }
                let start = Instant::now();
                black_box(cache.sweep(deadline));
                elapsed += start.elapsed();
            }
            elapsed
        })
    });

    group.finish();
}

// ============================================================================
// Contended Lookup (ns/op, all threads)
// ============================================================================

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_lookup_ns");
    let threads = 4;
    group.throughput(Throughput::Elements(OPS * threads as u64));
    let keys = Arc::new(keys());

    for shards in [1, 16] {
        group.bench_function(format!("{threads}_threads_{shards}_shards"), |b| {
            let cache = populated(shards, &keys);
            b.iter_custom(|iters| {
                let barrier = Arc::new(Barrier::new(threads + 1));
                let workers: Vec<_> = (0..threads)
                    .map(|t| {
                        let cache = cache.clone();
                        let keys = keys.clone();
                        let barrier = barrier.clone();
                        thread::spawn(move || {
                            barrier.wait();
                            for _ in 0..iters {
                                for i in 0..OPS {
                                    let key = &keys[(i as usize + t * 977) % KEYS];
                                    black_box(cache.lookup(key));
                                }
                            }
                        })
                    })
                    .collect();
                let start = Instant::now();
                barrier.wait();
                for worker in workers {
                    worker.join().unwrap();
                }
                start.elapsed()
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_lookup,
    bench_insert,
    bench_sweep,
    bench_contended
);
criterion_main!(benches);
