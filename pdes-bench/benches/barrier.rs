//! Spin barrier round-trip latency.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use pdes_core::SpinBarrier;

/// Runs `rounds` barrier rounds on `threads` threads and returns the
/// wall-clock time of the slowest one.
fn rounds(threads: usize, rounds: u64) -> Duration {
    let barrier = Arc::new(SpinBarrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let start = Instant::now();
                for _ in 0..rounds {
                    barrier.wait();
                }
                start.elapsed()
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .max()
        .unwrap_or_default()
}

fn bench_barrier(c: &mut Criterion) {
    let mut group = c.benchmark_group("spin_barrier");
    let available = thread::available_parallelism().map_or(2, |n| n.get());

    for threads in [2usize, 4, 8].into_iter().filter(|&t| t <= available) {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter_custom(|iters| rounds(threads, iters));
        });
    }
    group.finish();
}

criterion_group!(barrier_benches, bench_barrier);
criterion_main!(barrier_benches);
