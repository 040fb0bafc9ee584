//! Work item hand-off cost through the pthreads queue and pool

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sockserve_core::runnable::WorkItem;
use sockserve_runtime::{Block, PlatformThreadingFactory, Take, ThreadPool, ThreadPoolQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

fn queue_add_take(c: &mut Criterion) {
    let queue = ThreadPoolQueue::new(&PlatformThreadingFactory::new(), "bench").unwrap();

    c.bench_function("queue_add_take", |b| {
        b.iter(|| {
            queue.add_request(WorkItem::from_fn(|| {})).unwrap();
            match queue.take_request(Block::No) {
                Take::Item(item) => black_box(item.execute()),
                _ => unreachable!(),
            };
        })
    });
}

fn pool_round_trip(c: &mut Criterion) {
    const BATCH: usize = 1000;
    let mut group = c.benchmark_group("pool_batch");
    group.throughput(Throughput::Elements(BATCH as u64));

    for workers in [1usize, 2, 4] {
        let mut pool = ThreadPool::new(Arc::new(PlatformThreadingFactory::new()), workers, "bench").unwrap();
        pool.start().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                let remaining = Arc::new(AtomicUsize::new(BATCH));
                let (tx, rx) = mpsc::channel();
                for _ in 0..BATCH {
                    let remaining = Arc::clone(&remaining);
                    let tx = tx.clone();
                    pool.add_request(WorkItem::from_fn(move || {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let _ = tx.send(());
                        }
                    }))
                    .unwrap();
                }
                rx.recv().unwrap();
            })
        });

        pool.stop();
    }
    group.finish();
}

criterion_group!(benches, queue_add_take, pool_round_trip);
criterion_main!(benches);
