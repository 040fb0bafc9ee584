//! Pool stress test
//!
//! Pushes many small work items through a `ThreadPool` and reports
//! throughput and how evenly the workers shared the load.

use clap::Parser;
use log::{error, info};
use sockserve::{logging, PlatformThreadingFactory, RunCompletionObserver, RunReport, ThreadPool, WorkItem};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Parser)]
#[command(name = "pool-stress")]
#[command(about = "Run many small tasks through a sockserve thread pool")]
struct Args {
    /// Number of work items
    #[arg(short, long, default_value = "100000")]
    tasks: usize,

    /// Pool workers
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Busy-loop iterations per task
    #[arg(long, default_value = "100")]
    spin: u64,
}

/// Counts completed items per worker
struct WorkerTally {
    counts: Mutex<Vec<u64>>,
}

impl RunCompletionObserver for WorkerTally {
    fn notify_run_complete(&self, report: &RunReport) {
        let (Some(worker), Ok(mut counts)) = (report.worker_id, self.counts.lock()) else {
            return;
        };
        if let Some(slot) = counts.get_mut(worker) {
            *slot += 1;
        }
    }
}

fn main() {
    logging::init();
    let args = Args::parse();

    let factory = Arc::new(PlatformThreadingFactory::new());
    let mut pool = match ThreadPool::new(factory, args.workers, "stress") {
        Ok(pool) => pool,
        Err(e) => {
            error!("critical: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = pool.start() {
        error!("critical: {}", e);
        std::process::exit(1);
    }

    let checksum = Arc::new(AtomicU64::new(0));
    let tally = Arc::new(WorkerTally { counts: Mutex::new(vec![0u64; args.workers]) });

    info!("submitting {} tasks to {} workers", args.tasks, args.workers);
    let start = Instant::now();
    for i in 0..args.tasks {
        let checksum = Arc::clone(&checksum);
        let spin = args.spin;
        let item = WorkItem::from_fn(move || {
            let mut acc = i as u64;
            for n in 0..spin {
                acc = acc.wrapping_mul(31).wrapping_add(n);
            }
            checksum.fetch_add(acc & 1, Ordering::Relaxed);
        })
        .with_observer(tally.clone());
        if let Err(rejected) = pool.add_request(item) {
            error!("submit failed: {}", rejected);
            break;
        }
    }
    let submitted = start.elapsed();

    pool.stop();
    let elapsed = start.elapsed();

    info!("submit time: {:?}", submitted);
    info!("total time:  {:?}", elapsed);
    info!("throughput:  {:.0} tasks/sec", args.tasks as f64 / elapsed.as_secs_f64());
    info!("executed:    {} (checksum {})", pool.executed(), checksum.load(Ordering::Relaxed));
    if let Ok(counts) = tally.counts.lock() {
        for (worker, count) in counts.iter().enumerate() {
            info!("  worker {}: {}", worker, count);
        }
    };
}
