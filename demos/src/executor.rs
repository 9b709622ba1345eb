//! Dispatching no-op tasks through a work-stealing pool and a fixed pool.
//!
//! Each invocation builds a four-thread pool, submits `tasks` jobs and waits
//! for all of them, so pool start-up and shutdown are part of the score.

use crossbeam_channel::unbounded;
use forkbench::prelude::*;

const POOL_THREADS: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Number of tasks submitted per invocation
pub struct TaskCount(usize);

impl Fixture for TaskCount {
    const SCOPE: Scope = Scope::Thread;

    fn setup(params: &Params) -> Result<Self, FixtureError> {
        let count = params.parse_or("tasks", 100_000)?;
        if count == 0 {
            return Err(FixtureError::setup("tasks must be at least 1"));
        }
        Ok(TaskCount(count))
    }
}

#[forkbench::bench(id = "executor::rayon_pool", group = "executor", mode = "avgt", unit = "ms", params = ["tasks=10000,100000"])]
fn rayon_pool(tasks: &TaskCount) -> Result<usize, rayon::ThreadPoolBuildError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(POOL_THREADS)
        .build()?;
    pool.scope(|scope| {
        for _ in 0..tasks.0 {
            scope.spawn(|_| {});
        }
    });
    Ok(tasks.0)
}

#[forkbench::bench(id = "executor::fixed_pool", group = "executor", mode = "avgt", unit = "ms", params = ["tasks=10000,100000"])]
fn fixed_pool(tasks: &TaskCount) -> Result<usize, String> {
    let (tx, rx) = unbounded::<Job>();

    let workers: Vec<_> = (0..POOL_THREADS)
        .map(|i| {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("fixed-pool-{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
                .map_err(|e| format!("failed to spawn pool thread: {e}"))
        })
        .collect::<Result<_, _>>()?;

    for _ in 0..tasks.0 {
        tx.send(Box::new(|| {}))
            .map_err(|_| "pool threads exited early".to_string())?;
    }
    // Closing the channel is the shutdown signal
    drop(tx);

    for worker in workers {
        worker
            .join()
            .map_err(|_| "pool thread panicked".to_string())?;
    }
    Ok(tasks.0)
}
