//! Elastic worker pool for the queued pipeline.
//!
//! Every worker runs the same loop body over and over until it is asked to
//! stop. The body is expected to block for a bounded time (a queue pop with
//! timeout), so a stop request is observed within one iteration.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;

pub type LoopBody = Arc<dyn Fn() + Send + Sync + 'static>;

struct Worker {
    id: usize,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    active: Vec<Worker>,
    /// Asked to stop, not yet joined.
    retiring: Vec<Worker>,
    next_id: usize,
}

pub struct WorkerPool {
    name: String,
    body: LoopBody,
    workers: Mutex<Workers>,
    /// Size requested by the most recent `resize`.
    target: AtomicUsize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, body: LoopBody) -> Self {
        Self {
            name: name.into(),
            body,
            workers: Mutex::new(Workers::default()),
            target: AtomicUsize::new(0),
        }
    }

    /// Last size passed to [`WorkerPool::resize`].
    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// Workers currently running the loop (excluding retiring ones).
    pub fn active(&self) -> usize {
        self.workers.lock().active.len()
    }

    /// Grow or shrink to `size` workers.
    ///
    /// Shrinking flags the newest workers to stop after their current
    /// iteration; they are joined lazily on a later resize or on `join`.
    pub fn resize(&self, size: usize) -> Result<()> {
        let mut workers = self.workers.lock();
        reap_retired(&mut workers.retiring);

        let current = workers.active.len();
        if size > current {
            for _ in current..size {
                let id = workers.next_id;
                workers.next_id += 1;
                let worker = self.spawn(id)?;
                workers.active.push(worker);
            }
        } else if size < current {
            let excess = workers.active.split_off(size);
            for worker in &excess {
                worker.stop.store(true, Ordering::SeqCst);
            }
            workers.retiring.extend(excess);
        }

        self.target.store(size, Ordering::SeqCst);
        if size != current {
            info!(pool = %self.name, from = current, to = size, "worker pool resized");
        }
        Ok(())
    }

    /// Ask every worker to stop after its current iteration.
    pub fn graceful_stop(&self) {
        let mut workers = self.workers.lock();
        let active = std::mem::take(&mut workers.active);
        for worker in &active {
            worker.stop.store(true, Ordering::SeqCst);
        }
        workers.retiring.extend(active);
        self.target.store(0, Ordering::SeqCst);
    }

    /// Wait for every stopped worker to exit.
    pub fn join(&self) {
        let retiring = std::mem::take(&mut self.workers.lock().retiring);
        for worker in retiring {
            if worker.handle.join().is_err() {
                warn!(pool = %self.name, worker = worker.id, "worker exited abnormally");
            }
        }
    }

    fn spawn(&self, id: usize) -> Result<Worker> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let body = Arc::clone(&self.body);
        let pool = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-{id}", self.name))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if panic::catch_unwind(AssertUnwindSafe(|| body())).is_err() {
                        error!(pool = %pool, worker = id, "loop iteration panicked");
                    }
                }
            })?;

        Ok(Worker { id, stop, handle })
    }
}

fn reap_retired(retiring: &mut Vec<Worker>) {
    let mut i = 0;
    while i < retiring.len() {
        if retiring[i].handle.is_finished() {
            let _ = retiring.swap_remove(i).handle.join();
        } else {
            i += 1;
        }
    }
}

/// Elastic target: one extra worker per `threshold` queued items on top of
/// `base`, capped at `hard`.
pub fn target_pool_size(base: usize, hard: usize, threshold: usize, depth: usize) -> usize {
    if threshold == 0 {
        return base;
    }
    base.saturating_add(depth / threshold).min(hard)
}
