//! `BoundedRunner` — one OS thread per task, at most `capacity` at a time.
//!
//! Used by the dedicated-thread pipeline for long-running jobs that should
//! not occupy a shared worker.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::Result;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct RunnerState {
    capacity: usize,
    running: usize,
    threads: Vec<JoinHandle<()>>,
    next_id: u64,
}

struct Shared {
    state: Mutex<RunnerState>,
    slot_freed: Condvar,
}

/// Capacity-bounded thread-per-task runner.
#[derive(Clone)]
pub struct BoundedRunner {
    shared: Arc<Shared>,
}

impl BoundedRunner {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RunnerState {
                    capacity,
                    running: 0,
                    threads: Vec::new(),
                    next_id: 0,
                }),
                slot_freed: Condvar::new(),
            }),
        }
    }

    /// Start `task` on its own thread, blocking while the runner is full.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        while state.running >= state.capacity {
            self.shared.slot_freed.wait(&mut state);
        }
        self.spawn_locked(&mut state, Box::new(task))
    }

    /// Free slots right now; `0` when over capacity after a shrink.
    pub fn available_slots(&self) -> usize {
        let state = self.shared.state.lock();
        state.capacity.saturating_sub(state.running)
    }

    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Change the admission limit. Running tasks are never preempted.
    pub fn resize(&self, capacity: usize) {
        let mut state = self.shared.state.lock();
        if state.capacity != capacity {
            debug!(from = state.capacity, to = capacity, "dedicated runner resized");
            state.capacity = capacity;
        }
        drop(state);
        self.shared.slot_freed.notify_all();
    }

    /// Join every thread started so far, waiting for running tasks to end.
    pub fn join_all(&self) {
        let threads = std::mem::take(&mut self.shared.state.lock().threads);
        for handle in threads {
            let _ = handle.join();
        }
    }

    fn spawn_locked(&self, state: &mut RunnerState, task: Task) -> Result<()> {
        reap_finished(&mut state.threads);

        let id = state.next_id;
        state.next_id += 1;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("cadence-async-{id}"))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(task = id, "dedicated task panicked");
                }
                let mut state = shared.state.lock();
                state.running -= 1;
                drop(state);
                shared.slot_freed.notify_all();
            })?;

        state.running += 1;
        state.threads.push(handle);
        Ok(())
    }
}

/// Join threads that have already returned; keeps the handle list short.
fn reap_finished(threads: &mut Vec<JoinHandle<()>>) {
    let mut i = 0;
    while i < threads.len() {
        if threads[i].is_finished() {
            let _ = threads.swap_remove(i).join();
        } else {
            i += 1;
        }
    }
}
