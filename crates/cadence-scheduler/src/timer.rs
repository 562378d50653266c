//! Delayed-callback timer backed by a Tokio runtime.
//!
//! Callbacks run on a runtime worker and must not block: the scheduler only
//! uses them to push onto a dispatch queue or to resize the worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::Result;

/// Owner of the timer runtime.
///
/// Either wraps an existing runtime [`Handle`] (the daemon's `#[tokio::main]`
/// runtime) or builds and owns a small dedicated one.
pub struct TimerService {
    timer: Timer,
    _runtime: Option<Arc<Runtime>>,
}

impl TimerService {
    /// Build a dedicated single-worker runtime for timers.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cadence-timer")
            .enable_time()
            .build()?;
        let timer = Timer {
            handle: runtime.handle().clone(),
        };
        Ok(Self {
            timer,
            _runtime: Some(Arc::new(runtime)),
        })
    }

    /// Schedule on a runtime owned by someone else.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            timer: Timer { handle },
            _runtime: None,
        }
    }

    /// Cheap, cloneable scheduling handle for collaborators.
    pub fn timer(&self) -> Timer {
        self.timer.clone()
    }
}

/// Scheduling half of the timer service. Does not keep the runtime alive.
#[derive(Clone)]
pub struct Timer {
    handle: Handle,
}

impl Timer {
    /// Run `f` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        TimerHandle {
            task: task.abort_handle(),
        }
    }

    /// Run `f` every `period`, first call one period from now.
    pub fn schedule_repeating<F>(&self, period: Duration, mut f: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        });
        TimerHandle {
            task: task.abort_handle(),
        }
    }
}

/// Cancellation handle for an armed timer. Dropping it does not cancel.
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    pub fn cancel(&self) {
        if !self.task.is_finished() {
            debug!("timer cancelled");
        }
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn once_fires_after_delay() {
        let service = TimerService::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = service
            .timer()
            .schedule_once(Duration::from_millis(20), move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let service = TimerService::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = service
            .timer()
            .schedule_once(Duration::from_millis(100), move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        handle.cancel();
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeating_fires_until_cancelled() {
        let service = TimerService::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = service
            .timer()
            .schedule_repeating(Duration::from_millis(20), move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        std::thread::sleep(Duration::from_millis(250));
        handle.cancel();
        std::thread::sleep(Duration::from_millis(50));
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} ticks");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }
}
