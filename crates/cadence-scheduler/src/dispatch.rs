//! The two dispatch queues between timers and executors.
//!
//! Entries are weak: a job removed from the registry while a firing of it is
//! still queued is simply discarded when that entry is popped.

use std::sync::Weak;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::job::Job;
use crate::types::ExecMethod;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

struct Lane {
    tx: Sender<Weak<Job>>,
    rx: Receiver<Weak<Job>>,
}

impl Lane {
    fn bounded(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx }
    }
}

pub struct DispatchQueues {
    queued: Lane,
    dedicated: Lane,
}

impl DispatchQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queued: Lane::bounded(capacity),
            dedicated: Lane::bounded(capacity),
        }
    }

    fn lane(&self, method: ExecMethod) -> &Lane {
        match method {
            ExecMethod::Queued => &self.queued,
            ExecMethod::DedicatedThread => &self.dedicated,
        }
    }

    /// Non-blocking push; hands the entry back when the lane is full.
    pub fn push(&self, method: ExecMethod, job: Weak<Job>) -> Result<(), Weak<Job>> {
        match self.lane(method).tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }

    /// Pop one entry, waiting at most `timeout`.
    pub fn pop(&self, method: ExecMethod, timeout: Duration) -> Option<Weak<Job>> {
        self.lane(method).rx.recv_timeout(timeout).ok()
    }

    pub fn depth(&self, method: ExecMethod) -> usize {
        self.lane(method).rx.len()
    }
}

impl Default for DispatchQueues {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
