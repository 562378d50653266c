use std::collections::HashSet;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence_core::config::{ExecutorConfig, JobEntry};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::DispatchQueues,
    error::{Result, SchedulerError},
    job::{Executable, Job, JobDefinition, JobEnv},
    loader::CodeUnitLoader,
    pool::{target_pool_size, LoopBody, WorkerPool},
    runner::BoundedRunner,
    timer::{Timer, TimerHandle},
    types::{ExecMethod, JobInfo},
};

/// Queue pop timeout; bounds how long a stop request can go unnoticed.
pub const POP_TIMEOUT: Duration = Duration::from_secs(1);
/// Dedicated dispatcher back-off while the runner is full.
pub const DEDICATED_BACKOFF: Duration = Duration::from_millis(200);
/// Cadence of the elastic pool adjustment.
pub const ADJUST_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval of the quiescence wait in `remove_job`.
pub const REMOVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const WORKER_POOL_NAME: &str = "cadence-worker";

/// Validated pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub base: usize,
    pub hard: usize,
    /// Queue depth per extra worker; 0 disables growth.
    pub step_queue_size: usize,
    pub dedicated: usize,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base == 0 {
            return Err(SchedulerError::InvalidPoolConfig(
                "thread_number must be at least 1".to_string(),
            ));
        }
        if self.hard < self.base {
            return Err(SchedulerError::InvalidPoolConfig(format!(
                "thread_number_hard ({}) < thread_number ({})",
                self.hard, self.base
            )));
        }
        if self.dedicated == 0 {
            return Err(SchedulerError::InvalidPoolConfig(
                "thread_number_async must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the adjustment routine has anything to do.
    pub fn is_elastic(&self) -> bool {
        self.hard > self.base && self.step_queue_size > 0
    }
}

impl TryFrom<&ExecutorConfig> for PoolConfig {
    type Error = SchedulerError;

    fn try_from(cfg: &ExecutorConfig) -> Result<Self> {
        let pool = PoolConfig {
            base: cfg.thread_number,
            hard: cfg.thread_number_hard,
            step_queue_size: cfg.thread_step_queue_size,
            dedicated: cfg.thread_number_async,
        };
        pool.validate()?;
        Ok(pool)
    }
}

/// Outcome of one `reconfigure` pass over the job list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconfigureReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Job name and reason.
    pub rejected: Vec<(String, String)>,
}

impl ReconfigureReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

struct Registry {
    /// Insertion order is preserved for status output.
    jobs: Vec<Arc<Job>>,
    /// Names reserved by an `add` whose init is still running.
    pending: HashSet<String>,
    pool: PoolConfig,
}

impl Registry {
    fn position(&self, name: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.name() == name)
    }

    fn find(&self, name: &str) -> Option<&Arc<Job>> {
        self.jobs.iter().find(|j| j.name() == name)
    }
}

struct Inner {
    registry: Mutex<Registry>,
    env: JobEnv,
    workers: WorkerPool,
    runner: BoundedRunner,
    shutdown: Arc<AtomicBool>,
    started: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    adjuster: Mutex<Option<TimerHandle>>,
}

/// Job registry plus the queued and dedicated-thread dispatch pipelines.
///
/// Cheap to clone; all clones drive the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Validate pool sizing and build an idle scheduler. Nothing runs until
    /// [`Scheduler::start`].
    pub fn new(
        executor: &ExecutorConfig,
        timer: Timer,
        loader: Arc<dyn CodeUnitLoader>,
    ) -> Result<Self> {
        let pool = PoolConfig::try_from(executor)?;
        let queues = Arc::new(DispatchQueues::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let env = JobEnv {
            timer,
            queues: Arc::clone(&queues),
            running: Arc::new(AtomicBool::new(true)),
            loader,
        };

        let body: LoopBody = Arc::new(move || {
            if let Some(weak) = queues.pop(ExecMethod::Queued, POP_TIMEOUT) {
                if let Some(job) = weak.upgrade() {
                    job.fire();
                }
            }
        });

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    jobs: Vec::new(),
                    pending: HashSet::new(),
                    pool,
                }),
                env,
                workers: WorkerPool::new(WORKER_POOL_NAME, body),
                runner: BoundedRunner::new(pool.dedicated),
                shutdown,
                started: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
                adjuster: Mutex::new(None),
            }),
        })
    }

    /// Start the worker pool, the dedicated dispatcher and the periodic
    /// pool adjustment. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pool = self.inner.registry.lock().pool;
        self.inner.workers.resize(pool.base)?;

        let queues = Arc::clone(&self.inner.env.queues);
        let runner = self.inner.runner.clone();
        let shutdown = Arc::clone(&self.inner.shutdown);
        let handle = thread::Builder::new()
            .name("cadence-dispatch".to_string())
            .spawn(move || run_dedicated_dispatch(&queues, &runner, &shutdown))?;
        *self.inner.dispatcher.lock() = Some(handle);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let adjuster = self
            .inner
            .env
            .timer
            .schedule_repeating(ADJUST_INTERVAL, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.adjust_pool();
                }
            });
        *self.inner.adjuster.lock() = Some(adjuster);

        info!(
            workers = pool.base,
            hard = pool.hard,
            step = pool.step_queue_size,
            dedicated = pool.dedicated,
            "scheduler started"
        );
        Ok(())
    }

    /// Register every enabled entry. Used at startup, where any failure is
    /// fatal to the caller.
    pub fn load_jobs(&self, entries: &[JobEntry]) -> Result<()> {
        for entry in entries.iter().filter(|e| e.enable) {
            self.add_job(entry)?;
        }
        Ok(())
    }

    /// Register a runtime-configured job backed by a code unit.
    pub fn add_job(&self, entry: &JobEntry) -> Result<()> {
        let method: ExecMethod = entry.exec_method.parse()?;
        self.register(JobDefinition {
            name: entry.name.clone(),
            description: entry.desc.clone(),
            schedule: entry.schedule.clone(),
            method,
            executable: Executable::CodeUnit(PathBuf::from(&entry.path)),
        })
    }

    /// Register a job compiled into the process. Builtin jobs cannot be
    /// removed.
    pub fn add_builtin<F>(
        &self,
        name: &str,
        description: &str,
        schedule: &str,
        func: F,
        dedicated: bool,
    ) -> Result<()>
    where
        F: Fn(&Job) -> i32 + Send + Sync + 'static,
    {
        let method = if dedicated {
            ExecMethod::DedicatedThread
        } else {
            ExecMethod::Queued
        };
        self.register(JobDefinition {
            name: name.to_string(),
            description: description.to_string(),
            schedule: schedule.to_string(),
            method,
            executable: Executable::Builtin(Arc::new(func)),
        })
    }

    /// Remove a code-unit job, blocking until no firing of it is in flight.
    ///
    /// Absent names succeed. Must not be called from inside a job body:
    /// the job's own in-flight reference would never go away.
    pub fn remove_job(&self, name: &str) -> Result<()> {
        let job = {
            let registry = self.inner.registry.lock();
            match registry.find(name) {
                None => return Ok(()),
                Some(job) if job.is_builtin() => {
                    return Err(SchedulerError::BuiltinRemoval {
                        name: name.to_string(),
                    })
                }
                Some(job) => Arc::clone(job),
            }
        };

        job.terminate();
        drop(job);

        let mut waited = 0u32;
        loop {
            {
                let mut registry = self.inner.registry.lock();
                let Some(idx) = registry.position(name) else {
                    return Ok(());
                };
                if Arc::strong_count(&registry.jobs[idx]) == 1 {
                    let job = registry.jobs.remove(idx);
                    drop(registry);
                    drop(job);
                    info!(job = %name, polls = waited, "job removed");
                    return Ok(());
                }
            }
            if waited == 0 {
                debug!(job = %name, "waiting for in-flight firing to finish");
            }
            waited += 1;
            thread::sleep(REMOVE_POLL_INTERVAL);
        }
    }

    /// Apply a new executor section and job list.
    ///
    /// Invalid pool sizing rejects the whole call and leaves everything as
    /// it was. Per-job problems are collected in the report and do not stop
    /// the walk.
    pub fn reconfigure(
        &self,
        executor: &ExecutorConfig,
        entries: &[JobEntry],
    ) -> Result<ReconfigureReport> {
        let pool = PoolConfig::try_from(executor).inspect_err(|e| {
            warn!(error = %e, "pool configuration rejected, keeping current one");
        })?;
        self.apply_pool(pool)?;

        let mut report = ReconfigureReport::default();
        for entry in entries {
            let name = entry.name.clone();

            if !entry.enable {
                if !self.contains(&name) {
                    continue;
                }
                match self.remove_job(&name) {
                    Ok(()) => report.removed.push(name),
                    Err(e) => report.rejected.push((name, e.to_string())),
                }
                continue;
            }

            let existing = self
                .inner
                .registry
                .lock()
                .find(&name)
                .map(|job| matches_entry(job, entry));
            match existing {
                Some(true) => report.unchanged.push(name),
                Some(false) => {
                    let e = SchedulerError::DuplicateJob { name: name.clone() };
                    warn!(job = %name, "definition changed for a registered job; remove it first");
                    report.rejected.push((name, e.to_string()));
                }
                None => match self.add_job(entry) {
                    Ok(()) => report.added.push(name),
                    Err(e) => {
                        warn!(job = %name, error = %e, "job rejected on reconfigure");
                        report.rejected.push((name, e.to_string()));
                    }
                },
            }
        }

        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged.len(),
            rejected = report.rejected.len(),
            "reconfigure finished"
        );
        Ok(report)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.registry.lock().find(name).is_some()
    }

    pub fn job_info(&self, name: &str) -> Option<JobInfo> {
        self.inner.registry.lock().find(name).map(|j| j.info())
    }

    /// Snapshot of every registered job, in registration order.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.inner
            .registry
            .lock()
            .jobs
            .iter()
            .map(|j| j.info())
            .collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.inner.registry.lock().pool
    }

    /// Live queued-pipeline workers.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.active()
    }

    pub fn queue_depth(&self, method: ExecMethod) -> usize {
        self.inner.env.queues.depth(method)
    }

    pub fn dedicated_slots_available(&self) -> usize {
        self.inner.runner.available_slots()
    }

    /// Open or close the execution gate. Closed: jobs keep their schedule
    /// but skip their bodies.
    pub fn set_running(&self, running: bool) {
        let prev = self.inner.env.running.swap(running, Ordering::SeqCst);
        if prev != running {
            info!(running, "running flag changed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.env.running.load(Ordering::SeqCst)
    }

    /// Run one elastic adjustment now, as the periodic timer would.
    pub fn adjust_pool(&self) {
        self.inner.adjust_pool();
    }

    /// Human-readable dump of the pools and every registered job.
    pub fn status_report(&self) -> String {
        let (pool, jobs) = {
            let registry = self.inner.registry.lock();
            let jobs: Vec<(JobInfo, u64, u64)> = registry
                .jobs
                .iter()
                .map(|j| (j.info(), j.runs(), j.failures()))
                .collect();
            (registry.pool, jobs)
        };

        let mut out = String::new();
        let _ = writeln!(
            out,
            "scheduler: running={} workers={}/{} (base {}) queued={} dedicated_free={}/{}",
            self.is_running(),
            self.worker_count(),
            pool.hard,
            pool.base,
            self.queue_depth(ExecMethod::Queued),
            self.dedicated_slots_available(),
            pool.dedicated,
        );
        let _ = writeln!(out, "jobs: {}", jobs.len());
        for (info, runs, failures) in jobs {
            let _ = writeln!(
                out,
                "  {} [{}{}] {} \"{}\" runs={} failures={} - {}",
                info.name,
                info.method,
                if info.builtin { ", builtin" } else { "" },
                info.status,
                info.schedule,
                runs,
                failures,
                info.description,
            );
        }
        out
    }

    /// Stop timers, terminate jobs, and join every thread. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("scheduler shutting down");

        if let Some(adjuster) = self.inner.adjuster.lock().take() {
            adjuster.cancel();
        }
        let jobs: Vec<Arc<Job>> = self.inner.registry.lock().jobs.clone();
        for job in &jobs {
            job.terminate();
        }
        drop(jobs);

        self.inner.workers.graceful_stop();
        self.inner.workers.join();
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            if dispatcher.join().is_err() {
                warn!("dedicated dispatcher exited abnormally");
            }
        }
        self.inner.runner.join_all();

        let released = std::mem::take(&mut self.inner.registry.lock().jobs);
        drop(released);
        info!("scheduler stopped");
    }

    // --- private helpers ---------------------------------------------------

    fn register(&self, def: JobDefinition) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        let name = def.name.clone();

        {
            let mut registry = self.inner.registry.lock();
            if registry.find(&name).is_some() || !registry.pending.insert(name.clone()) {
                return Err(SchedulerError::DuplicateJob { name });
            }
        }

        // Init may load a code unit from disk; keep it outside the lock.
        let built = Job::new(def, self.inner.env.clone()).map(Arc::new);
        let initialised = built.and_then(|job| job.init().map(|()| job));

        let mut registry = self.inner.registry.lock();
        registry.pending.remove(&name);
        let job = initialised.inspect_err(|e| {
            warn!(job = %name, error = %e, "job registration failed");
        })?;
        info!(
            job = %name,
            method = %job.method(),
            schedule = %job.schedule(),
            builtin = job.is_builtin(),
            "job registered"
        );
        registry.jobs.push(Arc::clone(&job));
        drop(registry);

        if self.inner.shutdown.load(Ordering::SeqCst) {
            job.terminate();
        }
        Ok(())
    }

    fn apply_pool(&self, pool: PoolConfig) -> Result<()> {
        let previous = {
            let mut registry = self.inner.registry.lock();
            std::mem::replace(&mut registry.pool, pool)
        };
        if previous == pool {
            return Ok(());
        }
        info!(?previous, current = ?pool, "pool configuration updated");

        self.inner.runner.resize(pool.dedicated);
        if self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.load(Ordering::SeqCst)
        {
            let current = self.inner.workers.target();
            let wanted = current.clamp(pool.base, pool.hard);
            if wanted != current {
                self.inner.workers.resize(wanted)?;
            }
        }
        Ok(())
    }
}

impl Inner {
    fn adjust_pool(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let pool = self.registry.lock().pool;
        if !pool.is_elastic() {
            return;
        }
        let depth = self.env.queues.depth(ExecMethod::Queued);
        let expected = target_pool_size(pool.base, pool.hard, pool.step_queue_size, depth);
        if expected != self.workers.target() {
            debug!(depth, expected, "adjusting worker pool");
            if let Err(e) = self.workers.resize(expected) {
                error!(error = %e, "worker pool resize failed");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(adjuster) = self.adjuster.get_mut().take() {
            adjuster.cancel();
        }
        for job in &self.registry.get_mut().jobs {
            job.terminate();
        }
        self.workers.graceful_stop();
    }
}

/// Same name, schedule, method, description and code unit.
fn matches_entry(job: &Job, entry: &JobEntry) -> bool {
    job.schedule() == entry.schedule
        && job.description() == entry.desc
        && entry.exec_method.parse::<ExecMethod>().ok() == Some(job.method())
        && job.code_unit_path().map(PathBuf::as_path) == Some(Path::new(&entry.path))
}

fn run_dedicated_dispatch(queues: &DispatchQueues, runner: &BoundedRunner, shutdown: &AtomicBool) {
    info!("dedicated dispatcher started");
    while !shutdown.load(Ordering::SeqCst) {
        let step = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch_one_dedicated(queues, runner, shutdown)
        }));
        if step.is_err() {
            error!("dedicated dispatch iteration panicked");
        }
    }
    info!("dedicated dispatcher stopped");
}

fn dispatch_one_dedicated(queues: &DispatchQueues, runner: &BoundedRunner, shutdown: &AtomicBool) {
    let Some(weak) = queues.pop(ExecMethod::DedicatedThread, POP_TIMEOUT) else {
        return;
    };

    while runner.available_slots() == 0 {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(DEDICATED_BACKOFF);
    }

    let retry = weak.clone();
    let submitted = runner.submit(move || {
        if let Some(job) = weak.upgrade() {
            job.fire();
        }
    });
    if let Err(e) = submitted {
        error!(error = %e, "dedicated task could not be started");
        // The firing is lost; keep the job on its schedule.
        if let Some(job) = retry.upgrade() {
            if let Err(e) = job.arm_next_trigger() {
                error!(job = %job.name(), error = %e, "re-arm after failed dispatch failed");
            }
        }
    }
}
