//! A single schedulable unit and its lifecycle.
//!
//! ```text
//!   Running ──terminate()──► Terminating ──next fire completes──► Disabled
//!      ▲  │
//!      └──┘ fire() re-arms
//! ```
//!
//! A job re-arms itself only after its invocation returns, so at most one
//! firing of a given job is in flight at any time.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchQueues;
use crate::error::{Result, SchedulerError};
use crate::loader::{CodeUnit, CodeUnitLoader, EntryPoint, ENTRY_SYMBOL};
use crate::schedule::TimeSpec;
use crate::timer::{Timer, TimerHandle};
use crate::types::{ExecMethod, JobInfo, JobRequest, JobResponse, JobStatus};

/// Delay before retrying delivery when the target queue is full.
pub const QUEUE_FULL_RETRY: Duration = Duration::from_millis(500);

/// In-process job body; receives the job itself as context.
pub type BuiltinFn = Arc<dyn Fn(&Job) -> i32 + Send + Sync>;

#[derive(Clone)]
pub enum Executable {
    /// Compiled into the process; lives as long as the process does.
    Builtin(BuiltinFn),
    /// Loaded through the [`CodeUnitLoader`] at init.
    CodeUnit(PathBuf),
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executable::Builtin(_) => f.write_str("Builtin"),
            Executable::CodeUnit(path) => f.debug_tuple("CodeUnit").field(path).finish(),
        }
    }
}

/// Everything needed to construct a [`Job`].
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub description: String,
    pub schedule: String,
    pub method: ExecMethod,
    pub executable: Executable,
}

/// Collaborators shared by every job of one scheduler.
#[derive(Clone)]
pub struct JobEnv {
    pub timer: Timer,
    pub queues: Arc<DispatchQueues>,
    /// Gate set by cluster-membership logic; false skips job bodies.
    pub running: Arc<AtomicBool>,
    pub loader: Arc<dyn CodeUnitLoader>,
}

struct LoadedUnit {
    // Declared before `_unit` so the entry point is dropped first.
    entry: EntryPoint,
    _unit: Arc<dyn CodeUnit>,
}

struct JobState {
    status: JobStatus,
    timer: Option<TimerHandle>,
    /// Unix second the current timer was armed for.
    last_target: Option<i64>,
}

pub struct Job {
    name: String,
    description: String,
    schedule: String,
    method: ExecMethod,
    executable: Executable,
    spec: OnceLock<TimeSpec>,
    unit: OnceLock<LoadedUnit>,
    state: Mutex<JobState>,
    env: JobEnv,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl Job {
    pub fn new(def: JobDefinition, env: JobEnv) -> Result<Self> {
        if def.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("empty name".to_string()));
        }
        if def.schedule.trim().is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "{}: empty schedule",
                def.name
            )));
        }
        if let Executable::CodeUnit(path) = &def.executable {
            if path.as_os_str().is_empty() {
                return Err(SchedulerError::InvalidJob(format!(
                    "{}: empty code unit path",
                    def.name
                )));
            }
        }

        Ok(Self {
            name: def.name,
            description: def.description,
            schedule: def.schedule,
            method: def.method,
            executable: def.executable,
            spec: OnceLock::new(),
            unit: OnceLock::new(),
            state: Mutex::new(JobState {
                status: JobStatus::Running,
                timer: None,
                last_target: None,
            }),
            env,
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    pub fn method(&self) -> ExecMethod {
        self.method
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self.executable, Executable::Builtin(_))
    }

    pub fn code_unit_path(&self) -> Option<&PathBuf> {
        match &self.executable {
            Executable::CodeUnit(path) => Some(path),
            Executable::Builtin(_) => None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    /// Completed invocations, failed ones included.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// True while a trigger is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.state
            .lock()
            .timer
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            schedule: self.schedule.clone(),
            method: self.method,
            status: self.status(),
            builtin: self.is_builtin(),
        }
    }

    /// Parse the schedule, load the code unit and arm the first trigger.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        self.prepare()?;
        self.arm_next_trigger()
    }

    /// The fallible, side-effect free half of `init`: schedule parsing and
    /// code-unit loading. Idempotent.
    pub fn prepare(&self) -> Result<()> {
        if self.spec.get().is_none() {
            let spec = TimeSpec::parse(&self.schedule)?;
            let _ = self.spec.set(spec);
        }

        if let Executable::CodeUnit(path) = &self.executable {
            if self.unit.get().is_none() {
                let unit = self.env.loader.load(path)?;
                let entry = unit.lookup(ENTRY_SYMBOL)?;
                let _ = self.unit.set(LoadedUnit { entry, _unit: unit.clone() });
                debug!(job = %self.name, path = %unit.path().display(), "code unit loaded");
            }
        }
        Ok(())
    }

    /// Run once (unless the running flag is down), then re-arm or disable.
    pub fn fire(self: &Arc<Self>) {
        if self.env.running.load(Ordering::SeqCst) {
            self.invoke();
        } else {
            debug!(job = %self.name, "running flag down, skipping body");
        }

        let mut state = self.state.lock();
        if state.status != JobStatus::Running {
            if state.status == JobStatus::Terminating {
                info!(job = %self.name, "job disabled");
            }
            state.status = JobStatus::Disabled;
            state.timer = None;
            return;
        }
        if let Err(e) = self.arm_locked(&mut state) {
            error!(job = %self.name, error = %e, "re-arm failed, job will not fire again");
        }
    }

    /// Compute the delay to the next matching instant and arm a timer that
    /// pushes this job onto its dispatch queue.
    pub fn arm_next_trigger(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        self.arm_locked(&mut state)
    }

    /// Stop future firings. A firing already queued or running still
    /// completes and then disables the job. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.status == JobStatus::Running {
            state.status = JobStatus::Terminating;
            debug!(job = %self.name, "job terminating");
        }
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    // --- private helpers ---------------------------------------------------

    fn arm_locked(self: &Arc<Self>, state: &mut JobState) -> Result<()> {
        if state.status != JobStatus::Running {
            return Err(self.scheduling_error(format!("job is {}", state.status)));
        }
        let spec = self
            .spec
            .get()
            .ok_or_else(|| self.scheduling_error("schedule not parsed".to_string()))?;
        let (target, delay) = next_deadline(spec, &Local::now(), state.last_target)
            .ok_or_else(|| self.scheduling_error("no next trigger".to_string()))?;

        self.arm_after_locked(state, delay);
        state.last_target = Some(target);
        debug!(
            job = %self.name,
            at = target,
            in_ms = delay.as_millis() as u64,
            "next trigger armed"
        );
        Ok(())
    }

    fn arm_after_locked(self: &Arc<Self>, state: &mut JobState, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = self.env.timer.schedule_once(delay, move || deliver(weak));
        if let Some(stale) = state.timer.replace(handle) {
            stale.cancel();
        }
    }

    fn scheduling_error(&self, reason: String) -> SchedulerError {
        SchedulerError::Scheduling {
            name: self.name.clone(),
            reason,
        }
    }

    fn invoke(&self) {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &self.executable {
            Executable::Builtin(f) => f(self),
            Executable::CodeUnit(_) => self.call_code_unit(),
        }));
        self.runs.fetch_add(1, Ordering::SeqCst);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(0) => debug!(job = %self.name, elapsed_ms, "job run finished"),
            Ok(rc) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!(
                    job = %self.name,
                    desc = %self.description,
                    rc,
                    elapsed_ms,
                    "job run returned error"
                );
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!(job = %self.name, desc = %self.description, "job run panicked");
            }
        }
    }

    fn call_code_unit(&self) -> i32 {
        let Some(unit) = self.unit.get() else {
            error!(job = %self.name, "code unit not loaded");
            return -1;
        };
        let req = JobRequest {
            name: &self.name,
            description: &self.description,
            schedule: &self.schedule,
            fired_at: Local::now(),
        };
        let mut rsp = JobResponse::default();
        let rc = (unit.entry)(&req, &mut rsp);
        if !rsp.output.is_empty() {
            debug!(job = %self.name, output = %rsp.output, "code unit output");
        }
        rc
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("method", &self.method)
            .field("executable", &self.executable)
            .field("status", &self.status())
            .finish()
    }
}

/// Next trigger second after `now` and the exact delay to it. Never returns
/// `last` or earlier, so a timer that fires a little early on the wall
/// clock does not run the same slot twice.
fn next_deadline(
    spec: &TimeSpec,
    now: &DateTime<Local>,
    last: Option<i64>,
) -> Option<(i64, Duration)> {
    let mut target = spec.next_trigger(now)?;
    if let Some(prev) = last.filter(|prev| target <= *prev) {
        let after = Local.timestamp_opt(prev, 0).earliest()?;
        target = spec.next_trigger(&after)?;
    }
    let delay_ms = target.checked_mul(1000)? - now.timestamp_millis();
    let delay_ms = u64::try_from(delay_ms).ok().filter(|ms| *ms > 0)?;
    Some((target, Duration::from_millis(delay_ms)))
}

/// Timer callback: push the job onto its queue, or retry shortly if full.
fn deliver(weak: Weak<Job>) {
    let Some(job) = weak.upgrade() else {
        return;
    };
    if job.env.queues.push(job.method, weak).is_ok() {
        return;
    }
    warn!(job = %job.name, method = %job.method, "dispatch queue full, delivery delayed");
    let mut state = job.state.lock();
    if state.status == JobStatus::Running {
        job.arm_after_locked(&mut state, QUEUE_FULL_RETRY);
    }
}
