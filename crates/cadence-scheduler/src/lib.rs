//! `cadence-scheduler` — time-of-day job scheduler with two dispatch pipelines.
//!
//! # Overview
//!
//! Every job carries a [`schedule::TimeSpec`] (a seconds/minutes/hours
//! pattern). When a job's one-shot timer fires, a weak reference to it is
//! pushed onto the queue of its execution method:
//!
//! | Method            | Tag     | Executed by                                   |
//! |-------------------|---------|-----------------------------------------------|
//! | `Queued`          | `defer` | Elastic worker pool sized from queue depth    |
//! | `DedicatedThread` | `async` | One thread per firing, bounded in number      |
//!
//! Executing a firing runs the body and re-arms the job's next trigger, so a
//! job is never in flight twice at once. [`engine::Scheduler`] owns the
//! registry and supports adding and removing jobs at runtime; removal blocks
//! until no firing of the job is in flight, and only then releases its code
//! unit.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod job;
pub mod loader;
pub mod pool;
pub mod runner;
pub mod schedule;
pub mod timer;
pub mod types;

pub use engine::{PoolConfig, ReconfigureReport, Scheduler};
pub use error::{Result, SchedulerError};
pub use job::Job;
pub use loader::{CodeUnit, CodeUnitLoader, CommandLoader, LoadError, StaticLoader, ENTRY_SYMBOL};
pub use schedule::TimeSpec;
pub use timer::{Timer, TimerService};
pub use types::{ExecMethod, JobInfo, JobRequest, JobResponse, JobStatus};
