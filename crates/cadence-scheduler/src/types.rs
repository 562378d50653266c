use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};

use crate::error::SchedulerError;

/// Which dispatch pipeline a job's firings go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecMethod {
    /// Shared elastic worker pool; for short periodic work.
    Queued,
    /// A thread of its own from the bounded runner; for long-running work.
    DedicatedThread,
}

impl ExecMethod {
    /// Tag used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMethod::Queued => "defer",
            ExecMethod::DedicatedThread => "async",
        }
    }
}

impl fmt::Display for ExecMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMethod {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "defer" => Ok(ExecMethod::Queued),
            "async" => Ok(ExecMethod::DedicatedThread),
            other => Err(SchedulerError::UnknownExecMethod(other.to_string())),
        }
    }
}

/// Lifecycle state of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// May fire and re-arm.
    Running,
    /// Stop requested; the next firing to complete disables the job.
    Terminating,
    /// Terminal. Never armed again.
    Disabled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Terminating => "terminating",
            JobStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Context handed to a code unit's entry point.
#[derive(Debug, Clone)]
pub struct JobRequest<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub schedule: &'a str,
    pub fired_at: DateTime<Local>,
}

/// Filled in by a code unit; logged by the scheduler when non-empty.
#[derive(Debug, Clone, Default)]
pub struct JobResponse {
    pub output: String,
}

/// Point-in-time view of a registered job, for status dumps.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub schedule: String,
    pub method: ExecMethod,
    pub status: JobStatus,
    pub builtin: bool,
}
