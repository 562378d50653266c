use thiserror::Error;

use crate::loader::LoadError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule text did not parse into a usable time specification.
    #[error("Invalid schedule {text:?}: {reason}")]
    InvalidSchedule { text: String, reason: String },

    /// A job definition is structurally unusable (empty name, empty path...).
    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    /// Execution method text other than `defer` / `async`.
    #[error("Unknown execution method: {0}")]
    UnknownExecMethod(String),

    /// A job with this name is already registered (or being registered).
    #[error("Job already registered: {name}")]
    DuplicateJob { name: String },

    /// Builtin jobs live for the lifetime of the process.
    #[error("Builtin job cannot be removed: {name}")]
    BuiltinRemoval { name: String },

    /// Loading the code unit or resolving its entry point failed.
    #[error(transparent)]
    CodeUnit(#[from] LoadError),

    /// Computing or arming the next trigger failed.
    #[error("Scheduling failed for {name}: {reason}")]
    Scheduling { name: String, reason: String },

    /// Candidate pool parameters violate the sizing invariants.
    #[error("Invalid pool configuration: {0}")]
    InvalidPoolConfig(String),

    /// An OS thread could not be started.
    #[error("Thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    /// The scheduler has been shut down.
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
