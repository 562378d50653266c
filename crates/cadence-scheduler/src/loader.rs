//! Code-unit loading.
//!
//! A code unit is anything that can be located by path and exposes a named
//! entry point with the `(request, response) -> i32` contract. The scheduler
//! only sees the [`CodeUnitLoader`] / [`CodeUnit`] traits; a unit stays
//! loaded for as long as the job holding it is alive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{JobRequest, JobResponse};

/// Name of the entry point every code unit must expose.
pub const ENTRY_SYMBOL: &str = "job_handler";

/// Returns 0 on success; anything else is logged as a failed run.
pub type EntryPoint = Arc<dyn Fn(&JobRequest<'_>, &mut JobResponse) -> i32 + Send + Sync>;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Cannot load code unit {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Symbol {symbol} not found in {path}")]
    SymbolNotFound { path: String, symbol: String },
}

pub trait CodeUnit: Send + Sync {
    fn path(&self) -> &Path;

    fn lookup(&self, symbol: &str) -> Result<EntryPoint, LoadError>;
}

pub trait CodeUnitLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn CodeUnit>, LoadError>;
}

// ── In-process table ────────────────────────────────────────────────────────

/// Loader over an in-process table of `path -> symbol -> entry point`.
///
/// Useful for embedding cadence in a host binary that links its jobs
/// statically but still wants them managed through configuration.
#[derive(Default)]
pub struct StaticLoader {
    units: RwLock<HashMap<PathBuf, HashMap<String, EntryPoint>>>,
    live: Arc<AtomicUsize>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `entry` as `symbol` in the unit found at `path`.
    pub fn register<F>(&self, path: impl Into<PathBuf>, symbol: &str, entry: F)
    where
        F: Fn(&JobRequest<'_>, &mut JobResponse) -> i32 + Send + Sync + 'static,
    {
        self.units
            .write()
            .entry(path.into())
            .or_default()
            .insert(symbol.to_string(), Arc::new(entry));
    }

    /// Units handed out and not yet released.
    pub fn live_units(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CodeUnitLoader for StaticLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn CodeUnit>, LoadError> {
        let symbols = self
            .units
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::Load {
                path: path.display().to_string(),
                reason: "no such unit registered".to_string(),
            })?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StaticUnit {
            path: path.to_path_buf(),
            symbols,
            live: Arc::clone(&self.live),
        }))
    }
}

struct StaticUnit {
    path: PathBuf,
    symbols: HashMap<String, EntryPoint>,
    live: Arc<AtomicUsize>,
}

impl CodeUnit for StaticUnit {
    fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, symbol: &str) -> Result<EntryPoint, LoadError> {
        self.symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| LoadError::SymbolNotFound {
                path: self.path.display().to_string(),
                symbol: symbol.to_string(),
            })
    }
}

impl Drop for StaticUnit {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!(path = %self.path.display(), "code unit released");
    }
}

// ── External programs ───────────────────────────────────────────────────────

/// Loader treating each code-unit path as an executable program.
///
/// The entry point runs the program with the job context in `CADENCE_JOB_*`
/// environment variables; stdout becomes the response output and the exit
/// status is the return code.
#[derive(Debug, Default, Clone)]
pub struct CommandLoader;

impl CommandLoader {
    pub fn new() -> Self {
        Self
    }
}

impl CodeUnitLoader for CommandLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn CodeUnit>, LoadError> {
        let fail = |reason: String| LoadError::Load {
            path: path.display().to_string(),
            reason,
        };
        let meta = std::fs::metadata(path).map_err(|e| fail(e.to_string()))?;
        if !meta.is_file() {
            return Err(fail("not a regular file".to_string()));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(fail("not executable".to_string()));
            }
        }
        Ok(Arc::new(CommandUnit {
            path: path.to_path_buf(),
        }))
    }
}

struct CommandUnit {
    path: PathBuf,
}

impl CodeUnit for CommandUnit {
    fn path(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, symbol: &str) -> Result<EntryPoint, LoadError> {
        if symbol != ENTRY_SYMBOL {
            return Err(LoadError::SymbolNotFound {
                path: self.path.display().to_string(),
                symbol: symbol.to_string(),
            });
        }
        let program = self.path.clone();
        Ok(Arc::new(move |req: &JobRequest<'_>, rsp: &mut JobResponse| {
            run_program(&program, req, rsp)
        }))
    }
}

fn run_program(program: &Path, req: &JobRequest<'_>, rsp: &mut JobResponse) -> i32 {
    let output = Command::new(program)
        .env("CADENCE_JOB_NAME", req.name)
        .env("CADENCE_JOB_DESC", req.description)
        .env("CADENCE_JOB_SCHEDULE", req.schedule)
        .env("CADENCE_JOB_FIRED_AT", req.fired_at.to_rfc3339())
        .output();

    match output {
        Ok(output) => {
            rsp.output = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
            if !output.stderr.is_empty() {
                warn!(
                    job = %req.name,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                    "code unit wrote to stderr"
                );
            }
            output.status.code().unwrap_or(-1)
        }
        Err(e) => {
            warn!(job = %req.name, program = %program.display(), error = %e, "spawn failed");
            -1
        }
    }
}
