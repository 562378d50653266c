use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_EXEC_METHOD: &str = "defer";
pub const ENV_PREFIX: &str = "CADENCE_";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Runtime-configured jobs, in declaration order.
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Written at startup and removed at shutdown when set.
    pub pid_file: Option<String>,
    /// Initial value of the running flag. When false, jobs keep their
    /// schedule but their bodies are skipped.
    #[serde(default = "bool_true")]
    pub active: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            active: true,
        }
    }
}

/// Worker pool sizing for the two dispatch pipelines.
///
/// Values are validated by the scheduler before they are applied; this struct
/// only carries what the file said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Base number of queued-pipeline workers.
    #[serde(default = "default_thread_number")]
    pub thread_number: usize,
    /// Upper bound the elastic pool may grow to.
    #[serde(default = "default_thread_number")]
    pub thread_number_hard: usize,
    /// Queue depth per extra worker; 0 disables elastic growth.
    #[serde(default)]
    pub thread_step_queue_size: usize,
    /// Maximum concurrently running dedicated-thread jobs.
    #[serde(default = "default_thread_number_async")]
    pub thread_number_async: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            thread_number: default_thread_number(),
            thread_number_hard: default_thread_number(),
            thread_step_queue_size: 0,
            thread_number_async: default_thread_number_async(),
        }
    }
}

/// A single `[[jobs]]` entry backed by a loadable code unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEntry {
    /// Unique registry key.
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Three-field `second minute hour` expression.
    pub schedule: String,
    /// `"defer"` (shared worker pool) or `"async"` (dedicated thread).
    #[serde(default = "default_exec_method")]
    pub exec_method: String,
    /// Location of the code unit.
    pub path: String,
    /// Disabled entries are removed from a running scheduler on reload.
    #[serde(default = "bool_true")]
    pub enable: bool,
}

fn bool_true() -> bool {
    true
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_thread_number() -> usize {
    1
}
fn default_thread_number_async() -> usize {
    10
}
fn default_exec_method() -> String {
    DEFAULT_EXEC_METHOD.to_string()
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys are addressed with a double underscore, e.g.
    /// `CADENCE_EXECUTOR__THREAD_NUMBER=4`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        if !std::path::Path::new(&path).is_file() {
            return Err(CadenceError::Config(format!("config file not found: {path}")));
        }

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.check_entries()?;
        tracing::debug!(path = %path, jobs = config.jobs.len(), "configuration loaded");
        Ok(config)
    }

    /// Parse config from an in-memory TOML document, without env overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: CadenceConfig = Figment::from(Toml::string(toml))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;
        config.check_entries()?;
        Ok(config)
    }

    /// Structural checks that do not need the scheduler: non-empty fields
    /// and no name declared twice in the same file.
    fn check_entries(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.jobs {
            let invalid = |reason: &str| CadenceError::InvalidJobEntry {
                name: entry.name.clone(),
                reason: reason.to_string(),
            };
            if entry.name.trim().is_empty() {
                return Err(invalid("empty name"));
            }
            if entry.schedule.trim().is_empty() {
                return Err(invalid("empty schedule"));
            }
            if entry.path.trim().is_empty() {
                return Err(invalid("empty code unit path"));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(invalid("declared more than once"));
            }
        }
        Ok(())
    }
}

pub fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
