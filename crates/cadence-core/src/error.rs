use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job entry {name}: {reason}")]
    InvalidJobEntry { name: String, reason: String },
}

impl CadenceError {
    /// Short error code string used in status dumps and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
            CadenceError::InvalidJobEntry { .. } => "INVALID_JOB_ENTRY",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
