/// Core types and structures for the wasmrt system
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Execution engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Export invoked after instantiation when the module exposes it
    pub entry_point: String,
    /// How long a cancelled run waits for release before warning about a slow sandbox
    pub grace_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entry_point: "_start".to_string(),
            grace_period: Duration::from_millis(250),
        }
    }
}

/// Terminal status of one module invocation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Module completed, or exited with code 0
    Success,
    /// Module exited through WASI `proc_exit` with a non-zero code
    ExitCode(i32),
    /// Module hit a trap (unreachable, out-of-bounds access, ...)
    Trapped(String),
    /// Deadline elapsed before the module finished
    TimedOut,
    /// Module could not be read, compiled or linked
    SetupFailed(String),
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::ExitCode(0))
    }

    /// Exit code reported by the module, if it reported one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionStatus::Success => Some(0),
            ExecutionStatus::ExitCode(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::ExitCode(code) => write!(f, "module exited with code {}", code),
            ExecutionStatus::Trapped(cause) => write!(f, "module trapped: {}", cause),
            ExecutionStatus::TimedOut => write!(f, "module timed out"),
            ExecutionStatus::SetupFailed(cause) => write!(f, "setup failed: {}", cause),
        }
    }
}

/// Result of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Wall clock time spent in the run (in seconds)
    pub wall_time: f64,
}

impl ExecutionOutcome {
    pub fn new(status: ExecutionStatus, wall_time: Duration) -> Self {
        Self {
            status,
            wall_time: wall_time.as_secs_f64(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Custom error types for wasmrt
#[derive(Error, Debug)]
pub enum WasmrtError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("module error: {0}")]
    Module(ExecutionStatus),
}

/// Result type alias for wasmrt operations
pub type Result<T> = std::result::Result<T, WasmrtError>;
