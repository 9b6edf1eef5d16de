//! Error types for the scrape supervisor.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Child process lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Process stdin is not available")]
    StdinClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the run supervisor to the caller of `start`.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid run configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker launch failed for run {run_id}: {reason}")]
    LaunchFailed { run_id: String, reason: String },

    #[error("Worker for run {run_id} failed: {reason}")]
    WorkerFailed { run_id: String, reason: String },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

/// Readiness gate errors.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Readiness wait cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Services not ready after {waited:?} ({attempts} attempts)")]
    TimedOut { waited: Duration, attempts: u32 },

    #[error("Invalid health target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// Run history errors. Per-artifact parse failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Invalid run id: {0}")]
    InvalidRunId(#[from] ConfigError),

    #[error("Run {run_id} not found under {root}")]
    RunNotFound { run_id: String, root: PathBuf },

    #[error("Failed to read run directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Watch job persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Watch job {id} not found")]
    NotFound { id: String },

    #[error("Invalid watch job: {0}")]
    Invalid(#[from] ConfigError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch jobs document {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the supervisor.
pub type Result<T> = std::result::Result<T, Error>;
