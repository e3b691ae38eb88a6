//! Error types for the job supervisor.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Backend {kind} is not configured")]
    BackendNotConfigured { kind: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run directory store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown status {value:?} in {path}")]
    MalformedStatus { path: PathBuf, value: String },

    #[error("Run directory {run_dir} has no job identity in its input file")]
    MissingIdentity { run_dir: PathBuf },

    #[error("Run directory {run_dir} is supervised in memory but already has a result on disk")]
    Inconsistent { run_dir: PathBuf },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Run directory {run_dir} is already owned by job {jhash}")]
    Collision { run_dir: PathBuf, jhash: String },

    #[error("Empty command for run directory {run_dir}")]
    EmptyCommand { run_dir: PathBuf },

    #[error("Job in {run_dir} did not stop within {waited:?}")]
    StopTimeout { run_dir: PathBuf, waited: Duration },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Process backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open run log {path}: {source}")]
    RunLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch submission failed: {reason}")]
    Submit { reason: String },

    #[error("No job id found in submission output: {output:?}")]
    ParseJobId { output: String },

    #[error("Batch job {job_id} reported unexpected state {state:?}")]
    UnexpectedState { job_id: u64, state: String },

    #[error("Batch job {job_id} status query failed: {reason}")]
    Query { job_id: u64, reason: String },

    #[error("Failed to signal {target}: {source}")]
    Signal {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Waiting for process failed: {0}")]
    Wait(#[source] std::io::Error),
}

/// Agent/client transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Supervisor returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Result type alias for the supervisor.
pub type Result<T> = std::result::Result<T, Error>;
