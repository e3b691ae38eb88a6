//! Process backends: uniform start/wait/kill over OS mechanisms.
//!
//! - `local`: fork/exec in a new process group
//! - `container`: the local backend wrapped in a container runtime invocation
//! - `batch`: SLURM submission with `sbatch`, polled with `scontrol`

pub mod batch;
pub mod container;
pub mod local;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::BackendConfig;
use crate::error::{BackendError, ConfigError};

pub use batch::BatchBackend;
pub use container::ContainerBackend;
pub use local::LocalBackend;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
    /// The process (or batch job) no longer exists and its status is unknown.
    NoSuchProcess,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code for logs; signals use the shell convention `128 + signal`.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signal) => Some(128 + signal),
            Self::NoSuchProcess => None,
        }
    }
}

/// Which execution mechanism a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    #[serde(alias = "docker")]
    Container,
    #[serde(alias = "sbatch")]
    Batch,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Batch => "batch",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "container" | "docker" => Ok(Self::Container),
            "batch" | "sbatch" => Ok(Self::Batch),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// A running process, container or batch job.
#[async_trait]
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    /// Human-readable id for logs (`pid 42`, `slurm job 1234`).
    fn describe(&self) -> String;

    /// Wait until the process has exited.
    ///
    /// May be called more than once; every caller sees the same outcome.
    async fn wait_for_exit(&self) -> Result<ExitOutcome, BackendError>;

    /// Ask the process to terminate, force-killing it after `grace_period`.
    async fn kill(&self, grace_period: Duration) -> Result<(), BackendError>;
}

/// An execution mechanism able to launch jobs in run directories.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launch `cmd` with `run_dir` as its working directory.
    async fn start(
        &self,
        run_dir: &Path,
        cmd: &[String],
    ) -> Result<Arc<dyn ProcessHandle>, BackendError>;

    /// Cleanup after a job in `run_dir` was canceled, e.g. dropping a
    /// partially written animation frame.
    async fn cleanup_canceled(&self, _run_dir: &Path) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backends selected once at configuration time.
#[derive(Clone, Default)]
pub struct Backends {
    backends: HashMap<BackendKind, Arc<dyn ProcessBackend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every backend the configuration enables. The local backend is
    /// always available.
    pub fn from_config(config: &BackendConfig) -> Self {
        let mut backends = Self::new();
        let local = LocalBackend::new(config);
        if let Some(container) = &config.container {
            backends.insert(Arc::new(ContainerBackend::new(
                local.clone(),
                container.clone(),
            )));
        }
        if let Some(batch) = &config.batch {
            backends.insert(Arc::new(BatchBackend::new(config, batch.clone())));
        }
        backends.insert(Arc::new(local));
        backends
    }

    pub fn insert(&mut self, backend: Arc<dyn ProcessBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ProcessBackend>) -> Self {
        self.insert(backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn ProcessBackend>, ConfigError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| ConfigError::BackendNotConfigured {
                kind: kind.to_string(),
            })
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

/// Run the configured cancel cleanup command inside `run_dir`.
pub(crate) async fn run_cleanup_command(
    run_dir: &Path,
    argv: Option<&[String]>,
) -> Result<(), BackendError> {
    let Some((program, args)) = argv.and_then(|a| a.split_first()) else {
        return Ok(());
    };

    let output = Command::new(program)
        .args(args)
        .current_dir(run_dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| BackendError::Spawn {
            program: program.clone(),
            source,
        })?;

    if output.status.success() {
        info!(run_dir = %run_dir.display(), "Cancel cleanup finished");
    } else {
        warn!(
            run_dir = %run_dir.display(),
            status = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Cancel cleanup command failed"
        );
    }
    Ok(())
}
