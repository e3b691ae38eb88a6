//! Local process backend.
//!
//! Jobs run as direct children of this process:
//! - working directory set to the run directory
//! - stdout and stderr appended to the run log
//! - orchestration-internal environment variables stripped
//! - placed in a new process group so the whole tree can be signaled

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{BackendKind, ExitOutcome, ProcessBackend, ProcessHandle, run_cleanup_command};
use crate::config::BackendConfig;
use crate::error::BackendError;

type ExitSlot = Option<Result<ExitOutcome, String>>;

/// Launches jobs as local child processes.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    env_strip_prefixes: Vec<String>,
    run_log: String,
    cancel_cleanup: Option<Vec<String>>,
}

impl LocalBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            env_strip_prefixes: config.env_strip_prefixes.clone(),
            run_log: config.run_log.clone(),
            cancel_cleanup: config.cancel_cleanup.clone(),
        }
    }

    /// Spawn `program` in `run_dir` and start reaping it in the background.
    pub(crate) fn spawn(
        &self,
        run_dir: &Path,
        program: &str,
        args: &[String],
    ) -> Result<LocalHandle, BackendError> {
        let log_path = run_dir.join(&self.run_log);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| BackendError::RunLog {
                path: log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| BackendError::RunLog {
            path: log_path.clone(),
            source,
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(run_dir)
            .env_clear()
            .envs(filtered_env(&self.env_strip_prefixes))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| BackendError::Spawn {
            program: program.to_string(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;

        debug!(pid, program, run_dir = %run_dir.display(), "Spawned local process");

        let (exit_tx, exit_rx) = watch::channel::<ExitSlot>(None);
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => Ok(outcome_from_status(status)),
                Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(ExitOutcome::NoSuchProcess),
                Err(e) => Err(e.to_string()),
            };
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(LocalHandle { pid, exit: exit_rx })
    }
}

#[async_trait]
impl ProcessBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn start(
        &self,
        run_dir: &Path,
        cmd: &[String],
    ) -> Result<Arc<dyn ProcessHandle>, BackendError> {
        let (program, args) = cmd.split_first().ok_or_else(|| BackendError::Spawn {
            program: String::new(),
            source: std::io::Error::other("empty command"),
        })?;
        Ok(Arc::new(self.spawn(run_dir, program, args)?))
    }

    async fn cleanup_canceled(&self, run_dir: &Path) -> Result<(), BackendError> {
        run_cleanup_command(run_dir, self.cancel_cleanup.as_deref()).await
    }
}

/// Handle to a local process group.
#[derive(Debug)]
pub struct LocalHandle {
    pid: u32,
    exit: watch::Receiver<ExitSlot>,
}

impl LocalHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[async_trait]
impl ProcessHandle for LocalHandle {
    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }

    async fn wait_for_exit(&self) -> Result<ExitOutcome, BackendError> {
        let mut rx = self.exit.clone();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BackendError::Wait(std::io::Error::other("reaper task went away")))?
            .clone();
        match slot {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(BackendError::Wait(std::io::Error::other(reason))),
            None => Err(BackendError::Wait(std::io::Error::other("exit status missing"))),
        }
    }

    async fn kill(&self, grace_period: Duration) -> Result<(), BackendError> {
        if self.has_exited() {
            return Ok(());
        }

        signal_group(self.pid, libc::SIGTERM)?;

        let mut rx = self.exit.clone();
        if tokio::time::timeout(grace_period, rx.wait_for(Option::is_some))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(
            pid = self.pid,
            grace_period = ?grace_period,
            "Process ignored SIGTERM; sending SIGKILL"
        );
        signal_group(self.pid, libc::SIGKILL)
    }
}

/// Current environment minus every variable starting with one of `prefixes`.
pub fn filtered_env(prefixes: &[String]) -> Vec<(OsString, OsString)> {
    std::env::vars_os()
        .filter(|(key, _)| {
            let key = key.to_string_lossy();
            !prefixes.iter().any(|p| key.starts_with(p.as_str()))
        })
        .collect()
}

fn outcome_from_status(status: ExitStatus) -> ExitOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::Exited(code),
        (None, Some(signal)) => ExitOutcome::Signaled(signal),
        (None, None) => ExitOutcome::NoSuchProcess,
    }
}

/// Send `signal` to every process in the group led by `pgid`.
pub(crate) fn signal_group(pgid: u32, signal: libc::c_int) -> Result<(), BackendError> {
    // SAFETY: killpg takes plain integers and touches no memory we own.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(BackendError::Signal {
        target: format!("process group {pgid}"),
        source: err,
    })
}
