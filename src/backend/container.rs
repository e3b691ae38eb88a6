//! Container backend: local processes wrapped in `docker run`.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::local::{LocalBackend, LocalHandle};
use super::{BackendKind, ExitOutcome, ProcessBackend, ProcessHandle};
use crate::config::ContainerConfig;
use crate::error::BackendError;

/// Runs each job in a fresh container with the run directory bind-mounted at
/// the same path.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    local: LocalBackend,
    config: ContainerConfig,
}

impl ContainerBackend {
    pub fn new(local: LocalBackend, config: ContainerConfig) -> Self {
        Self { local, config }
    }

    /// Full argument vector of the runtime invocation for `cmd`.
    pub fn wrap_command(&self, name: &str, run_dir: &Path, cmd: &[String]) -> Vec<String> {
        let dir = run_dir.display().to_string();
        let mut argv = vec![
            self.config.runtime.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "--init".to_string(),
            format!("--name={name}"),
            format!("--volume={dir}:{dir}"),
            format!("--workdir={dir}"),
        ];
        // SAFETY: getuid/getgid cannot fail and touch no memory.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        argv.push(format!("--user={uid}:{gid}"));
        argv.push(self.config.image.clone());
        argv.extend(cmd.iter().cloned());
        argv
    }
}

#[async_trait]
impl ProcessBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn start(
        &self,
        run_dir: &Path,
        cmd: &[String],
    ) -> Result<Arc<dyn ProcessHandle>, BackendError> {
        if cmd.is_empty() {
            return Err(BackendError::Spawn {
                program: self.config.runtime.clone(),
                source: std::io::Error::other("empty command"),
            });
        }

        let name = format!("sim-{}", uuid::Uuid::new_v4().simple());
        let argv = self.wrap_command(&name, run_dir, cmd);
        debug!(container = %name, ?argv, "Starting container");

        let local = self.local.spawn(run_dir, &argv[0], &argv[1..])?;
        Ok(Arc::new(ContainerHandle {
            name,
            runtime: self.config.runtime.clone(),
            local,
        }))
    }

    async fn cleanup_canceled(&self, run_dir: &Path) -> Result<(), BackendError> {
        self.local.cleanup_canceled(run_dir).await
    }
}

/// A container started by the runtime client process in `local`.
#[derive(Debug)]
pub struct ContainerHandle {
    name: String,
    runtime: String,
    local: LocalHandle,
}

#[async_trait]
impl ProcessHandle for ContainerHandle {
    fn describe(&self) -> String {
        format!("container {} ({})", self.name, self.local.describe())
    }

    async fn wait_for_exit(&self) -> Result<ExitOutcome, BackendError> {
        self.local.wait_for_exit().await
    }

    async fn kill(&self, grace_period: Duration) -> Result<(), BackendError> {
        // `docker stop` does its own TERM, wait, KILL sequence inside the container.
        let secs = grace_period.as_secs().max(1).to_string();
        let stopped = Command::new(&self.runtime)
            .args(["stop", "--time", &secs, &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match stopped {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                container = %self.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Container stop failed; signaling runtime client"
            ),
            Err(e) => warn!(
                container = %self.name,
                error = %e,
                "Could not run container stop; signaling runtime client"
            ),
        }

        self.local.kill(grace_period).await
    }
}
