//! SLURM batch backend.
//!
//! `start` renders a submission script and feeds it to `sbatch` on stdin.
//! Completion is detected by polling `scontrol show job <id>` and matching the
//! `JobState=` and `ExitCode=` tokens. A failed query is retried with backoff
//! up to `BatchConfig::query_retries` times; after that the job is cancelled
//! and reported as an error. Cancellation uses `scancel`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{OnceCell, watch};
use tracing::{debug, error, info, warn};

use super::local::filtered_env;
use super::{BackendKind, ExitOutcome, ProcessBackend, ProcessHandle, run_cleanup_command};
use crate::config::{BackendConfig, BatchConfig};
use crate::error::BackendError;

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:Submitted batch job\s+)?(\d+)\b").expect("valid regex")
});

static JOB_STATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bJobState=(\S+)").expect("valid regex"));

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bExitCode=(\d+):(\d+)").expect("valid regex"));

/// Job states `scontrol` may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Configuring,
    Running,
    Completing,
    Suspended,
    Requeued,
    Resizing,
    Signaling,
    StageOut,
    Stopped,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    OutOfMemory,
    Preempted,
    BootFail,
    Deadline,
}

impl SlurmState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Cancelled
                | Self::Failed
                | Self::Timeout
                | Self::NodeFail
                | Self::OutOfMemory
                | Self::Preempted
                | Self::BootFail
                | Self::Deadline
        )
    }
}

impl FromStr for SlurmState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "PENDING" => Self::Pending,
            "CONFIGURING" => Self::Configuring,
            "RUNNING" => Self::Running,
            "COMPLETING" => Self::Completing,
            "SUSPENDED" => Self::Suspended,
            "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" => Self::Requeued,
            "RESIZING" => Self::Resizing,
            "SIGNALING" => Self::Signaling,
            "STAGE_OUT" => Self::StageOut,
            "STOPPED" => Self::Stopped,
            "COMPLETED" => Self::Completed,
            "CANCELLED" => Self::Cancelled,
            "FAILED" => Self::Failed,
            "TIMEOUT" => Self::Timeout,
            "NODE_FAIL" => Self::NodeFail,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            "PREEMPTED" => Self::Preempted,
            "BOOT_FAIL" => Self::BootFail,
            "DEADLINE" => Self::Deadline,
            _ => return Err(()),
        };
        Ok(state)
    }
}

/// One parsed `scontrol show job` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobQuery {
    State {
        state: SlurmState,
        exit_code: Option<i32>,
    },
    /// The scheduler no longer knows the job.
    Gone,
}

/// Extract the job id from `sbatch` output.
pub fn parse_job_id(output: &str) -> Result<u64, BackendError> {
    JOB_ID_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| BackendError::ParseJobId {
            output: output.to_string(),
        })
}

/// Parse `scontrol show job` output.
pub fn parse_job_query(job_id: u64, output: &str) -> Result<JobQuery, BackendError> {
    if output.contains("Invalid job id") {
        return Ok(JobQuery::Gone);
    }

    let raw = JOB_STATE_RE
        .captures(output)
        .map(|c| c[1].to_string())
        .ok_or_else(|| BackendError::Query {
            job_id,
            reason: format!("no JobState in output: {}", output.trim()),
        })?;

    let state = raw
        .parse::<SlurmState>()
        .map_err(|()| BackendError::UnexpectedState {
            job_id,
            state: raw.clone(),
        })?;

    let exit_code = EXIT_CODE_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok());

    Ok(JobQuery::State { state, exit_code })
}

/// Map a terminal scheduler state onto a process outcome.
fn terminal_outcome(state: SlurmState, exit_code: Option<i32>) -> ExitOutcome {
    match state {
        SlurmState::Completed => ExitOutcome::Exited(exit_code.unwrap_or(0)),
        SlurmState::Cancelled => ExitOutcome::Signaled(libc::SIGTERM),
        _ => ExitOutcome::Exited(exit_code.filter(|c| *c != 0).unwrap_or(1)),
    }
}

/// Submits jobs to SLURM.
#[derive(Debug, Clone)]
pub struct BatchBackend {
    config: Arc<BatchConfig>,
    run_log: String,
    env_strip_prefixes: Vec<String>,
    cancel_cleanup: Option<Vec<String>>,
}

impl BatchBackend {
    pub fn new(backend: &BackendConfig, config: BatchConfig) -> Self {
        Self {
            config: Arc::new(config),
            run_log: backend.run_log.clone(),
            env_strip_prefixes: backend.env_strip_prefixes.clone(),
            cancel_cleanup: backend.cancel_cleanup.clone(),
        }
    }

    /// Render the submission script for `cmd`.
    pub fn render_script(&self, run_dir: &Path, cmd: &[String]) -> Result<String, BackendError> {
        let quote_err = |e: shlex::QuoteError| BackendError::Submit {
            reason: format!("cannot quote command: {e}"),
        };
        // sbatch splits directive lines on whitespace and has no quoting.
        if self.run_log.contains(char::is_whitespace) {
            return Err(BackendError::Submit {
                reason: format!("run log name {:?} contains whitespace", self.run_log),
            });
        }
        let dir = run_dir.display().to_string();
        let name: String = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string())
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();

        // `sbatch` runs in the run directory, so the job starts there and
        // a relative `--output` lands there too.
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name=sim-{name}\n"));
        script.push_str(&format!("#SBATCH --output={}\n", self.run_log));
        script.push_str("#SBATCH --open-mode=append\n");
        if let Some(partition) = &self.config.partition {
            script.push_str(&format!("#SBATCH --partition={partition}\n"));
        }
        if let Some(time) = &self.config.time_limit {
            script.push_str(&format!("#SBATCH --time={time}\n"));
        }
        if let Some(nodes) = self.config.nodes {
            script.push_str(&format!("#SBATCH --nodes={nodes}\n"));
        }
        if let Some(tasks) = self.config.tasks {
            script.push_str(&format!("#SBATCH --ntasks={tasks}\n"));
        }

        script.push_str(&format!("cd {}\n", shlex::try_quote(&dir).map_err(quote_err)?));
        let command = shlex::try_join(cmd.iter().map(String::as_str)).map_err(quote_err)?;
        if self.is_parallel() {
            script.push_str(&format!("exec srun {command}\n"));
        } else {
            script.push_str(&format!("exec {command}\n"));
        }
        Ok(script)
    }

    fn is_parallel(&self) -> bool {
        self.config.tasks.is_some_and(|t| t > 1) || self.config.nodes.is_some_and(|n| n > 1)
    }

    async fn submit(&self, run_dir: &Path, script: &str) -> Result<u64, BackendError> {
        let mut child = Command::new(&self.config.sbatch)
            .current_dir(run_dir)
            .env_clear()
            .envs(filtered_env(&self.env_strip_prefixes))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.config.sbatch.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| BackendError::Submit {
                    reason: format!("writing script to {}: {e}", self.config.sbatch),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackendError::Submit {
                reason: format!("{}: {e}", self.config.sbatch),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(BackendError::Submit {
                reason: format!(
                    "{} exited with {:?}: {}",
                    self.config.sbatch,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        parse_job_id(&stdout)
    }
}

#[async_trait]
impl ProcessBackend for BatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    async fn start(
        &self,
        run_dir: &Path,
        cmd: &[String],
    ) -> Result<Arc<dyn ProcessHandle>, BackendError> {
        if cmd.is_empty() {
            return Err(BackendError::Submit {
                reason: "empty command".to_string(),
            });
        }
        let script = self.render_script(run_dir, cmd)?;
        let job_id = self.submit(run_dir, &script).await?;
        info!(job_id, run_dir = %run_dir.display(), "Submitted batch job");

        let (state, _) = watch::channel(None);
        Ok(Arc::new(BatchHandle {
            job_id,
            run_dir: run_dir.to_path_buf(),
            config: Arc::clone(&self.config),
            outcome: OnceCell::new(),
            state,
            parallel_started: AtomicBool::new(false),
        }))
    }

    async fn cleanup_canceled(&self, run_dir: &Path) -> Result<(), BackendError> {
        run_cleanup_command(run_dir, self.cancel_cleanup.as_deref()).await
    }
}

/// A submitted SLURM job.
#[derive(Debug)]
pub struct BatchHandle {
    job_id: u64,
    run_dir: PathBuf,
    config: Arc<BatchConfig>,
    outcome: OnceCell<ExitOutcome>,
    /// Last state seen by the poll loop.
    state: watch::Sender<Option<SlurmState>>,
    parallel_started: AtomicBool,
}

impl BatchHandle {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    async fn query(&self) -> Result<JobQuery, BackendError> {
        let output = Command::new(&self.config.scontrol)
            .args(["show", "job", &self.job_id.to_string()])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                program: self.config.scontrol.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if stderr.contains("Invalid job id") || stdout.contains("Invalid job id") {
                return Ok(JobQuery::Gone);
            }
            return Err(BackendError::Query {
                job_id: self.job_id,
                reason: stderr.trim().to_string(),
            });
        }
        parse_job_query(self.job_id, &stdout)
    }

    async fn poll_until_done(&self) -> Result<ExitOutcome, BackendError> {
        let mut failures = 0u32;
        loop {
            let (state, exit_code) = match self.query().await {
                Ok(JobQuery::State { state, exit_code }) => (state, exit_code),
                Ok(JobQuery::Gone) => {
                    warn!(job_id = self.job_id, "Batch job vanished from scheduler");
                    return Ok(ExitOutcome::NoSuchProcess);
                }
                Err(e @ BackendError::UnexpectedState { .. }) => {
                    error!(job_id = self.job_id, error = %e, "Unknown scheduler state");
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.config.query_retries {
                        error!(
                            job_id = self.job_id,
                            failures,
                            error = %e,
                            "Batch job status unavailable; cancelling job"
                        );
                        let job = self.job_id.to_string();
                        if let Err(cancel) = self.scancel(&[&job]).await {
                            warn!(job_id = self.job_id, error = %cancel, "Cancelling unreachable batch job failed");
                        }
                        return Err(e);
                    }
                    let delay = self
                        .config
                        .poll_interval
                        .saturating_mul(1 << failures.min(5));
                    warn!(
                        job_id = self.job_id,
                        attempt = failures,
                        retry_in = ?delay,
                        error = %e,
                        "Batch job status query failed"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            failures = 0;

            self.state.send_if_modified(|current| {
                let changed = *current != Some(state);
                *current = Some(state);
                changed
            });
            if matches!(state, SlurmState::Running | SlurmState::Completed) {
                self.start_parallel_status();
            }

            if state.is_terminal() {
                debug!(job_id = self.job_id, ?state, ?exit_code, "Batch job finished");
                return Ok(terminal_outcome(state, exit_code));
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Start the parallel status side loop, at most once per job.
    fn start_parallel_status(&self) {
        let Some(argv) = self.config.parallel_status.clone() else {
            return;
        };
        if self.parallel_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state_rx = self.state.subscribe();
        let run_dir = self.run_dir.clone();
        let interval = self.config.parallel_status_interval;
        let job_id = self.job_id;
        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    Some(SlurmState::Running) => run_parallel_status(&run_dir, &argv).await,
                    Some(SlurmState::Completed) => {
                        run_parallel_status(&run_dir, &argv).await;
                        break;
                    }
                    Some(s) if s.is_terminal() => break,
                    _ => {}
                }
                // Sender dropped: the handle is gone.
                if state_rx.has_changed().is_err() {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            debug!(job_id, "Parallel status loop finished");
        });
    }
}

async fn run_parallel_status(run_dir: &Path, argv: &[String]) {
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    let result = Command::new(program)
        .args(args)
        .current_dir(run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            run_dir = %run_dir.display(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Parallel status command failed"
        ),
        Err(e) => warn!(run_dir = %run_dir.display(), error = %e, "Could not run parallel status"),
    }
}

#[async_trait]
impl ProcessHandle for BatchHandle {
    fn describe(&self) -> String {
        format!("slurm job {}", self.job_id)
    }

    async fn wait_for_exit(&self) -> Result<ExitOutcome, BackendError> {
        self.outcome
            .get_or_try_init(|| self.poll_until_done())
            .await
            .copied()
    }

    async fn kill(&self, grace_period: Duration) -> Result<(), BackendError> {
        if self.outcome.initialized() {
            return Ok(());
        }
        let job = self.job_id.to_string();

        match self.scancel(&["--signal=TERM", "--full", &job]).await {
            Ok(Scancel::Signaled) => {}
            Ok(Scancel::AlreadyFinished) => {
                debug!(job_id = self.job_id, "Batch job already finished");
                return Ok(());
            }
            Err(e) => warn!(job_id = self.job_id, error = %e, "Soft cancel failed; escalating"),
        }

        let deadline = tokio::time::Instant::now() + grace_period;
        while tokio::time::Instant::now() < deadline {
            match self.query().await {
                Ok(JobQuery::State { state, .. }) if state.is_terminal() => return Ok(()),
                Ok(JobQuery::Gone) => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(job_id = self.job_id, error = %e, "Status query during cancel failed"),
            }
            let step = self.config.poll_interval.min(grace_period);
            tokio::time::sleep(step).await;
        }

        warn!(job_id = self.job_id, "Batch job ignored SIGTERM; cancelling outright");
        self.scancel(&[&job]).await.map(|_| ())
    }
}

/// What `scancel` reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scancel {
    Signaled,
    /// The scheduler had nothing left to cancel.
    AlreadyFinished,
}

impl BatchHandle {
    async fn scancel(&self, args: &[&str]) -> Result<Scancel, BackendError> {
        let output = Command::new(&self.config.scancel)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                program: self.config.scancel.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(Scancel::Signaled);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already completing or completed") || stderr.contains("Invalid job id") {
            return Ok(Scancel::AlreadyFinished);
        }
        Err(BackendError::Signal {
            target: format!("slurm job {}", self.job_id),
            source: std::io::Error::other(stderr.trim().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = "JobId=1234 JobName=sim-abc\n   UserId=sim(1000) GroupId=sim(1000)\n   \
        JobState=RUNNING Reason=None Dependency=(null)\n   ExitCode=0:0\n";

    #[test]
    fn parses_submission_output() {
        assert_eq!(parse_job_id("Submitted batch job 1234\n").unwrap(), 1234);
        assert_eq!(parse_job_id("5678\n").unwrap(), 5678);
    }

    #[test]
    fn submission_without_id_is_parse_error() {
        let err = parse_job_id("sbatch: error: Batch job submission failed").unwrap_err();
        assert!(matches!(err, BackendError::ParseJobId { .. }));
    }

    #[test]
    fn parses_running_state() {
        assert_eq!(
            parse_job_query(1234, RUNNING).unwrap(),
            JobQuery::State {
                state: SlurmState::Running,
                exit_code: Some(0)
            }
        );
    }

    #[test]
    fn parses_failure_exit_code() {
        let out = "JobId=9 JobState=FAILED Reason=NonZeroExitCode ExitCode=7:0";
        assert_eq!(
            parse_job_query(9, out).unwrap(),
            JobQuery::State {
                state: SlurmState::Failed,
                exit_code: Some(7)
            }
        );
    }

    #[test]
    fn cancelled_by_user_suffix_is_ignored() {
        let out = "JobId=9 JobState=CANCELLED by 1000 ExitCode=0:15";
        match parse_job_query(9, out).unwrap() {
            JobQuery::State { state, .. } => assert_eq!(state, SlurmState::Cancelled),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_state_is_fatal() {
        let err = parse_job_query(9, "JobState=WIBBLE ExitCode=0:0").unwrap_err();
        assert!(matches!(err, BackendError::UnexpectedState { job_id: 9, .. }));
    }

    #[test]
    fn invalid_job_id_means_gone() {
        let out = "slurm_load_jobs error: Invalid job id specified";
        assert_eq!(parse_job_query(9, out).unwrap(), JobQuery::Gone);
    }

    #[test]
    fn terminal_outcomes() {
        assert_eq!(terminal_outcome(SlurmState::Completed, Some(0)), ExitOutcome::Exited(0));
        assert_eq!(terminal_outcome(SlurmState::Failed, Some(0)), ExitOutcome::Exited(1));
        assert_eq!(terminal_outcome(SlurmState::Timeout, None), ExitOutcome::Exited(1));
        assert_eq!(
            terminal_outcome(SlurmState::Cancelled, None),
            ExitOutcome::Signaled(libc::SIGTERM)
        );
    }

    #[test]
    fn renders_submission_script() {
        let backend = BatchBackend::new(
            &BackendConfig::default(),
            BatchConfig {
                partition: Some("debug".to_string()),
                tasks: Some(4),
                ..BatchConfig::default()
            },
        );
        let script = backend
            .render_script(
                Path::new("/srv/user/run dir"),
                &["python".to_string(), "parameters.py".to_string(), "it's".to_string()],
            )
            .unwrap();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --partition=debug\n"));
        assert!(script.contains("#SBATCH --ntasks=4\n"));
        assert!(script.contains("#SBATCH --job-name=sim-run_dir\n"));
        assert!(script.contains("#SBATCH --output=run.log\n"));
        assert!(!script.contains("--chdir"));
        assert!(
            script
                .lines()
                .any(|l| l.starts_with("cd ") && l.contains("run dir") && l != "cd /srv/user/run dir")
        );
        assert!(script.contains("exec srun python parameters.py"));
    }

    #[test]
    fn run_log_with_whitespace_is_rejected() {
        let backend = BatchBackend::new(
            &BackendConfig {
                run_log: "run log.txt".to_string(),
                ..BackendConfig::default()
            },
            BatchConfig::default(),
        );
        let err = backend
            .render_script(Path::new("/srv/job1"), &["render".to_string()])
            .unwrap_err();
        assert!(matches!(err, BackendError::Submit { .. }));
    }
}
