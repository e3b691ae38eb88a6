//! Job tracker: the start/cancel/status state machine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::ProcessBackend;
use crate::error::{JobError, StoreError};
use crate::job::JobEvent;
use crate::job::identity::JobIdentity;
use crate::job::locks::DirLocks;
use crate::job::record::JobRecord;
use crate::job::status::JobStatus;
use crate::job::store::RunDirectoryStore;
use crate::job::supervisor::{self, Supervision};

/// Extra time, beyond the grace period, a stale job gets to be reaped.
const STOP_SLACK: Duration = Duration::from_secs(30);

/// What `start_report_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was launched.
    Started,
    /// The same job was already running; the request was dropped.
    AlreadyRunning,
}

/// Coordinates jobs across run directories.
///
/// Start, cancel and status requests for one directory are serialized by a
/// per-directory lock; different directories proceed independently.
pub struct JobTracker {
    store: Arc<RunDirectoryStore>,
    locks: DirLocks,
    grace_period: Duration,
    events: broadcast::Sender<JobEvent>,
}

impl JobTracker {
    pub fn new(grace_period: Duration) -> Self {
        Self::with_store(Arc::new(RunDirectoryStore::new()), grace_period)
    }

    pub fn with_store(store: Arc<RunDirectoryStore>, grace_period: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            locks: DirLocks::new(),
            grace_period,
            events,
        }
    }

    /// Replace the event channel with one holding `capacity` events.
    ///
    /// Subscribers slower than that see `RecvError::Lagged`.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = broadcast::channel(capacity).0;
        self
    }

    pub fn store(&self) -> &Arc<RunDirectoryStore> {
        &self.store
    }

    /// Terminal transitions of every job this tracker supervises.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Start `cmd` in `run_dir` unless the same job is already running there.
    ///
    /// A running job with a different identity is killed, and waited for,
    /// first. Returns once the process is launched; completion is handled by
    /// a background supervisor.
    pub async fn start_report_job(
        &self,
        run_dir: &Path,
        identity: &JobIdentity,
        backend: Arc<dyn ProcessBackend>,
        cmd: &[String],
        tmp_dir: &Path,
    ) -> Result<StartOutcome, JobError> {
        if cmd.is_empty() {
            return Err(JobError::EmptyCommand {
                run_dir: run_dir.to_path_buf(),
            });
        }

        let _guard = self.locks.lock(run_dir).await;

        let (current, status) = self.store.status_of(run_dir).await?;
        if status.is_active() {
            if current.as_ref() == Some(identity) {
                info!(
                    run_dir = %run_dir.display(),
                    jhash = %identity,
                    "Job already running; ignoring duplicate start"
                );
                discard_tmp_dir(tmp_dir).await;
                return Ok(StartOutcome::AlreadyRunning);
            }

            info!(
                run_dir = %run_dir.display(),
                stale = ?current.as_ref().map(JobIdentity::as_str),
                jhash = %identity,
                "Killing stale job before starting new one"
            );
            if let Some(stale) = self.kill_locked(run_dir).await? {
                self.wait_stopped(&stale).await?;
            }
        }
        // A job that just exited may still be persisting its result.
        if let Some(finishing) = self.store.get(run_dir).await {
            self.wait_stopped(&finishing).await?;
        }

        let record = self.store.claim(run_dir, identity, tmp_dir).await?;

        let handle = match backend.start(run_dir, cmd).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    run_dir = %run_dir.display(),
                    jhash = %identity,
                    backend = %backend.kind(),
                    error = %e,
                    "Backend failed to start job"
                );
                if let Err(persist) = self.store.finalize(&record, JobStatus::Error).await {
                    error!(run_dir = %run_dir.display(), error = %persist, "Failed to persist start failure");
                }
                return Err(e.into());
            }
        };

        info!(
            run_dir = %run_dir.display(),
            jhash = %identity,
            backend = %backend.kind(),
            process = %handle.describe(),
            "Job started"
        );
        record.attach(handle);

        supervisor::spawn(Supervision {
            store: Arc::clone(&self.store),
            record,
            backend,
            events: self.events.clone(),
        });

        Ok(StartOutcome::Started)
    }

    /// Request termination of whatever runs in `run_dir`.
    ///
    /// A no-op when nothing is running. The terminal `Canceled` status is
    /// recorded by the supervisor once the process has actually exited.
    pub async fn kill_all(&self, run_dir: &Path) -> Result<(), JobError> {
        let _guard = self.locks.lock(run_dir).await;
        self.kill_locked(run_dir).await.map(|_| ())
    }

    /// Kill the job in `run_dir` only while it is `identity` and active.
    ///
    /// The identity check and the kill happen under one directory lock, so a
    /// job started in between by another request is never touched. Returns the
    /// status of `identity` observed before killing.
    pub async fn kill_if(
        &self,
        run_dir: &Path,
        identity: &JobIdentity,
    ) -> Result<JobStatus, JobError> {
        let _guard = self.locks.lock(run_dir).await;
        let (current, status) = self.store.status_of(run_dir).await?;
        match current {
            Some(current) if &current == identity => {}
            Some(current) => {
                debug!(
                    run_dir = %run_dir.display(),
                    jhash = %identity,
                    current = %current,
                    "Cancel for a job no longer in the directory"
                );
                return Ok(JobStatus::Missing);
            }
            None => return Ok(status),
        }
        if status.is_active() {
            self.kill_locked(run_dir).await?;
        }
        Ok(status)
    }

    /// Status of `identity` in `run_dir`; another identity's job reads as
    /// `Missing`.
    pub async fn status(
        &self,
        run_dir: &Path,
        identity: &JobIdentity,
    ) -> Result<JobStatus, StoreError> {
        let _guard = self.locks.lock(run_dir).await;
        let (current, status) = self.store.status_of(run_dir).await?;
        match current {
            Some(current) if &current == identity => Ok(status),
            Some(_) => Ok(JobStatus::Missing),
            None => Ok(status),
        }
    }

    /// Run directories currently supervised.
    pub async fn active_jobs(&self) -> Vec<Arc<JobRecord>> {
        self.store.active().await
    }

    /// Cancel every supervised job and wait for each to be finalized.
    pub async fn kill_everything(&self) -> usize {
        let records = self.store.active().await;
        for record in &records {
            if let Err(e) = self.kill_all(record.run_dir()).await {
                warn!(
                    run_dir = %record.run_dir().display(),
                    error = %e,
                    "Failed to kill job during shutdown"
                );
            }
        }
        let waits = records.iter().map(|r| self.wait_stopped(r));
        join_all(waits).await;
        records.len()
    }

    async fn kill_locked(&self, run_dir: &Path) -> Result<Option<Arc<JobRecord>>, JobError> {
        let Some(record) = self.store.get(run_dir).await else {
            debug!(run_dir = %run_dir.display(), "Nothing to kill");
            return Ok(None);
        };
        if record.status() != JobStatus::Running {
            return Ok(None);
        }

        record.request_cancel();
        if let Some(handle) = record.handle() {
            info!(
                run_dir = %run_dir.display(),
                jhash = %record.identity(),
                process = %handle.describe(),
                "Killing job"
            );
            handle.kill(self.grace_period).await?;
        }
        Ok(Some(record))
    }

    async fn wait_stopped(&self, record: &JobRecord) -> Result<JobStatus, JobError> {
        let limit = self.grace_period + STOP_SLACK;
        tokio::time::timeout(limit, record.finished())
            .await
            .map_err(|_| JobError::StopTimeout {
                run_dir: record.run_dir().to_path_buf(),
                waited: limit,
            })
    }
}

async fn discard_tmp_dir(tmp_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(tmp_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(tmp_dir = %tmp_dir.display(), error = %e, "Failed to discard temporary directory");
        }
    }
}
