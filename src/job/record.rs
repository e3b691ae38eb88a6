//! In-memory record of a supervised job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::backend::ProcessHandle;
use crate::job::identity::JobIdentity;
use crate::job::status::JobStatus;

/// The job currently owning a run directory.
///
/// Lives in the job table from `claim` until the supervisor has persisted the
/// terminal status.
#[derive(Debug)]
pub struct JobRecord {
    run_dir: PathBuf,
    identity: JobIdentity,
    status: watch::Sender<JobStatus>,
    handle: OnceLock<Arc<dyn ProcessHandle>>,
    /// Terminal status being persisted; set before any file is written.
    finalizing: OnceLock<JobStatus>,
    cancel_requested: AtomicBool,
    claimed_at: DateTime<Utc>,
}

impl JobRecord {
    pub(crate) fn new(run_dir: PathBuf, identity: JobIdentity) -> Self {
        let (status, _) = watch::channel(JobStatus::Pending);
        Self {
            run_dir,
            identity,
            status,
            handle: OnceLock::new(),
            finalizing: OnceLock::new(),
            cancel_requested: AtomicBool::new(false),
            claimed_at: Utc::now(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    pub fn handle(&self) -> Option<&Arc<dyn ProcessHandle>> {
        self.handle.get()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Attach the process handle once the backend has started the job.
    pub(crate) fn attach(&self, handle: Arc<dyn ProcessHandle>) {
        if self.handle.set(handle).is_ok() {
            self.status.send_replace(JobStatus::Running);
        }
    }

    /// The terminal status the supervisor is persisting, if it has begun.
    pub fn finalizing(&self) -> Option<JobStatus> {
        self.finalizing.get().copied()
    }

    pub(crate) fn begin_finalize(&self, status: JobStatus) {
        let _ = self.finalizing.set(status);
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.status.send_replace(status);
    }

    /// Wait until the supervisor has recorded a terminal status.
    pub async fn finished(&self) -> JobStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(JobStatus::is_terminal).await {
            Ok(status) => *status,
            // The sender lives in `self`, so it cannot be dropped while we wait.
            Err(_) => self.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_resolves_on_terminal_status() {
        let record = Arc::new(JobRecord::new(PathBuf::from("/tmp/job"), "hash-A".into()));
        assert_eq!(record.status(), JobStatus::Pending);

        let waiter = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { record.finished().await })
        };

        record.set_status(JobStatus::Running);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        record.set_status(JobStatus::Canceled);
        assert_eq!(waiter.await.unwrap(), JobStatus::Canceled);
    }

    #[test]
    fn cancel_flag() {
        let record = JobRecord::new(PathBuf::from("/tmp/job"), "hash-A".into());
        assert!(!record.cancel_requested());
        record.request_cancel();
        assert!(record.cancel_requested());
    }
}
