//! Per-job supervision task.
//!
//! Owns one running process from launch to terminal status persistence:
//! wait for exit, decide the terminal status, run cancel cleanup, persist,
//! release the run directory, publish a `JobEvent`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::backend::{ExitOutcome, ProcessBackend};
use crate::error::BackendError;
use crate::job::JobEvent;
use crate::job::record::JobRecord;
use crate::job::status::JobStatus;
use crate::job::store::RunDirectoryStore;

/// Everything a supervision task needs.
pub(crate) struct Supervision {
    pub store: Arc<RunDirectoryStore>,
    pub record: Arc<JobRecord>,
    pub backend: Arc<dyn ProcessBackend>,
    pub events: broadcast::Sender<JobEvent>,
}

/// Spawn the supervisor for a started job.
///
/// A panic anywhere in supervision is logged here and goes no further.
pub(crate) fn spawn(supervision: Supervision) -> JoinHandle<()> {
    let run_dir = supervision.record.run_dir().to_path_buf();
    let jhash = supervision.record.identity().clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::spawn(supervise(supervision)).await {
            error!(
                run_dir = %run_dir.display(),
                %jhash,
                error = %e,
                "Supervisor task panicked"
            );
        }
    })
}

async fn supervise(supervision: Supervision) {
    let Supervision {
        store,
        record,
        backend,
        events,
    } = supervision;

    // The wait runs in its own task so that even a panicking backend still
    // gets its terminal status written below.
    let waited = match record.handle().cloned() {
        Some(handle) => tokio::spawn(async move { handle.wait_for_exit().await }).await,
        None => Ok(Err(BackendError::Wait(std::io::Error::other(
            "job has no process handle",
        )))),
    };

    let (status, exit_code) = terminal_status(&record, waited);

    if status == JobStatus::Canceled {
        if let Err(e) = backend.cleanup_canceled(record.run_dir()).await {
            warn!(
                run_dir = %record.run_dir().display(),
                error = %e,
                "Cancel cleanup failed"
            );
        }
    }

    match store.finalize(&record, status).await {
        Ok(true) => info!(
            run_dir = %record.run_dir().display(),
            jhash = %record.identity(),
            %status,
            "Job finished"
        ),
        Ok(false) => {}
        Err(e) => error!(
            run_dir = %record.run_dir().display(),
            jhash = %record.identity(),
            %status,
            error = %e,
            "Failed to persist terminal status"
        ),
    }

    let _ = events.send(JobEvent {
        run_dir: record.run_dir().to_path_buf(),
        jhash: record.identity().clone(),
        status,
        exit_code,
        at: Utc::now(),
    });
}

/// Terminal status for a finished wait.
fn terminal_status(
    record: &JobRecord,
    waited: Result<Result<ExitOutcome, BackendError>, JoinError>,
) -> (JobStatus, Option<i32>) {
    let run_dir = record.run_dir().display();
    let jhash = record.identity();

    let outcome = match waited {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(e)) => {
            error!(%run_dir, %jhash, error = %e, "Waiting for job failed");
            None
        }
        Err(e) => {
            error!(%run_dir, %jhash, error = %e, "Wait task panicked");
            None
        }
    };
    let exit_code = outcome.and_then(|o| o.code());

    if record.cancel_requested() {
        return (JobStatus::Canceled, exit_code);
    }
    match outcome {
        Some(o) if o.success() => (JobStatus::Completed, exit_code),
        Some(ExitOutcome::NoSuchProcess) => {
            error!(%run_dir, %jhash, "Job process disappeared");
            (JobStatus::Error, exit_code)
        }
        Some(_) => {
            error!(%run_dir, %jhash, exit_code = ?exit_code, "Job failed");
            (JobStatus::Error, exit_code)
        }
        None => (JobStatus::Error, exit_code),
    }
}
