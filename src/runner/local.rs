//! In-process runner backed by a `JobTracker`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::JobRunner;
use crate::backend::Backends;
use crate::error::Error;
use crate::job::{JobStatus, JobTracker};
use crate::protocol::{JobQuery, StartRequest, StateReply};

/// Runs jobs on this host.
pub struct LocalRunner {
    tracker: Arc<JobTracker>,
    backends: Backends,
}

impl LocalRunner {
    pub fn new(tracker: Arc<JobTracker>, backends: Backends) -> Self {
        Self { tracker, backends }
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }
}

#[async_trait]
impl JobRunner for LocalRunner {
    async fn start(&self, request: StartRequest) -> Result<StateReply, Error> {
        let backend = self.backends.get(request.backend)?;
        let outcome = self
            .tracker
            .start_report_job(
                &request.run_dir,
                &request.jhash,
                backend,
                &request.cmd,
                &request.tmp_dir,
            )
            .await?;
        debug!(run_dir = %request.run_dir.display(), ?outcome, "Start request handled");

        let state = self.tracker.status(&request.run_dir, &request.jhash).await?;
        Ok(StateReply::new(state))
    }

    async fn status(&self, query: &JobQuery) -> Result<JobStatus, Error> {
        Ok(self.tracker.status(&query.run_dir, &query.jhash).await?)
    }

    async fn cancel(&self, query: &JobQuery) -> Result<JobStatus, Error> {
        self.tracker.kill_if(&query.run_dir, &query.jhash).await?;
        Ok(self.tracker.status(&query.run_dir, &query.jhash).await?)
    }
}
