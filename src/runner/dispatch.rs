//! Work queue handed out to polling agents.
//!
//! New jobs go to a shared queue that any agent may take from. Once a run
//! directory is bound to an agent, its cancels and takeover starts are routed
//! to that agent only, since the process lives on its host.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::JobRunner;
use crate::error::Error;
use crate::job::{JobIdentity, JobStatus};
use crate::protocol::{
    JobQuery, JobResultData, StartReportJob, StartRequest, StateReply, SupervisorReply,
};

/// How long finished jobs stay queryable by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Supervisor-side view of a job handed to an agent.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    pub request_id: Uuid,
    pub jhash: JobIdentity,
    pub state: JobStatus,
    /// Agent the job is bound to, once known.
    pub agent_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DispatchState {
    /// Starts any agent may take.
    shared: VecDeque<SupervisorReply>,
    /// Work that must reach one particular agent.
    routed: HashMap<String, VecDeque<SupervisorReply>>,
    jobs: HashMap<PathBuf, DispatchedJob>,
}

impl DispatchState {
    fn enqueue(&mut self, agent_id: Option<&str>, work: SupervisorReply) {
        match agent_id {
            Some(agent_id) => self
                .routed
                .entry(agent_id.to_string())
                .or_default()
                .push_back(work),
            None => self.shared.push_back(work),
        }
    }

    /// Drop a start for `run_dir` that no agent has taken yet.
    fn remove_queued_start(&mut self, run_dir: &Path) {
        self.shared.retain(|w| !queued_start_for(w, run_dir));
        for queue in self.routed.values_mut() {
            queue.retain(|w| !queued_start_for(w, run_dir));
        }
        self.routed.retain(|_, queue| !queue.is_empty());
    }

    /// Forget finished jobs last updated more than `retention` ago.
    fn prune(&mut self, retention: Duration) {
        let now = Utc::now();
        self.jobs.retain(|run_dir, job| {
            let expired = job.state.is_terminal()
                && (now - job.updated_at)
                    .to_std()
                    .is_ok_and(|age| age > retention);
            if expired {
                debug!(run_dir = %run_dir.display(), request_id = %job.request_id, "Forgetting finished job");
            }
            !expired
        });
    }
}

/// Queues jobs for agents and tracks what they report back.
#[derive(Debug)]
pub struct AgentDispatcher {
    state: Mutex<DispatchState>,
    retention: Duration,
}

impl Default for AgentDispatcher {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl AgentDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep finished jobs queryable for `retention`.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            retention,
        }
    }

    /// Next work item for `agent_id`, or `NoOp`.
    ///
    /// Work routed to this agent comes before shared work.
    pub async fn next_work(&self, agent_id: &str) -> SupervisorReply {
        let mut state = self.state.lock().await;
        let routed = state.routed.get_mut(agent_id).and_then(VecDeque::pop_front);
        if state.routed.get(agent_id).is_some_and(VecDeque::is_empty) {
            state.routed.remove(agent_id);
        }
        let Some(work) = routed.or_else(|| state.shared.pop_front()) else {
            return SupervisorReply::NoOp;
        };
        if let SupervisorReply::StartReportJob(start) = &work {
            if let Some(job) = state
                .jobs
                .get_mut(&start.run_dir)
                .filter(|job| job.request_id == start.request_id)
            {
                job.agent_id = Some(agent_id.to_string());
                job.updated_at = Utc::now();
            }
            info!(
                agent_id,
                request_id = %start.request_id,
                run_dir = %start.run_dir.display(),
                "Dispatched job to agent"
            );
        }
        work
    }

    /// The agent launched the job behind `request_id`.
    pub async fn job_started(&self, agent_id: &str, request_id: Uuid) {
        let mut state = self.state.lock().await;
        match state
            .jobs
            .values_mut()
            .find(|j| j.request_id == request_id)
        {
            Some(job) if job.state == JobStatus::Pending => {
                job.state = JobStatus::Running;
                job.updated_at = Utc::now();
            }
            Some(_) => {}
            None => debug!(agent_id, %request_id, "Start report for superseded request"),
        }
    }

    /// The agent reports a terminal status.
    pub async fn job_result(&self, agent_id: &str, request_id: Uuid, data: JobResultData) {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&data.run_dir) else {
            warn!(agent_id, %request_id, run_dir = %data.run_dir.display(), "Result for unknown run directory");
            return;
        };
        if job.request_id != request_id || job.jhash != data.jhash {
            debug!(agent_id, %request_id, "Result for superseded request");
            return;
        }
        if let Some(error) = &data.error {
            warn!(agent_id, %request_id, run_dir = %data.run_dir.display(), error, "Agent reported failure");
        }
        job.state = data.state;
        job.updated_at = Utc::now();
    }

    /// Supervisor-side record for `run_dir`.
    pub async fn job(&self, run_dir: &Path) -> Option<DispatchedJob> {
        self.state.lock().await.jobs.get(run_dir).cloned()
    }

    /// Work items not yet handed out, across all queues.
    pub async fn queued(&self) -> usize {
        let state = self.state.lock().await;
        state.shared.len() + state.routed.values().map(VecDeque::len).sum::<usize>()
    }
}

fn queued_start_for(work: &SupervisorReply, run_dir: &Path) -> bool {
    matches!(work, SupervisorReply::StartReportJob(s) if s.run_dir == run_dir)
}

#[async_trait]
impl JobRunner for AgentDispatcher {
    async fn start(&self, request: StartRequest) -> Result<StateReply, Error> {
        let mut state = self.state.lock().await;
        state.prune(self.retention);

        let mut owner = None;
        if let Some(job) = state.jobs.get(&request.run_dir) {
            if job.jhash == request.jhash && job.state.is_active() {
                return Ok(StateReply {
                    state: job.state,
                    request_id: Some(job.request_id),
                });
            }
            // The agent holding a live job must be the one to replace it.
            if job.state.is_active() {
                owner = job.agent_id.clone();
            }
        }

        // A queued start that no agent has picked up yet is simply superseded;
        // a dispatched one is killed by the owning agent's tracker on takeover.
        state.remove_queued_start(&request.run_dir);

        let request_id = Uuid::new_v4();
        state.enqueue(
            owner.as_deref(),
            SupervisorReply::StartReportJob(StartReportJob {
                request_id,
                run_dir: request.run_dir.clone(),
                jhash: request.jhash.clone(),
                backend: request.backend,
                cmd: request.cmd,
                tmp_dir: request.tmp_dir,
            }),
        );
        if let Some(agent_id) = &owner {
            debug!(agent_id, %request_id, run_dir = %request.run_dir.display(), "Routing takeover to owning agent");
        }
        state.jobs.insert(
            request.run_dir,
            DispatchedJob {
                request_id,
                jhash: request.jhash,
                state: JobStatus::Pending,
                agent_id: owner,
                updated_at: Utc::now(),
            },
        );

        Ok(StateReply {
            state: JobStatus::Pending,
            request_id: Some(request_id),
        })
    }

    async fn status(&self, query: &JobQuery) -> Result<JobStatus, Error> {
        let state = self.state.lock().await;
        Ok(match state.jobs.get(&query.run_dir) {
            Some(job) if job.jhash == query.jhash => job.state,
            _ => JobStatus::Missing,
        })
    }

    async fn cancel(&self, query: &JobQuery) -> Result<JobStatus, Error> {
        let mut state = self.state.lock().await;
        let (request_id, current, owner) = match state.jobs.get(&query.run_dir) {
            Some(job) if job.jhash == query.jhash && job.state.is_active() => {
                (job.request_id, job.state, job.agent_id.clone())
            }
            Some(job) if job.jhash == query.jhash => return Ok(job.state),
            _ => return Ok(JobStatus::Missing),
        };

        let Some(owner) = owner else {
            state.remove_queued_start(&query.run_dir);
            if let Some(job) = state.jobs.get_mut(&query.run_dir) {
                job.state = JobStatus::Canceled;
                job.updated_at = Utc::now();
            }
            return Ok(JobStatus::Canceled);
        };

        state.enqueue(
            Some(&owner),
            SupervisorReply::CancelJob {
                request_id,
                run_dir: query.run_dir.clone(),
                jhash: query.jhash.clone(),
            },
        );
        Ok(current)
    }
}
