//! Agent poll loop.
//!
//! The agent repeatedly POSTs to the supervisor's `/agent` endpoint. Replies
//! to `ready_for_work` carry the next work item; starts and cancels run on the
//! local `JobTracker`, and terminal transitions are reported back as
//! `process_result` messages ahead of the next poll. Work for one run
//! directory is applied in the order it arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{AgentRequest, JobResultData, StartReportJob, SupervisorReply};
use crate::backend::Backends;
use crate::config::AgentConfig;
use crate::error::ProtocolError;
use crate::job::locks::DirLocks;
use crate::job::{JobEvent, JobIdentity, JobStatus, JobTracker, StartOutcome};

type RequestMap = Arc<Mutex<HashMap<(PathBuf, JobIdentity), Uuid>>>;

/// An agent executing supervisor work on this host.
pub struct Agent {
    config: AgentConfig,
    http: reqwest::Client,
    tracker: Arc<JobTracker>,
    backends: Backends,
    /// Which supervisor request launched the job in each run directory.
    requests: RequestMap,
    order: Arc<DirLocks>,
}

/// Spawn the agent poll loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling;
/// running jobs are left to the caller (see `JobTracker::kill_everything`).
pub fn spawn_agent(
    config: AgentConfig,
    tracker: Arc<JobTracker>,
    backends: Backends,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let agent = Agent::new(config, tracker, backends);
    let handle = tokio::spawn(async move { agent.run(shutdown).await });
    (handle, shutdown_flag)
}

impl Agent {
    pub fn new(config: AgentConfig, tracker: Arc<JobTracker>, backends: Backends) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            tracker,
            backends,
            requests: Arc::new(Mutex::new(HashMap::new())),
            order: Arc::new(DirLocks::new()),
        }
    }

    /// Poll until `shutdown` is set.
    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        info!(
            agent_id = %self.config.agent_id,
            supervisor = %self.config.supervisor_url,
            backends = ?self.backends.kinds(),
            "Agent started"
        );

        let (outbox, mut inbox) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(
            self.config.agent_id.clone(),
            Arc::clone(&self.tracker),
            self.tracker.subscribe(),
            Arc::clone(&self.requests),
            outbox.clone(),
        ));

        let mut backoff = self.config.backoff;
        let mut pending: Option<AgentRequest> = None;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!(agent_id = %self.config.agent_id, "Agent shutting down");
                return;
            }

            let message = pending
                .take()
                .or_else(|| inbox.try_recv().ok())
                .unwrap_or_else(|| AgentRequest::ReadyForWork {
                    agent_id: self.config.agent_id.clone(),
                });
            let idle = matches!(message, AgentRequest::ReadyForWork { .. });

            let reply = match self.send(&message).await {
                Ok(reply) => {
                    backoff = self.config.backoff;
                    reply
                }
                Err(e) => {
                    let delay = with_jitter(backoff);
                    warn!(
                        agent_id = %self.config.agent_id,
                        error = %e,
                        retry_in = ?delay,
                        "Supervisor unreachable"
                    );
                    // Results must not be lost; polls can simply be redone.
                    if !idle {
                        pending = Some(message);
                    }
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            };

            match reply {
                SupervisorReply::StartReportJob(work) => self.start(work, outbox.clone()).await,
                SupervisorReply::CancelJob {
                    request_id,
                    run_dir,
                    jhash,
                } => self.cancel(request_id, run_dir, jhash),
                SupervisorReply::NoOp => {
                    if idle {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
    }

    /// POST one message and decode the supervisor's reply.
    pub async fn send(&self, message: &AgentRequest) -> Result<SupervisorReply, ProtocolError> {
        let url = format!("{}/agent", self.config.supervisor_url.trim_end_matches('/'));
        let response = self.http.post(&url).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ProtocolError::UnexpectedReply(e.to_string()))
    }

    async fn start(&self, work: StartReportJob, outbox: mpsc::UnboundedSender<AgentRequest>) {
        let agent_id = self.config.agent_id.clone();
        let backend = match self.backends.get(work.backend) {
            Ok(backend) => backend,
            Err(e) => {
                error!(agent_id = %agent_id, request_id = %work.request_id, error = %e, "Cannot run job");
                let _ = outbox.send(failure(&agent_id, &work, e.to_string()));
                return;
            }
        };

        self.requests
            .lock()
            .await
            .insert((work.run_dir.clone(), work.jhash.clone()), work.request_id);

        // Taken here so later work for the directory queues behind this start.
        let order = self.order.lock(&work.run_dir).await;
        // Starting may first wait for a stale job to stop; keep polling meanwhile.
        let tracker = Arc::clone(&self.tracker);
        let requests = Arc::clone(&self.requests);
        tokio::spawn(async move {
            let _order = order;
            let result = tracker
                .start_report_job(&work.run_dir, &work.jhash, backend, &work.cmd, &work.tmp_dir)
                .await;
            let message = match result {
                Ok(outcome) => {
                    if outcome == StartOutcome::AlreadyRunning {
                        debug!(request_id = %work.request_id, "Job was already running");
                    }
                    AgentRequest::ReportJobStarted {
                        agent_id,
                        request_id: work.request_id,
                    }
                }
                Err(e) => {
                    error!(
                        request_id = %work.request_id,
                        run_dir = %work.run_dir.display(),
                        error = %e,
                        "Failed to start job"
                    );
                    let mut requests = requests.lock().await;
                    let key = (work.run_dir.clone(), work.jhash.clone());
                    if requests.get(&key) == Some(&work.request_id) {
                        requests.remove(&key);
                    }
                    failure(&agent_id, &work, e.to_string())
                }
            };
            let _ = outbox.send(message);
        });
    }

    fn cancel(&self, request_id: Uuid, run_dir: PathBuf, jhash: JobIdentity) {
        let tracker = Arc::clone(&self.tracker);
        let order = Arc::clone(&self.order);
        tokio::spawn(async move {
            let _order = order.lock(&run_dir).await;
            match tracker.kill_if(&run_dir, &jhash).await {
                Ok(status) => info!(%request_id, run_dir = %run_dir.display(), %status, "Cancel handled"),
                Err(e) => error!(%request_id, run_dir = %run_dir.display(), error = %e, "Cancel failed"),
            }
        });
    }
}

fn failure(agent_id: &str, work: &StartReportJob, error: String) -> AgentRequest {
    AgentRequest::ProcessResult {
        agent_id: agent_id.to_string(),
        request_id: work.request_id,
        data: JobResultData {
            run_dir: work.run_dir.clone(),
            jhash: work.jhash.clone(),
            state: JobStatus::Error,
            error: Some(error),
        },
    }
}

/// Turn tracker events for dispatched jobs into `process_result` messages.
async fn forward_events(
    agent_id: String,
    tracker: Arc<JobTracker>,
    mut events: broadcast::Receiver<JobEvent>,
    requests: RequestMap,
    outbox: mpsc::UnboundedSender<AgentRequest>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Agent fell behind on job events; checking job statuses");
                if !report_finished(&agent_id, &tracker, &requests, &outbox).await {
                    return;
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let key = (event.run_dir.clone(), event.jhash.clone());
        let Some(request_id) = requests.lock().await.remove(&key) else {
            debug!(run_dir = %event.run_dir.display(), "Event for job not started by the supervisor");
            continue;
        };

        let message = result_message(&agent_id, request_id, event.run_dir, event.jhash, event.status);
        if outbox.send(message).is_err() {
            return;
        }
    }
}

/// Report every tracked job that is already terminal.
///
/// Returns `false` once the outbox is closed.
async fn report_finished(
    agent_id: &str,
    tracker: &JobTracker,
    requests: &RequestMap,
    outbox: &mpsc::UnboundedSender<AgentRequest>,
) -> bool {
    let tracked: Vec<_> = requests
        .lock()
        .await
        .iter()
        .map(|(key, request_id)| (key.clone(), *request_id))
        .collect();

    for ((run_dir, jhash), request_id) in tracked {
        let status = match tracker.status(&run_dir, &jhash).await {
            Ok(status) => status,
            Err(e) => {
                warn!(%request_id, run_dir = %run_dir.display(), error = %e, "Status check failed");
                continue;
            }
        };
        if !status.is_terminal() {
            continue;
        }
        {
            let mut requests = requests.lock().await;
            let key = (run_dir.clone(), jhash.clone());
            if requests.get(&key) != Some(&request_id) {
                continue;
            }
            requests.remove(&key);
        }
        if outbox
            .send(result_message(agent_id, request_id, run_dir, jhash, status))
            .is_err()
        {
            return false;
        }
    }
    true
}

fn result_message(
    agent_id: &str,
    request_id: Uuid,
    run_dir: PathBuf,
    jhash: JobIdentity,
    state: JobStatus,
) -> AgentRequest {
    AgentRequest::ProcessResult {
        agent_id: agent_id.to_string(),
        request_id,
        data: JobResultData {
            run_dir,
            jhash,
            state,
            error: None,
        },
    }
}

/// Spread retries by up to a quarter of the delay.
fn with_jitter(delay: Duration) -> Duration {
    let max = (delay.as_millis() / 4) as u64;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}
