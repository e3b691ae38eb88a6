//! Agent/supervisor wire protocol and the client job API.
//!
//! Agents never accept connections: they POST to the supervisor's `/agent`
//! endpoint and get work (or `no_op`) in the reply. All bodies are JSON
//! objects tagged by `action`.

pub mod agent;
pub mod server;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::job::{JobIdentity, JobStatus};

// ── Agent → Supervisor ──────────────────────────────────────────────────

/// Message from an agent to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentRequest {
    /// The agent is idle and asks for work.
    ReadyForWork { agent_id: String },
    /// A dispatched job was launched (or was already running).
    ReportJobStarted { agent_id: String, request_id: Uuid },
    /// A dispatched job reached a terminal status.
    ProcessResult {
        agent_id: String,
        request_id: Uuid,
        data: JobResultData,
    },
}

/// Final report for one dispatched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultData {
    pub run_dir: PathBuf,
    pub jhash: JobIdentity,
    pub state: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Supervisor → Agent ──────────────────────────────────────────────────

/// Reply from the supervisor to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupervisorReply {
    StartReportJob(StartReportJob),
    /// Kill the job in `run_dir` if it still has identity `jhash`.
    CancelJob {
        request_id: Uuid,
        run_dir: PathBuf,
        jhash: JobIdentity,
    },
    /// Nothing to do; poll again later.
    NoOp,
}

/// Work item: start a job on the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReportJob {
    pub request_id: Uuid,
    pub run_dir: PathBuf,
    pub jhash: JobIdentity,
    pub backend: BackendKind,
    pub cmd: Vec<String>,
    pub tmp_dir: PathBuf,
}

// ── Client API ──────────────────────────────────────────────────────────

/// Body of `POST /job/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub run_dir: PathBuf,
    pub jhash: JobIdentity,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    pub cmd: Vec<String>,
    pub tmp_dir: PathBuf,
}

fn default_backend() -> BackendKind {
    BackendKind::Local
}

/// Body of `POST /job/status` and `POST /job/cancel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQuery {
    pub run_dir: PathBuf,
    pub jhash: JobIdentity,
}

/// Reply to every `/job/*` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReply {
    pub state: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl StateReply {
    pub fn new(state: JobStatus) -> Self {
        Self {
            state,
            request_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ready_for_work_wire_format() {
        let msg = AgentRequest::ReadyForWork {
            agent_id: "a1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"action": "ready_for_work", "agent_id": "a1"})
        );
    }

    #[test]
    fn start_report_job_wire_format() {
        let request_id = Uuid::new_v4();
        let reply = SupervisorReply::StartReportJob(StartReportJob {
            request_id,
            run_dir: PathBuf::from("/srv/run/job1"),
            jhash: "hash-A".into(),
            backend: BackendKind::Batch,
            cmd: vec!["sleep".to_string(), "5".to_string()],
            tmp_dir: PathBuf::from("/srv/tmp/job1"),
        });
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["action"], "start_report_job");
        assert_eq!(value["jhash"], "hash-A");
        assert_eq!(value["backend"], "batch");
        assert_eq!(value["cmd"], json!(["sleep", "5"]));

        let back: SupervisorReply = serde_json::from_value(value).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn no_op_is_bare_action() {
        assert_eq!(
            serde_json::to_value(SupervisorReply::NoOp).unwrap(),
            json!({"action": "no_op"})
        );
    }

    #[test]
    fn process_result_parses() {
        let request_id = Uuid::new_v4();
        let msg: AgentRequest = serde_json::from_value(json!({
            "action": "process_result",
            "agent_id": "a1",
            "request_id": request_id,
            "data": {"run_dir": "/srv/run/job1", "jhash": "hash-A", "state": "completed"}
        }))
        .unwrap();
        match msg {
            AgentRequest::ProcessResult { data, .. } => {
                assert_eq!(data.state, JobStatus::Completed);
                assert_eq!(data.error, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_request_defaults_to_local_backend() {
        let req: StartRequest = serde_json::from_value(json!({
            "run_dir": "/tmp/job1",
            "jhash": "hash-A",
            "cmd": ["sleep", "5"],
            "tmp_dir": "/tmp/job1-tmp"
        }))
        .unwrap();
        assert_eq!(req.backend, BackendKind::Local);
    }
}
