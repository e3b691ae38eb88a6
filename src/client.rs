//! HTTP client for the supervisor's job API.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::BackendKind;
use crate::error::ProtocolError;
use crate::job::{JobIdentity, JobStatus};
use crate::protocol::{JobQuery, StartRequest, StateReply};

/// Talks to a running supervisor.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    http: reqwest::Client,
    base_url: String,
}

impl RunnerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Ask the supervisor to start a job.
    pub async fn start_report_job(
        &self,
        run_dir: &Path,
        jhash: &JobIdentity,
        backend: BackendKind,
        cmd: &[String],
        tmp_dir: &Path,
    ) -> Result<StateReply, ProtocolError> {
        let request = StartRequest {
            run_dir: run_dir.to_path_buf(),
            jhash: jhash.clone(),
            backend,
            cmd: cmd.to_vec(),
            tmp_dir: tmp_dir.to_path_buf(),
        };
        self.post("/job/start", &request).await
    }

    pub async fn status(&self, run_dir: &Path, jhash: &JobIdentity) -> Result<JobStatus, ProtocolError> {
        let reply: StateReply = self.post("/job/status", &query(run_dir, jhash)).await?;
        Ok(reply.state)
    }

    pub async fn cancel(&self, run_dir: &Path, jhash: &JobIdentity) -> Result<JobStatus, ProtocolError> {
        let reply: StateReply = self.post("/job/cancel", &query(run_dir, jhash)).await?;
        Ok(reply.state)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProtocolError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

fn query(run_dir: &Path, jhash: &JobIdentity) -> JobQuery {
    JobQuery {
        run_dir: run_dir.to_path_buf(),
        jhash: jhash.clone(),
    }
}
