//! Supervisor HTTP surface: the client job API and the agent poll endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, warn};

use super::{AgentRequest, JobQuery, StartRequest, StateReply, SupervisorReply};
use crate::error::{ConfigError, Error, JobError};
use crate::runner::{AgentDispatcher, JobRunner};

/// Shared state for supervisor routes.
#[derive(Clone)]
pub struct ServerState {
    pub runner: Arc<dyn JobRunner>,
    /// Present only when jobs are dispatched to agents.
    pub dispatcher: Option<Arc<AgentDispatcher>>,
}

impl ServerState {
    /// Jobs run on this host.
    pub fn local(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            dispatcher: None,
        }
    }

    /// Jobs are queued for agents polling `/agent`.
    pub fn dispatching(dispatcher: Arc<AgentDispatcher>) -> Self {
        Self {
            runner: dispatcher.clone(),
            dispatcher: Some(dispatcher),
        }
    }
}

/// Build the supervisor routes.
pub fn supervisor_routes(state: ServerState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/job/start", post(start_job))
        .route("/job/status", post(job_status))
        .route("/job/cancel", post(cancel_job));
    if state.dispatcher.is_some() {
        router = router.route("/agent", post(agent_message));
    }
    router.with_state(state)
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// POST /job/start
async fn start_job(
    State(state): State<ServerState>,
    Json(request): Json<StartRequest>,
) -> Response {
    match state.runner.start(request).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /job/status
async fn job_status(State(state): State<ServerState>, Json(query): Json<JobQuery>) -> Response {
    match state.runner.status(&query).await {
        Ok(status) => Json(StateReply::new(status)).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /job/cancel
async fn cancel_job(State(state): State<ServerState>, Json(query): Json<JobQuery>) -> Response {
    match state.runner.cancel(&query).await {
        Ok(status) => Json(StateReply::new(status)).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /agent
///
/// Work is handed out only in reply to `ready_for_work`; reports get `no_op`.
async fn agent_message(
    State(state): State<ServerState>,
    Json(message): Json<AgentRequest>,
) -> Response {
    let Some(dispatcher) = state.dispatcher else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "agent dispatch is disabled"})),
        )
            .into_response();
    };

    let reply = match message {
        AgentRequest::ReadyForWork { agent_id } => dispatcher.next_work(&agent_id).await,
        AgentRequest::ReportJobStarted {
            agent_id,
            request_id,
        } => {
            dispatcher.job_started(&agent_id, request_id).await;
            SupervisorReply::NoOp
        }
        AgentRequest::ProcessResult {
            agent_id,
            request_id,
            data,
        } => {
            dispatcher.job_result(&agent_id, request_id, data).await;
            SupervisorReply::NoOp
        }
    };
    Json(reply).into_response()
}

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::Config(ConfigError::BackendNotConfigured { .. })
        | Error::Job(JobError::EmptyCommand { .. }) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::Collision { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "Job request failed");
    } else {
        warn!(error = %e, "Job request rejected");
    }
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}
