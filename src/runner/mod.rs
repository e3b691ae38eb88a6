//! Job runners: what the supervisor's `/job/*` endpoints talk to.
//!
//! - `LocalRunner` executes through an in-process `JobTracker`
//! - `AgentDispatcher` queues work for remote agents to poll

pub mod dispatch;
pub mod local;

use async_trait::async_trait;

use crate::error::Error;
use crate::job::JobStatus;
use crate::protocol::{JobQuery, StartRequest, StateReply};

pub use dispatch::AgentDispatcher;
pub use local::LocalRunner;

/// Accepts start/status/cancel requests for jobs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Start a job (idempotent for an identical running job).
    async fn start(&self, request: StartRequest) -> Result<StateReply, Error>;

    /// Status of the job; `Missing` when another identity owns the directory.
    async fn status(&self, query: &JobQuery) -> Result<JobStatus, Error>;

    /// Request cancellation and return the status observed afterwards.
    async fn cancel(&self, query: &JobQuery) -> Result<JobStatus, Error>;
}
