//! Job engine: run-directory ownership, the start/cancel state machine and
//! per-job supervision.
//!
//! Core components:
//! - `status`: `JobStatus` (Missing → Running → Completed/Canceled/Error)
//! - `identity`: `JobIdentity`, the parameter hash ("jhash")
//! - `record`: in-memory `JobRecord` for a supervised job
//! - `store`: `RunDirectoryStore` and the on-disk status files
//! - `locks`: per-run-directory async locks
//! - `tracker`: `JobTracker`, the coordinator callers talk to
//! - `supervisor`: background task awaiting each process

pub mod identity;
pub mod locks;
pub mod record;
pub mod status;
pub mod store;
mod supervisor;
pub mod tracker;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use identity::JobIdentity;
pub use record::JobRecord;
pub use status::JobStatus;
pub use store::RunDirectoryStore;
pub use tracker::{JobTracker, StartOutcome};

/// A job reached a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub run_dir: PathBuf,
    pub jhash: JobIdentity,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}
