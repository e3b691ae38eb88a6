//! Run directory store: exclusive ownership of run directories.
//!
//! On-disk layout of a run directory:
//! - `in.json`: job input; carries the identity under `reportParametersHash`
//! - `status`: plain text `running|pending|completed|canceled|error`
//! - `result.json`: `{"state": <status>}`, written at most once per job
//!
//! The table lock only guards the in-memory map. Files are written by the
//! caller holding the directory's `DirLocks` guard, or by the supervisor
//! finalizing the record that still owns the directory.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{JobError, StoreError};
use crate::job::identity::JobIdentity;
use crate::job::record::JobRecord;
use crate::job::status::JobStatus;

pub const INPUT_FILE: &str = "in.json";
pub const STATUS_FILE: &str = "status";
pub const RESULT_FILE: &str = "result.json";
pub const IDENTITY_FIELD: &str = "reportParametersHash";

/// Contents of `result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFile {
    pub state: JobStatus,
}

/// Maps run directories to at most one in-memory job record.
#[derive(Debug, Default)]
pub struct RunDirectoryStore {
    jobs: Mutex<HashMap<PathBuf, Arc<JobRecord>>>,
}

impl RunDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity and status of whatever owns `run_dir`.
    ///
    /// The in-memory record wins while a job is supervised; otherwise the
    /// status files are read. A `pending` or `running` status on disk with no
    /// supervisor means the supervising process died, and is reported as
    /// `Error`.
    pub async fn status_of(
        &self,
        run_dir: &Path,
    ) -> Result<(Option<JobIdentity>, JobStatus), StoreError> {
        let Some(record) = self.get(run_dir).await else {
            return read_disk_status(run_dir).await;
        };

        let identity = Some(record.identity().clone());
        if let Some(status) = record.finalizing() {
            return Ok((identity, status));
        }
        if exists(&run_dir.join(RESULT_FILE)).await? {
            // Finalizing may have begun after the check above.
            if let Some(status) = record.finalizing() {
                return Ok((identity, status));
            }
            error!(
                run_dir = %run_dir.display(),
                jhash = %record.identity(),
                "Supervised job already has a result on disk"
            );
            return Err(StoreError::Inconsistent {
                run_dir: run_dir.to_path_buf(),
            });
        }
        Ok((identity, record.status()))
    }

    /// The in-memory record for `run_dir`, if any.
    pub async fn get(&self, run_dir: &Path) -> Option<Arc<JobRecord>> {
        self.jobs.lock().await.get(run_dir).cloned()
    }

    /// All supervised jobs.
    pub async fn active(&self) -> Vec<Arc<JobRecord>> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Replace the contents of `run_dir` with the prepared `tmp_dir` and
    /// create its job record.
    ///
    /// The caller must already have stopped any job in the directory; finding
    /// a record here is a `Collision`.
    pub async fn claim(
        &self,
        run_dir: &Path,
        identity: &JobIdentity,
        tmp_dir: &Path,
    ) -> Result<Arc<JobRecord>, JobError> {
        if let Some(existing) = self.get(run_dir).await {
            return Err(collision(run_dir, &existing));
        }

        match fs::remove_dir_all(run_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(run_dir, e).into()),
        }
        if let Some(parent) = run_dir.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        fs::rename(tmp_dir, run_dir)
            .await
            .map_err(|e| StoreError::io(tmp_dir, e))?;

        record_identity(run_dir, identity).await?;
        // Write-ahead: a crash from here on leaves `running` with no
        // supervisor, which readers report as an error.
        write_atomic(&run_dir.join(STATUS_FILE), JobStatus::Running.as_str().as_bytes()).await?;

        let record = Arc::new(JobRecord::new(run_dir.to_path_buf(), identity.clone()));
        match self.jobs.lock().await.entry(run_dir.to_path_buf()) {
            Entry::Occupied(existing) => return Err(collision(run_dir, existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&record));
            }
        }
        debug!(run_dir = %run_dir.display(), jhash = %identity, "Claimed run directory");
        Ok(record)
    }

    /// Persist the terminal status of `record` and drop it from the table.
    ///
    /// Nothing is written when the table no longer holds this exact record,
    /// since the directory then belongs to someone else. Returns whether a
    /// new result file was written.
    pub async fn finalize(
        &self,
        record: &Arc<JobRecord>,
        status: JobStatus,
    ) -> Result<bool, StoreError> {
        let run_dir = record.run_dir();
        if !self.owns(record).await {
            warn!(
                run_dir = %run_dir.display(),
                jhash = %record.identity(),
                "Supervised record was replaced; not persisting its status"
            );
            record.set_status(status);
            return Ok(false);
        }

        // The record stays in the table while writing, so the directory
        // cannot be claimed underneath us.
        record.begin_finalize(status);
        let written = write_terminal_status(run_dir, status).await;

        // Remove even if the write failed so the directory is not wedged.
        {
            let mut jobs = self.jobs.lock().await;
            if jobs
                .get(run_dir)
                .is_some_and(|current| Arc::ptr_eq(current, record))
            {
                jobs.remove(run_dir);
            }
        }
        record.set_status(status);
        written
    }

    async fn owns(&self, record: &Arc<JobRecord>) -> bool {
        self.jobs
            .lock()
            .await
            .get(record.run_dir())
            .is_some_and(|current| Arc::ptr_eq(current, record))
    }
}

fn collision(run_dir: &Path, existing: &JobRecord) -> JobError {
    JobError::Collision {
        run_dir: run_dir.to_path_buf(),
        jhash: existing.identity().to_string(),
    }
}

/// Write `result.json` and the status marker unless a result already exists.
///
/// Returns `false` when an earlier writer won.
pub async fn write_terminal_status(run_dir: &Path, status: JobStatus) -> Result<bool, StoreError> {
    let path = run_dir.join(RESULT_FILE);
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await;
    let mut file = match file {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(run_dir = %run_dir.display(), %status, "Result already written");
            return Ok(false);
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let body = serde_json::to_vec(&ResultFile { state: status }).map_err(|source| {
        StoreError::Json {
            path: path.clone(),
            source,
        }
    })?;
    file.write_all(&body)
        .await
        .map_err(|e| StoreError::io(&path, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(&path, e))?;

    write_atomic(&run_dir.join(STATUS_FILE), status.as_str().as_bytes()).await?;
    Ok(true)
}

/// Read a run directory's status from disk only.
pub async fn read_disk_status(
    run_dir: &Path,
) -> Result<(Option<JobIdentity>, JobStatus), StoreError> {
    let status_path = run_dir.join(STATUS_FILE);
    let input_path = run_dir.join(INPUT_FILE);
    if !exists(&status_path).await? || !exists(&input_path).await? {
        return Ok((None, JobStatus::Missing));
    }

    let raw = fs::read_to_string(&status_path)
        .await
        .map_err(|e| StoreError::io(&status_path, e))?;
    let status: JobStatus = raw.parse().map_err(|_| StoreError::MalformedStatus {
        path: status_path.clone(),
        value: raw.trim().to_string(),
    })?;

    let identity = read_identity(run_dir).await?;

    let status = match status {
        JobStatus::Pending | JobStatus::Running => {
            debug!(
                run_dir = %run_dir.display(),
                disk_status = %status,
                "Unsupervised job found on disk; treating as crashed"
            );
            JobStatus::Error
        }
        other => other,
    };
    Ok((Some(identity), status))
}

async fn read_identity(run_dir: &Path) -> Result<JobIdentity, StoreError> {
    let path = run_dir.join(INPUT_FILE);
    let raw = fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
    let input: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
    input
        .get(IDENTITY_FIELD)
        .and_then(serde_json::Value::as_str)
        .map(JobIdentity::new)
        .ok_or_else(|| StoreError::MissingIdentity {
            run_dir: run_dir.to_path_buf(),
        })
}

/// Make sure `in.json` names `identity`, creating the file if needed.
async fn record_identity(run_dir: &Path, identity: &JobIdentity) -> Result<(), StoreError> {
    let path = run_dir.join(INPUT_FILE);
    let mut input = match fs::read(&path).await {
        Ok(raw) => serde_json::from_slice(&raw).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?,
        Err(e) if e.kind() == ErrorKind::NotFound => serde_json::json!({}),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let serde_json::Value::Object(fields) = &mut input else {
        return Err(StoreError::MissingIdentity {
            run_dir: run_dir.to_path_buf(),
        });
    };
    if fields.get(IDENTITY_FIELD).and_then(serde_json::Value::as_str) == Some(identity.as_str()) {
        return Ok(());
    }
    fields.insert(
        IDENTITY_FIELD.to_string(),
        serde_json::Value::String(identity.to_string()),
    );

    let body = serde_json::to_vec_pretty(&input).map_err(|source| StoreError::Json {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &body).await
}

/// Write via a temporary sibling and rename so readers never see a partial file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

async fn exists(path: &Path) -> Result<bool, StoreError> {
    fs::try_exists(path).await.map_err(|e| StoreError::io(path, e))
}
