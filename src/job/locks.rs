//! Per-run-directory async locks.
//!
//! Waiters park on a mutex keyed by run directory; unrelated directories
//! never contend. Entries are dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

/// Keyed async mutex.
#[derive(Debug, Default)]
pub struct DirLocks {
    table: Arc<LockTable>,
}

impl DirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `run_dir`.
    pub async fn lock(&self, run_dir: &Path) -> DirGuard {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(table.entry(run_dir.to_path_buf()).or_default())
        };
        let guard = entry.lock_owned().await;
        DirGuard {
            run_dir: run_dir.to_path_buf(),
            table: Arc::clone(&self.table),
            guard: Some(guard),
        }
    }

    /// Number of directories with a holder or waiter.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one run directory; released on drop.
#[derive(Debug)]
pub struct DirGuard {
    run_dir: PathBuf,
    table: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        // Unlock first so the strong count below only counts the table and waiters.
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table
            .get(&self.run_dir)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            table.remove(&self.run_dir);
        }
    }
}
