//! Per-job serialization of orchestrator work.

use crate::types::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per job. Every phase transition and regeneration step for a job runs while
/// holding its guard, so work on different jobs proceeds in parallel.
#[derive(Default)]
pub struct JobLocks {
    locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, job_id: &JobId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(*job_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry if nobody holds or waits on it.
    pub fn release_idle(&self, job_id: &JobId) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(job_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(job_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
