//! Worker Pool
//!
//! A fixed number of tokio worker tasks pull units from the [`WorkQueue`], run one attempt
//! each through [`Attempt`], and either re-enqueue the unit after its backoff delay or hand the
//! terminal outcome to the orchestrator over a channel. The pool owns `Unit.status` while a
//! unit is checked out.

use crate::error::{EngineError, UnitError, UnitErrorCode};
use crate::executor::ExecutorTable;
use crate::job::{Unit, UnitStatus};
use crate::queue::{QueueEntry, Release, WorkQueue};
use crate::retry::{Attempt, AttemptOutcome, BackoffPolicy};
use crate::tracker::event::UnitEventData;
use crate::tracker::{EventType, ProgressTracker};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Terminal result of a unit, delivered to the orchestrator.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Succeeded(Unit),
    Failed(Unit),
    /// Dropped because its job was cancelled
    Aborted(Unit),
}

impl UnitOutcome {
    pub fn unit(&self) -> &Unit {
        match self {
            UnitOutcome::Succeeded(unit) | UnitOutcome::Failed(unit) | UnitOutcome::Aborted(unit) => unit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// Upper bound on an idle worker's wait between queue checks
    pub idle_poll_interval: Duration,
}

struct PoolShared {
    queue: Arc<WorkQueue>,
    tracker: Arc<ProgressTracker>,
    executors: ExecutorTable,
    backoff: BackoffPolicy,
    /// Dropped on stop so the receiving side drains and ends
    outcomes: RwLock<Option<mpsc::UnboundedSender<UnitOutcome>>>,
    running: RwLock<bool>,
    idle_poll_interval: Duration,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    worker_count: usize,
    workers: RwLock<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        queue: Arc<WorkQueue>,
        tracker: Arc<ProgressTracker>,
        executors: ExecutorTable,
        backoff: BackoffPolicy,
        outcomes: mpsc::UnboundedSender<UnitOutcome>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                queue,
                tracker,
                executors,
                backoff,
                outcomes: RwLock::new(Some(outcomes)),
                running: RwLock::new(false),
                idle_poll_interval: config.idle_poll_interval,
            }),
            worker_count: config.worker_count.max(1),
            workers: RwLock::new(Vec::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Spawn the worker tasks. Idempotent.
    pub fn start(&self) {
        {
            let mut running = self.shared.running.write();
            if *running {
                return;
            }
            *running = true;
        }
        let mut workers = self.workers.write();
        for worker_id in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, shared).await;
            }));
        }
        info!(worker_count = self.worker_count, "Worker pool started");
    }

    /// Stop taking work, wait for in-flight attempts to finish, then close the outcome
    /// channel. A stopped pool cannot be restarted.
    pub async fn stop(&self) {
        *self.shared.running.write() = false;
        let workers: Vec<JoinHandle<()>> = self.workers.write().drain(..).collect();
        for result in join_all(workers).await {
            if let Err(err) = result {
                warn!(error = %err, "Worker task ended abnormally");
            }
        }
        self.shared.outcomes.write().take();
        info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.read()
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    debug!(worker_id, "Worker started");
    while *shared.running.read() {
        let Some(entry) = shared.queue.try_claim() else {
            shared.queue.wait_for_work(shared.idle_poll_interval).await;
            continue;
        };
        if let Err(err) = process_entry(worker_id, &shared, &entry).await {
            error!(
                worker_id,
                unit_id = %entry.unit_id,
                job_id = %entry.job_id,
                error = %err,
                "Failed to process unit"
            );
            shared.queue.release(&entry, Release::Dropped);
        }
    }
    debug!(worker_id, "Worker stopped");
}

async fn process_entry(worker_id: usize, shared: &PoolShared, entry: &QueueEntry) -> Result<(), EngineError> {
    let tracker = &shared.tracker;

    // cancellation is checked before any attempt starts
    let job = tracker.load_job(&entry.job_id)?;
    if job.cancel_requested || job.is_terminal() {
        let (unit, _) = tracker.update_unit(&entry.unit_id, |unit| {
            unit.status = UnitStatus::Aborted;
            unit.last_error = Some(UnitError::fatal(UnitErrorCode::Cancelled, "job cancelled"));
            Ok(())
        })?;
        debug!(worker_id, unit_id = %unit.id, job_id = %unit.job_id, "Dropped unit of cancelled job");
        tracker.emit(&unit.job_id, EventType::UnitAborted, unit_event(&unit, None, None));
        shared.queue.release(entry, Release::Dropped);
        send(shared, UnitOutcome::Aborted(unit));
        return Ok(());
    }

    let (unit, _) = tracker.update_unit(&entry.unit_id, |unit| {
        if !unit.attempts_remaining() {
            return Err(EngineError::InvalidState(format!(
                "unit {} has used all {} attempts",
                unit.id, unit.max_attempts
            )));
        }
        unit.status = UnitStatus::Running;
        unit.attempt_count += 1;
        Ok(())
    })?;
    debug!(
        worker_id,
        unit_id = %unit.id,
        job_id = %unit.job_id,
        kind = %unit.kind,
        attempt = unit.attempt_count,
        "Unit attempt started"
    );
    tracker.emit(&unit.job_id, EventType::UnitStarted, unit_event(&unit, None, None));

    let started = Instant::now();
    let outcome = Attempt::new(&shared.executors, &shared.backoff).run(&unit).await;
    let elapsed_ms = started.elapsed().as_millis();

    match outcome {
        AttemptOutcome::Succeeded(artifact) => {
            let (unit, _) = tracker.update_unit(&unit.id, |unit| {
                unit.status = UnitStatus::Succeeded;
                unit.result_ref = Some(artifact.result_ref().clone());
                unit.artifact = Some(artifact.clone());
                Ok(())
            })?;
            info!(
                worker_id,
                unit_id = %unit.id,
                job_id = %unit.job_id,
                kind = %unit.kind,
                attempt = unit.attempt_count,
                duration_ms = elapsed_ms,
                "Unit succeeded"
            );
            tracker.emit(&unit.job_id, EventType::UnitSucceeded, unit_event(&unit, None, None));
            shared.queue.release(entry, Release::Completed);
            send(shared, UnitOutcome::Succeeded(unit));
        }
        AttemptOutcome::Retry { error, delay } => {
            // no new attempt for a job cancelled while this one ran
            let cancelled = tracker
                .load_job(&unit.job_id)
                .map(|job| job.cancel_requested || job.is_terminal())
                .unwrap_or(false);
            if cancelled {
                let (unit, _) = tracker.update_unit(&unit.id, |unit| {
                    unit.status = UnitStatus::Aborted;
                    unit.last_error = Some(error.clone());
                    Ok(())
                })?;
                tracker.emit(&unit.job_id, EventType::UnitAborted, unit_event(&unit, None, Some(&error)));
                shared.queue.release(entry, Release::Dropped);
                send(shared, UnitOutcome::Aborted(unit));
                return Ok(());
            }

            let (unit, _) = tracker.update_unit(&unit.id, |unit| {
                unit.status = UnitStatus::Pending;
                unit.last_error = Some(error.clone());
                Ok(())
            })?;
            warn!(
                worker_id,
                unit_id = %unit.id,
                job_id = %unit.job_id,
                kind = %unit.kind,
                attempt = unit.attempt_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Unit attempt failed, retry scheduled"
            );
            tracker.emit(
                &unit.job_id,
                EventType::UnitRetryScheduled,
                unit_event(&unit, Some(delay), Some(&error)),
            );
            shared.queue.release(entry, Release::Retrying);
            let mut retry = QueueEntry::for_unit(&unit, entry.sla_deadline);
            retry.priority = entry.priority;
            if !shared.queue.enqueue_delayed(retry, delay) {
                return Err(EngineError::QueueClosed);
            }
        }
        AttemptOutcome::Failed(error) => {
            let (unit, _) = tracker.update_unit(&unit.id, |unit| {
                unit.status = UnitStatus::Failed;
                unit.last_error = Some(error.clone());
                Ok(())
            })?;
            error!(
                worker_id,
                unit_id = %unit.id,
                job_id = %unit.job_id,
                kind = %unit.kind,
                attempt = unit.attempt_count,
                error = %error,
                "Unit failed permanently"
            );
            tracker.emit(&unit.job_id, EventType::UnitFailed, unit_event(&unit, None, Some(&error)));
            shared.queue.release(entry, Release::Failed);
            send(shared, UnitOutcome::Failed(unit));
        }
    }
    Ok(())
}

fn send(shared: &PoolShared, outcome: UnitOutcome) {
    let outcomes = shared.outcomes.read();
    let delivered = outcomes.as_ref().map(|tx| tx.send(outcome).is_ok()).unwrap_or(false);
    if !delivered {
        warn!("Outcome channel closed, dropping unit outcome");
    }
}

pub(crate) fn unit_event(unit: &Unit, delay: Option<Duration>, error: Option<&UnitError>) -> UnitEventData {
    UnitEventData {
        unit_id: unit.id.to_string(),
        kind: unit.kind.to_string(),
        attempt: Some(unit.attempt_count),
        delay_ms: delay.map(|d| d.as_millis()),
        error: error.map(|e| e.code.as_str().to_string()),
        regeneration_id: unit.track.regeneration_id().map(|id| id.to_string()),
    }
}
