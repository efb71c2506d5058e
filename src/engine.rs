//! Course engine facade.
//!
//! Wires the record store, progress tracker, work queue, admission controller, worker pool,
//! orchestrator and regeneration controller together and exposes the caller-facing
//! operations.

use crate::admission::AdmissionController;
use crate::config::{CoursegenConfig, EngineConfig, StorageBackend, StorageConfig};
use crate::error::EngineError;
use crate::executor::ExecutorTable;
use crate::job::{Job, PhasePlan};
use crate::orchestrator::JobOrchestrator;
use crate::pool::{PoolConfig, WorkerPool};
use crate::queue::{QueueStats, WorkQueue};
use crate::regeneration::RegenerationController;
use crate::retry::BackoffPolicy;
use crate::tracker::{JobEvent, JobReport, MemoryRecordStore, ProgressTracker, RecordStore, SledRecordStore};
use crate::types::{CourseSpec, JobId, SubmitOptions, UnitId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

/// Upper bound on one wait between job-state checks in `wait_for_terminal`.
const TERMINAL_POLL: Duration = Duration::from_millis(250);

/// Open the record store selected by the storage configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn RecordStore>, EngineError> {
    let store: Arc<dyn RecordStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryRecordStore::new()),
        StorageBackend::Sled => Arc::new(SledRecordStore::open(&config.resolved_path()?)?),
    };
    Ok(store)
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn RecordStore>>,
    executors: ExecutorTable,
    backoff: Option<BackoffPolicy>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, executors: ExecutorTable) -> Self {
        Self {
            config,
            store: None,
            executors,
            backoff: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the backoff policy derived from the configuration.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Build and start the engine. Must run inside a tokio runtime.
    pub fn build(self) -> Result<CourseEngine, EngineError> {
        self.config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            EngineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new()));
        let backoff = self
            .backoff
            .unwrap_or_else(|| BackoffPolicy::from_config(&config));

        let tracker = Arc::new(ProgressTracker::new(store, PhasePlan::from_config(&config)));
        let queue = Arc::new(WorkQueue::new(config.per_job_fanout_limit, config.sla_boost_window()));
        let admission = Arc::new(AdmissionController::new(config.global_concurrency_limit));
        let regeneration = Arc::new(RegenerationController::new(
            config.clone(),
            tracker.clone(),
            queue.clone(),
        ));
        let orchestrator = JobOrchestrator::new(
            config.clone(),
            tracker.clone(),
            queue.clone(),
            admission.clone(),
            regeneration,
        );

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            PoolConfig {
                worker_count: config.worker_count,
                idle_poll_interval: config.idle_poll_interval(),
            },
            queue.clone(),
            tracker.clone(),
            self.executors,
            backoff,
            outcome_tx,
        );
        pool.start();
        let dispatcher = orchestrator.spawn_dispatcher(outcome_rx);

        info!(
            workers = config.worker_count,
            concurrency_limit = config.global_concurrency_limit,
            fanout_limit = config.per_job_fanout_limit,
            "Course engine started"
        );
        Ok(CourseEngine {
            tracker,
            queue,
            admission,
            orchestrator,
            pool,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }
}

pub struct CourseEngine {
    tracker: Arc<ProgressTracker>,
    queue: Arc<WorkQueue>,
    admission: Arc<AdmissionController>,
    orchestrator: Arc<JobOrchestrator>,
    pool: WorkerPool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CourseEngine {
    pub fn builder(config: EngineConfig, executors: ExecutorTable) -> EngineBuilder {
        EngineBuilder::new(config, executors)
    }

    /// Start an engine on the store selected by `config.storage`.
    pub fn open(config: &CoursegenConfig, executors: ExecutorTable) -> Result<Self, EngineError> {
        let store = open_store(&config.storage)?;
        Self::builder(config.engine.clone(), executors)
            .with_store(store)
            .build()
    }

    pub async fn submit(&self, spec: CourseSpec, options: SubmitOptions) -> Result<JobId, EngineError> {
        self.orchestrator.submit(spec, options).await
    }

    /// Point-in-time status of a job. Side-effect free.
    pub fn status(&self, job_id: &JobId) -> Result<JobReport, EngineError> {
        self.tracker.report(job_id)
    }

    pub fn job(&self, job_id: &JobId) -> Result<Job, EngineError> {
        self.tracker.load_job(job_id)
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.orchestrator.cancel(job_id).await
    }

    pub async fn request_regeneration(
        &self,
        job_id: &JobId,
        chapter_index: usize,
        reason: &str,
    ) -> Result<UnitId, EngineError> {
        self.orchestrator
            .request_regeneration(job_id, chapter_index, reason)
            .await
    }

    /// Wait until the job reaches `Done`, `Failed` or `Degraded`.
    pub async fn wait_for_terminal(&self, job_id: &JobId, timeout: Duration) -> Result<JobReport, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            // register before checking so a change in between is not missed
            let changed = self.tracker.job_changed().notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let job = self.tracker.load_job(job_id)?;
            if job.is_terminal() {
                return self.tracker.report(job_id);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "job {job_id} still in {} after {}ms",
                    job.phase,
                    timeout.as_millis()
                )));
            }
            let wake = deadline.min(Instant::now() + TERMINAL_POLL);
            let _ = timeout_at(wake, changed).await;
        }
    }

    pub fn events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, EngineError> {
        self.tracker.events(job_id, after_seq)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, EngineError> {
        self.tracker.list_jobs()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn active_jobs(&self) -> usize {
        self.admission.active_count()
    }

    pub fn pending_jobs(&self) -> usize {
        self.admission.pending_count()
    }

    /// Stop accepting work, let running attempts finish, then apply their outcomes.
    ///
    /// Stopping the pool closes the outcome channel, so the dispatcher ends once every
    /// delivered outcome has been applied.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.queue.close();
        self.pool.stop().await;
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(err) = handle.await {
                warn!(error = %err, "Outcome dispatcher ended abnormally");
            }
        }
        self.tracker.flush()?;
        info!("Course engine stopped");
        Ok(())
    }
}
