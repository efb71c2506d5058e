//! Shared test utilities for integration tests
//!
//! Builds engines on simulated executors with millisecond backoff so whole jobs finish
//! in well under a second.

use coursegen::config::EngineConfig;
use coursegen::executor::{ExecutorTable, SimulatedExecutor};
use coursegen::retry::{BackoffPolicy, NoJitter};
use coursegen::tracker::{MemoryRecordStore, RecordStore};
use coursegen::types::JobId;
use coursegen::{CourseEngine, JobReport};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any job to reach a terminal phase in these tests.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine config with small pool, fast backoff and fast idle polling.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_count: 4,
        backoff_base_delay_ms: 5,
        backoff_max_delay_ms: 20,
        backoff_jitter_ratio: 0.0,
        idle_poll_interval_ms: 10,
        ..EngineConfig::default()
    }
}

pub fn start_engine(config: EngineConfig, executor: Arc<SimulatedExecutor>) -> CourseEngine {
    start_engine_with_store(config, executor, Arc::new(MemoryRecordStore::new()))
}

pub fn start_engine_with_store(
    config: EngineConfig,
    executor: Arc<SimulatedExecutor>,
    store: Arc<dyn RecordStore>,
) -> CourseEngine {
    let backoff = BackoffPolicy::from_config(&config).with_jitter(Arc::new(NoJitter));
    CourseEngine::builder(config, ExecutorTable::uniform(executor))
        .with_store(store)
        .with_backoff(backoff)
        .build()
        .expect("engine should start")
}

pub async fn run_to_end(engine: &CourseEngine, job_id: &JobId) -> JobReport {
    engine
        .wait_for_terminal(job_id, JOB_TIMEOUT)
        .await
        .expect("job should reach a terminal phase")
}

/// Poll until `check` holds for the job's report, or panic after `JOB_TIMEOUT`.
pub async fn wait_until<F>(engine: &CourseEngine, job_id: &JobId, mut check: F) -> JobReport
where
    F: FnMut(&JobReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
    loop {
        let report = engine.status(job_id).expect("job should exist");
        if check(&report) {
            return report;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached for job {job_id}: phase {}", report.phase);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
