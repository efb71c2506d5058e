use crate::test_utils::{fast_config, run_to_end, start_engine_with_store};
use coursegen::config::{ConfigLoader, StorageBackend};
use coursegen::executor::SimulatedExecutor;
use coursegen::job::{Phase, PhasePlan, UnitStatus};
use coursegen::tracker::{EventType, ProgressTracker, RecordStore, SledRecordStore};
use coursegen::types::{CourseSpec, SubmitOptions};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_job_survives_a_new_store_handle() {
    let temp_dir = TempDir::new().unwrap();
    let db = sled::open(temp_dir.path().join("store")).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SledRecordStore::new(db.clone()).unwrap());

    let config = fast_config();
    let engine = start_engine_with_store(config.clone(), Arc::new(SimulatedExecutor::new()), store);
    let job_id = engine
        .submit(CourseSpec::new("course-sled", "Rust", 3), SubmitOptions::default())
        .await
        .unwrap();
    let live = run_to_end(&engine, &job_id).await;
    engine.request_regeneration(&job_id, 1, "shorter").await.unwrap();
    crate::test_utils::wait_until(&engine, &job_id, |report| {
        report.regenerations.iter().all(|r| r.status != coursegen::regeneration::RegenerationStatus::Running)
    })
    .await;
    engine.shutdown().await.unwrap();

    let reopened = ProgressTracker::new(
        Arc::new(SledRecordStore::new(db).unwrap()),
        PhasePlan::from_config(&config),
    );
    let job = reopened.load_job(&job_id).unwrap();
    assert_eq!(job.phase, Phase::Done);
    assert_eq!(job.progress_percent, 100);
    assert_eq!(job.chapters.len(), 3);
    assert_eq!(job.chapters[&1].generation, 1);
    assert_eq!(job.export_ref, live.export_ref);

    let units = reopened.list_units(&job_id).unwrap();
    assert_eq!(units.len(), live.units.len() + 3);
    assert!(units.iter().all(|u| u.status == UnitStatus::Succeeded));
    assert_eq!(reopened.list_regenerations(&job_id).unwrap().len(), 1);

    let events = reopened.events(&job_id, 0).unwrap();
    assert!(events.iter().any(|e| e.is(EventType::JobFinished)));
    assert!(events.iter().any(|e| e.is(EventType::RegenerationCompleted)));
    assert!(events.windows(2).all(|pair| pair[1].seq == pair[0].seq + 1));

    // events after a known sequence number only
    let tail = reopened.events(&job_id, 3).unwrap();
    assert_eq!(tail.first().map(|e| e.seq), Some(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_reads_do_not_change_the_record() {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn RecordStore> =
        Arc::new(SledRecordStore::open(&temp_dir.path().join("store")).unwrap());
    let engine = start_engine_with_store(
        fast_config(),
        Arc::new(SimulatedExecutor::new().with_latency(Duration::from_millis(2))),
        store,
    );
    let job_id = engine
        .submit(CourseSpec::new("course-ro", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();
    run_to_end(&engine, &job_id).await;
    // the admission slot is handed back right after the terminal write
    crate::test_utils::wait_until(&engine, &job_id, |report| {
        report.admission == coursegen::job::AdmissionState::Released
    })
    .await;

    let before = engine.job(&job_id).unwrap();
    for _ in 0..5 {
        engine.status(&job_id).unwrap();
    }
    let after = engine.job(&job_id).unwrap();
    assert_eq!(before.version, after.version);
    assert_eq!(before.updated_at, after.updated_at);

    engine.shutdown().await.unwrap();
}

#[test]
fn workspace_config_file_is_layered_over_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_dir = temp_dir.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        r#"
[engine]
worker_count = 3
quality_threshold = 0.8

[storage]
backend = "memory"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&config_dir.join("config.toml"))
        .unwrap()
        .validated()
        .unwrap();
    assert_eq!(config.engine.worker_count, 3);
    assert_eq!(config.engine.quality_threshold, 0.8);
    assert_eq!(config.engine.max_attempts, 3);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
}
