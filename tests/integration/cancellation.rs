use crate::test_utils::{fast_config, run_to_end, start_engine, wait_until};
use coursegen::config::EngineConfig;
use coursegen::error::ErrorClass;
use coursegen::executor::SimulatedExecutor;
use coursegen::job::{Phase, UnitClass, UnitStatus};
use coursegen::tracker::EventType;
use coursegen::types::{CourseSpec, SubmitOptions};
use std::sync::Arc;
use std::time::Duration;

fn slow_chapters() -> Arc<SimulatedExecutor> {
    Arc::new(SimulatedExecutor::new().with_stage_latency(UnitClass::Chapter, Duration::from_millis(150)))
}

fn narrow_fanout() -> EngineConfig {
    EngineConfig {
        per_job_fanout_limit: 2,
        ..fast_config()
    }
}

fn chapter_calls(executor: &SimulatedExecutor, job_id: coursegen::JobId, chapters: usize) -> u32 {
    (0..chapters)
        .map(|index| executor.calls(job_id, UnitClass::Chapter, Some(index)))
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_during_content_stops_dispatch_and_fails_the_job() {
    let executor = slow_chapters();
    let engine = start_engine(narrow_fanout(), executor.clone());
    let job_id = engine
        .submit(CourseSpec::new("course-d", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();

    wait_until(&engine, &job_id, |report| {
        report.phase == Phase::Content && report.units.iter().any(|u| u.status == UnitStatus::Running)
    })
    .await;
    engine.cancel(&job_id).await.unwrap();

    let report = run_to_end(&engine, &job_id).await;
    assert_eq!(report.phase, Phase::Failed);
    assert!(report.cancel_requested);
    assert_eq!(report.error_detail.as_ref().unwrap().class, ErrorClass::Cancelled);

    // at most the two in-flight chapters (plus one racing claim) ever reached the executor
    assert!(chapter_calls(&executor, job_id, 5) < 5);
    assert!(report.units.iter().any(|u| u.status == UnitStatus::Aborted));
    assert!(report.units.iter().all(|u| u.status != UnitStatus::Running && u.status != UnitStatus::Pending));
    assert!(report.units_of(coursegen::job::UnitKind::Export).is_empty());

    let events = engine.events(&job_id, 0).unwrap();
    assert!(events.iter().any(|e| e.is(EventType::CancelRequested)));
    assert!(events.last().unwrap().is(EventType::JobFinished));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_with_partial_results_keeps_finished_chapters() {
    let executor = slow_chapters();
    let engine = start_engine(narrow_fanout(), executor);
    let job_id = engine
        .submit(
            CourseSpec::new("course-d2", "Rust", 5),
            SubmitOptions {
                allow_partial: Some(true),
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    wait_until(&engine, &job_id, |report| {
        report.units.iter().any(|u| {
            matches!(u.kind, coursegen::job::UnitKind::Chapter(_)) && u.status == UnitStatus::Succeeded
        })
    })
    .await;
    engine.cancel(&job_id).await.unwrap();

    let report = run_to_end(&engine, &job_id).await;
    assert_eq!(report.phase, Phase::Degraded);
    assert_eq!(report.error_detail.unwrap().class, ErrorClass::Cancelled);
    assert!(report.chapters.iter().any(|c| c.content_ref.is_some()));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_finished_job_changes_nothing() {
    let engine = start_engine(fast_config(), Arc::new(SimulatedExecutor::new()));
    let job_id = engine
        .submit(CourseSpec::new("course-d3", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();
    let before = run_to_end(&engine, &job_id).await;
    engine.cancel(&job_id).await.unwrap();
    let after = engine.status(&job_id).unwrap();

    assert_eq!(before.phase, Phase::Done);
    assert_eq!(after.phase, Phase::Done);
    assert!(!after.cancel_requested);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_job_cancelled_before_admission_never_runs() {
    let config = EngineConfig {
        global_concurrency_limit: 1,
        ..fast_config()
    };
    let executor = slow_chapters();
    let engine = start_engine(config, executor.clone());
    let first = engine
        .submit(CourseSpec::new("course-first", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();
    let second = engine
        .submit(CourseSpec::new("course-second", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(engine.pending_jobs(), 1);

    engine.cancel(&second).await.unwrap();
    let cancelled = run_to_end(&engine, &second).await;
    assert_eq!(cancelled.phase, Phase::Failed);
    assert!(cancelled.units.is_empty());
    assert_eq!(executor.calls(second, UnitClass::Structure, None), 0);

    let finished = run_to_end(&engine, &first).await;
    assert_eq!(finished.phase, Phase::Done);

    engine.shutdown().await.unwrap();
}
