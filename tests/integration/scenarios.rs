//! End-to-end job scenarios on simulated executors.

use crate::test_utils::{fast_config, run_to_end, start_engine};
use coursegen::config::EngineConfig;
use coursegen::error::{ErrorClass, UnitError, UnitErrorCode};
use coursegen::executor::SimulatedExecutor;
use coursegen::job::{Phase, UnitClass, UnitKind, UnitStatus};
use coursegen::tracker::{ChapterState, EventType};
use coursegen::types::{CourseSpec, SubmitOptions};
use std::sync::Arc;
use std::time::Duration;

fn provider_down() -> UnitError {
    UnitError::retryable(UnitErrorCode::ProviderUnavailable, "upstream returned 503")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_units_succeed_first_time() {
    let executor = Arc::new(SimulatedExecutor::new());
    let engine = start_engine(fast_config(), executor.clone());
    let job_id = engine
        .submit(CourseSpec::new("course-a", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();
    let report = run_to_end(&engine, &job_id).await;

    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.progress_percent, 100);
    assert!(report.error_detail.is_none());
    assert!(report.export_ref.is_some());
    assert_eq!(report.chapters.len(), 5);
    assert!(report.chapters.iter().all(|c| c.state == ChapterState::Ready));
    assert!(report.units.iter().all(|u| u.status == UnitStatus::Succeeded));
    assert!(report.units.iter().all(|u| u.attempt_count == 1));
    for index in 0..5 {
        assert_eq!(executor.calls(job_id, UnitClass::Chapter, Some(index)), 1);
    }

    let events = engine.events(&job_id, 0).unwrap();
    assert!(events.first().unwrap().is(EventType::JobSubmitted));
    assert!(events.last().unwrap().is(EventType::JobFinished));
    assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    let phases_started = events.iter().filter(|e| e.is(EventType::PhaseStarted)).count();
    assert_eq!(phases_started, 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chapter_retried_until_third_attempt_succeeds() {
    let executor = Arc::new(SimulatedExecutor::new().fail_chapter(2, 2, provider_down()));
    let engine = start_engine(fast_config(), executor.clone());
    let job_id = engine
        .submit(CourseSpec::new("course-b", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();
    let report = run_to_end(&engine, &job_id).await;

    assert_eq!(report.phase, Phase::Done);
    let chapter = report.units_of(UnitKind::Chapter(2));
    assert_eq!(chapter.len(), 1);
    assert_eq!(chapter[0].attempt_count, 3);
    assert_eq!(chapter[0].status, UnitStatus::Succeeded);
    assert_eq!(executor.calls(job_id, UnitClass::Chapter, Some(2)), 3);

    let retries = engine
        .events(&job_id, 0)
        .unwrap()
        .into_iter()
        .filter(|e| e.is(EventType::UnitRetryScheduled))
        .count();
    assert_eq!(retries, 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_lost_chapter_within_tolerance_degrades_the_job() {
    let executor = Arc::new(SimulatedExecutor::new().fail_chapter(1, u32::MAX, provider_down()));
    let config = EngineConfig {
        degraded_tolerance_fraction: 0.2,
        ..fast_config()
    };
    let engine = start_engine(config, executor.clone());
    let job_id = engine
        .submit(CourseSpec::new("course-c", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();
    let report = run_to_end(&engine, &job_id).await;

    assert_eq!(report.phase, Phase::Degraded);
    assert_eq!(report.progress_percent, 100);
    assert_eq!(report.degraded_chapters, vec![1]);
    assert_eq!(report.chapter(1).unwrap().state, ChapterState::Failed);
    for index in [0, 2, 3, 4] {
        assert_eq!(report.chapter(index).unwrap().state, ChapterState::Ready);
    }
    let lost = report.units_of(UnitKind::Chapter(1));
    assert_eq!(lost[0].status, UnitStatus::Failed);
    assert_eq!(lost[0].attempt_count, 3);
    assert_eq!(executor.calls(job_id, UnitClass::Chapter, Some(1)), 3);

    let detail = report.error_detail.as_ref().unwrap();
    assert_eq!(detail.class, ErrorClass::RetriesExhausted);
    assert_eq!(detail.chapter_index, Some(1));
    assert!(!detail.message.contains("503"));
    assert!(engine
        .events(&job_id, 0)
        .unwrap()
        .iter()
        .any(|e| e.is(EventType::ChapterTolerated)));

    // export covers the four surviving chapters only
    assert_eq!(report.units_of(UnitKind::Export).len(), 1);
    assert_eq!(report.units_of(UnitKind::Validation).len(), 4);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losses_beyond_tolerance_fail_the_job() {
    let executor = Arc::new(
        SimulatedExecutor::new()
            .fail_chapter(1, u32::MAX, provider_down())
            .fail_chapter(3, u32::MAX, provider_down()),
    );
    let engine = start_engine(fast_config(), executor);
    let job_id = engine
        .submit(CourseSpec::new("course-c2", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();
    let report = run_to_end(&engine, &job_id).await;

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_detail.as_ref().unwrap().class, ErrorClass::ToleranceExceeded);
    assert!(report.export_ref.is_none());
    assert!(report.units_of(UnitKind::Export).is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn structure_failure_is_never_tolerated() {
    let executor = Arc::new(SimulatedExecutor::new().fail_stage(
        UnitClass::Structure,
        u32::MAX,
        UnitError::fatal(UnitErrorCode::MalformedOutput, "outline was not valid JSON"),
    ));
    let engine = start_engine(fast_config(), executor.clone());
    let job_id = engine
        .submit(CourseSpec::new("course-s", "Rust", 3), SubmitOptions::default())
        .await
        .unwrap();
    let report = run_to_end(&engine, &job_id).await;

    assert_eq!(report.phase, Phase::Failed);
    let detail = report.error_detail.as_ref().unwrap();
    assert_eq!(detail.class, ErrorClass::Fatal);
    assert_eq!(detail.phase, Phase::Structure);
    // fatal errors are not retried
    assert_eq!(executor.calls(job_id, UnitClass::Structure, None), 1);
    assert!(report.units_of(UnitKind::Chapter(0)).is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attempts_that_overrun_their_budget_time_out() {
    let executor = Arc::new(
        SimulatedExecutor::new().with_stage_latency(UnitClass::Structure, Duration::from_millis(60)),
    );
    let config = EngineConfig {
        structure_time_budget_ms: 20,
        ..fast_config()
    };
    let engine = start_engine(config, executor.clone());
    let job_id = engine
        .submit(CourseSpec::new("course-t", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();
    let report = run_to_end(&engine, &job_id).await;

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.error_detail.as_ref().unwrap().class, ErrorClass::RetriesExhausted);
    let structure = report.units_of(UnitKind::Structure);
    assert_eq!(structure[0].attempt_count, 3);
    assert_eq!(structure[0].last_error, Some(UnitErrorCode::Timeout));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_never_moves_backwards() {
    let executor = Arc::new(SimulatedExecutor::new().with_latency(Duration::from_millis(5)));
    let engine = start_engine(fast_config(), executor);
    let job_id = engine
        .submit(CourseSpec::new("course-p", "Rust", 6), SubmitOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let report = engine.status(&job_id).unwrap();
        seen.push(report.progress_percent);
        if report.phase.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "progress went backwards: {seen:?}");
    assert_eq!(seen.last().copied(), Some(100));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_past_the_deadline_times_out() {
    let executor = Arc::new(SimulatedExecutor::new().with_latency(Duration::from_millis(200)));
    let engine = start_engine(fast_config(), executor);
    let job_id = engine
        .submit(CourseSpec::new("course-w", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();

    let err = engine
        .wait_for_terminal(&job_id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, coursegen::EngineError::Timeout(_)));

    engine.shutdown().await.unwrap();
}
