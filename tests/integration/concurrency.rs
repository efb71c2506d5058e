use crate::test_utils::{fast_config, run_to_end, start_engine, wait_until};
use coursegen::config::EngineConfig;
use coursegen::executor::SimulatedExecutor;
use coursegen::job::{AdmissionState, FanOut, Phase, UnitClass, UnitKind, UnitStatus};
use coursegen::tracker::EventType;
use coursegen::types::{CourseSpec, Priority, SubmitOptions};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_budget_bounds_active_jobs() {
    let config = EngineConfig {
        global_concurrency_limit: 2,
        ..fast_config()
    };
    let executor = Arc::new(SimulatedExecutor::new().with_latency(Duration::from_millis(5)));
    let engine = start_engine(config, executor);

    let mut jobs = Vec::new();
    for n in 0..5 {
        let job_id = engine
            .submit(CourseSpec::new(format!("course-{n}"), "Rust", 2), SubmitOptions::default())
            .await
            .unwrap();
        jobs.push(job_id);
    }
    assert_eq!(engine.active_jobs(), 2);
    assert_eq!(engine.pending_jobs(), 3);
    assert_eq!(engine.job(&jobs[4]).unwrap().admission, AdmissionState::Pending);

    let mut max_active = 0;
    loop {
        max_active = max_active.max(engine.active_jobs());
        let all_done = jobs
            .iter()
            .all(|job_id| engine.job(job_id).unwrap().is_terminal());
        if all_done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(max_active <= 2);

    for job_id in &jobs {
        assert_eq!(run_to_end(&engine, job_id).await.phase, Phase::Done);
        wait_until(&engine, job_id, |report| report.admission == AdmissionState::Released).await;
        assert!(engine
            .events(job_id, 0)
            .unwrap()
            .iter()
            .any(|e| e.is(EventType::JobAdmitted)));
    }
    for _ in 0..100 {
        if engine.active_jobs() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.active_jobs(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chapter_fanout_is_capped_per_job() {
    let config = EngineConfig {
        per_job_fanout_limit: 2,
        worker_count: 6,
        assessment_fanout: FanOut::Single,
        validation_fanout: FanOut::Single,
        ..fast_config()
    };
    let executor = Arc::new(
        SimulatedExecutor::new().with_stage_latency(UnitClass::Chapter, Duration::from_millis(30)),
    );
    let engine = start_engine(config, executor);
    let job_id = engine
        .submit(CourseSpec::new("course-fan", "Rust", 6), SubmitOptions::default())
        .await
        .unwrap();

    let mut max_running = 0;
    loop {
        max_running = max_running.max(engine.queue_stats().running);
        if engine.job(&job_id).unwrap().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(max_running <= 2, "saw {max_running} units running at once");

    let report = run_to_end(&engine, &job_id).await;
    assert_eq!(report.phase, Phase::Done);
    // one batched assessment and one batched validation unit
    assert_eq!(report.units_of(coursegen::job::UnitKind::Assessment).len(), 1);
    assert_eq!(report.units_of(coursegen::job::UnitKind::Validation).len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_jobs_share_the_pool() {
    let engine = start_engine(
        fast_config(),
        Arc::new(SimulatedExecutor::new().with_latency(Duration::from_millis(3))),
    );
    let low = engine
        .submit(
            CourseSpec::new("course-low", "Rust", 3),
            SubmitOptions {
                priority: Priority::Low,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();
    let high = engine
        .submit(
            CourseSpec::new("course-high", "Rust", 3),
            SubmitOptions {
                priority: Priority::High,
                ..SubmitOptions::default()
            },
        )
        .await
        .unwrap();

    let (low_report, high_report) = tokio::join!(run_to_end(&engine, &low), run_to_end(&engine, &high));
    assert_eq!(low_report.phase, Phase::Done);
    assert_eq!(high_report.phase, Phase::Done);
    assert_ne!(low_report.chapter(0).unwrap().content_ref, high_report.chapter(0).unwrap().content_ref);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_applies_outcomes_of_last_attempts() {
    let executor = Arc::new(
        SimulatedExecutor::new().with_stage_latency(UnitClass::Chapter, Duration::from_millis(80)),
    );
    let engine = start_engine(fast_config(), executor);
    let job_id = engine
        .submit(CourseSpec::new("course-stop", "Rust", 4), SubmitOptions::default())
        .await
        .unwrap();
    wait_until(&engine, &job_id, |report| {
        report
            .units
            .iter()
            .any(|u| matches!(u.kind, UnitKind::Chapter(_)) && u.status == UnitStatus::Running)
    })
    .await;

    engine.shutdown().await.unwrap();

    // every chapter that finished before the pool stopped reached the job record
    let report = engine.status(&job_id).unwrap();
    let finished: Vec<_> = report
        .units
        .iter()
        .filter(|u| matches!(u.kind, UnitKind::Chapter(_)) && u.status == UnitStatus::Succeeded)
        .collect();
    assert!(!finished.is_empty());
    for unit in finished {
        let UnitKind::Chapter(index) = unit.kind else {
            unreachable!()
        };
        assert_eq!(report.chapter(index).unwrap().content_ref, unit.result_ref);
    }
}
