use crate::test_utils::{fast_config, run_to_end, start_engine, wait_until};
use coursegen::config::EngineConfig;
use coursegen::executor::SimulatedExecutor;
use coursegen::job::{Phase, UnitClass, UnitKind, UnitStatus, UnitTrack};
use coursegen::regeneration::RegenerationStatus;
use coursegen::tracker::{EventType, JobReport};
use coursegen::types::{CourseSpec, SubmitOptions};
use coursegen::EngineError;
use std::sync::Arc;
use std::time::Duration;

fn regenerations_settled(report: &JobReport) -> bool {
    !report.regenerations.is_empty()
        && report
            .regenerations
            .iter()
            .all(|r| r.status != RegenerationStatus::Running)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_chapter_conflict() {
    let executor = Arc::new(SimulatedExecutor::new().with_latency(Duration::from_millis(10)));
    let engine = start_engine(fast_config(), executor);
    let job_id = engine
        .submit(CourseSpec::new("course-e", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();
    let done = run_to_end(&engine, &job_id).await;
    assert_eq!(done.phase, Phase::Done);
    let original = done.chapter(2).unwrap().content_ref.clone();
    let before: Vec<_> = done
        .chapters
        .iter()
        .map(|c| (c.chapter_index, c.content_ref.clone(), c.generation))
        .collect();

    let (first, second) = tokio::join!(
        engine.request_regeneration(&job_id, 2, "tone too formal"),
        engine.request_regeneration(&job_id, 2, "tone too formal"),
    );
    let (accepted, rejected) = match (first, second) {
        (Ok(unit_id), Err(err)) | (Err(err), Ok(unit_id)) => (unit_id, err),
        other => panic!("expected exactly one accepted request, got {other:?}"),
    };
    assert!(matches!(rejected, EngineError::Conflict(_)));

    let report = wait_until(&engine, &job_id, regenerations_settled).await;
    assert_eq!(report.regenerations.len(), 1);
    assert_eq!(report.regenerations[0].status, RegenerationStatus::Completed);
    assert_eq!(report.regenerations[0].unit_id, accepted);

    let chapter = report.chapter(2).unwrap();
    assert_eq!(chapter.generation, Some(1));
    assert_ne!(chapter.content_ref, original);
    // other chapters and the job itself are untouched
    for (index, content_ref, generation) in before.iter().filter(|(index, _, _)| *index != 2) {
        let sibling = report.chapter(*index).unwrap();
        assert_eq!(&sibling.content_ref, content_ref, "chapter {index} content changed");
        assert_eq!(&sibling.generation, generation, "chapter {index} generation changed");
    }
    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.progress_percent, 100);

    let regenerated: Vec<_> = report
        .units
        .iter()
        .filter(|u| matches!(u.track, UnitTrack::Regeneration(_)))
        .collect();
    // chapter, assessment and validation for the one chapter
    assert_eq!(regenerated.len(), 3);
    assert!(regenerated.iter().all(|u| u.status == UnitStatus::Succeeded));

    let events = engine.events(&job_id, 0).unwrap();
    assert_eq!(events.iter().filter(|e| e.is(EventType::RegenerationRequested)).count(), 1);
    assert_eq!(events.iter().filter(|e| e.is(EventType::RegenerationCompleted)).count(), 1);

    // the chapter is free again once the first regeneration finished
    engine.request_regeneration(&job_id, 2, "again").await.unwrap();

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn low_scoring_regeneration_is_reworked_before_swap() {
    let executor = Arc::new(SimulatedExecutor::new().with_scores(0, vec![0.9, 0.3, 0.95]));
    let engine = start_engine(fast_config(), executor);
    let job_id = engine
        .submit(CourseSpec::new("course-e2", "Rust", 3), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(run_to_end(&engine, &job_id).await.phase, Phase::Done);

    engine.request_regeneration(&job_id, 0, "add examples").await.unwrap();
    let report = wait_until(&engine, &job_id, regenerations_settled).await;

    assert_eq!(report.regenerations[0].status, RegenerationStatus::Completed);
    let chapter = report.chapter(0).unwrap();
    assert_eq!(chapter.generation, Some(1));
    assert_eq!(chapter.quality_score, Some(0.95));
    let rewrites = report
        .units
        .iter()
        .filter(|u| u.kind == UnitKind::Chapter(0) && matches!(u.track, UnitTrack::Regeneration(_)))
        .count();
    assert_eq!(rewrites, 2);
    assert!(report.degraded_chapters.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn regeneration_during_content_survives_the_main_pipeline() {
    let config = EngineConfig {
        per_job_fanout_limit: 2,
        ..fast_config()
    };
    let executor = Arc::new(
        SimulatedExecutor::new().with_stage_latency(UnitClass::Chapter, Duration::from_millis(100)),
    );
    let engine = start_engine(config, executor);
    let job_id = engine
        .submit(CourseSpec::new("course-e4", "Rust", 5), SubmitOptions::default())
        .await
        .unwrap();

    let mid_content = wait_until(&engine, &job_id, |report| {
        report.phase == Phase::Content && report.chapters.iter().any(|c| c.content_ref.is_some())
    })
    .await;
    let target = mid_content
        .chapters
        .iter()
        .find(|c| c.content_ref.is_some())
        .unwrap();
    let (index, original) = (target.chapter_index, target.content_ref.clone());
    engine.request_regeneration(&job_id, index, "needs diagrams").await.unwrap();

    let report = wait_until(&engine, &job_id, |report| {
        report.phase.is_terminal() && regenerations_settled(report)
    })
    .await;
    assert_eq!(report.phase, Phase::Done);
    assert_eq!(report.progress_percent, 100);
    assert_eq!(report.regenerations[0].status, RegenerationStatus::Completed);

    // the slot holds the regenerated content, not the main-track chapter
    let chapter = report.chapter(index).unwrap();
    assert_ne!(chapter.content_ref, original);
    assert!(chapter.generation.unwrap() >= 1);
    let regenerated: Vec<_> = report
        .units
        .iter()
        .filter(|u| {
            u.kind == UnitKind::Chapter(index)
                && matches!(u.track, UnitTrack::Regeneration(_))
                && u.status == UnitStatus::Succeeded
        })
        .map(|u| u.result_ref.clone())
        .collect();
    assert!(regenerated.contains(&chapter.content_ref));
    assert_eq!(report.chapters.iter().filter(|c| c.content_ref.is_some()).count(), 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_chapter_is_not_addressable() {
    let engine = start_engine(fast_config(), Arc::new(SimulatedExecutor::new()));
    let job_id = engine
        .submit(CourseSpec::new("course-e3", "Rust", 2), SubmitOptions::default())
        .await
        .unwrap();
    run_to_end(&engine, &job_id).await;

    let err = engine
        .request_regeneration(&job_id, 9, "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ChapterNotAddressable { chapter_index: 9, .. }));
    assert!(engine.status(&job_id).unwrap().regenerations.is_empty());

    engine.shutdown().await.unwrap();
}
