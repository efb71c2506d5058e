//! Chapter Regeneration
//!
//! Re-runs one chapter through Content, Assessment and Validation on a separate unit track,
//! leaving sibling chapters and the job's phase and progress alone. The chapter's slot is
//! replaced in one versioned write once the new content passes validation or the quality
//! rounds run out; until then readers keep seeing the previous content.

mod record;

pub use record::{RegenerationRecord, RegenerationStatus};

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorClass};
use crate::executor::ChapterContent;
use crate::job::{ChapterSlot, ErrorDetail, FanOut, Job, Phase, Unit, UnitArtifact, UnitTrack};
use crate::orchestrator::{apply, plan, schedule_units};
use crate::pool::UnitOutcome;
use crate::queue::WorkQueue;
use crate::tracker::{EventType, ProgressTracker};
use crate::types::{JobId, Priority, RegenerationId, UnitId};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RegenerationController {
    config: EngineConfig,
    tracker: Arc<ProgressTracker>,
    queue: Arc<WorkQueue>,
    /// Running regeneration per (job, chapter)
    in_flight: Mutex<HashMap<(JobId, usize), RegenerationId>>,
}

impl RegenerationController {
    pub fn new(config: EngineConfig, tracker: Arc<ProgressTracker>, queue: Arc<WorkQueue>) -> Self {
        Self {
            config,
            tracker,
            queue,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_in_flight(&self, job_id: &JobId, chapter_index: usize) -> bool {
        self.in_flight.lock().contains_key(&(*job_id, chapter_index))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Accept a regeneration of `chapter_index` and enqueue its superseding chapter unit.
    ///
    /// The job must be `Done`, `Degraded` or in `Content`, and the chapter must exist in its
    /// outline (in `Content`, it must already have content). A second request for a chapter
    /// that is still regenerating fails with `Conflict` and changes nothing.
    pub fn request(
        &self,
        job_id: &JobId,
        chapter_index: usize,
        reason: &str,
    ) -> Result<(RegenerationId, UnitId), EngineError> {
        let job = self.tracker.load_job(job_id)?;
        match job.phase {
            Phase::Done | Phase::Degraded | Phase::Content => {}
            other => {
                return Err(EngineError::InvalidState(format!(
                    "job {job_id} is in {other}; chapters can be regenerated in done, degraded or content"
                )))
            }
        }
        if job.cancel_requested {
            return Err(EngineError::InvalidState(format!("job {job_id} is being cancelled")));
        }
        let slot = job.chapters.get(&chapter_index);
        let addressable = job.outline_for(chapter_index).is_some()
            && (job.phase != Phase::Content || slot.is_some());
        if !addressable {
            return Err(EngineError::ChapterNotAddressable {
                job_id: *job_id,
                chapter_index,
            });
        }
        if job.phase == Phase::Content && job.round > 0 && job.round_scope.contains(&chapter_index) {
            return Err(EngineError::Conflict(format!(
                "chapter {chapter_index} of job {job_id} is being reworked"
            )));
        }

        let id = RegenerationId::new();
        self.reserve(&job, chapter_index, id)?;
        match self.start(&job, chapter_index, reason, id) {
            Ok(unit_id) => Ok((id, unit_id)),
            Err(err) => {
                self.in_flight.lock().remove(&(*job_id, chapter_index));
                Err(err)
            }
        }
    }

    fn reserve(&self, job: &Job, chapter_index: usize, id: RegenerationId) -> Result<(), EngineError> {
        let persisted = self
            .tracker
            .list_regenerations(&job.id)?
            .into_iter()
            .any(|r| r.chapter_index == chapter_index && !r.is_terminal());
        let mut in_flight = self.in_flight.lock();
        if persisted || in_flight.contains_key(&(job.id, chapter_index)) {
            warn!(job_id = %job.id, chapter_index, "Rejected duplicate regeneration request");
            return Err(EngineError::Conflict(format!(
                "chapter {chapter_index} of job {} is already regenerating",
                job.id
            )));
        }
        in_flight.insert((job.id, chapter_index), id);
        Ok(())
    }

    fn start(&self, job: &Job, chapter_index: usize, reason: &str, id: RegenerationId) -> Result<UnitId, EngineError> {
        let slot = job.chapters.get(&chapter_index);
        let previous = slot.map(|s| (s.content_ref.clone(), s.content_unit));
        let unit = plan::chapter_unit(
            job,
            chapter_index,
            0,
            Some(reason.to_string()),
            previous,
            &self.config,
            Priority::Urgent,
        )?
        .on_track(UnitTrack::Regeneration(id));

        let mut record = RegenerationRecord::new(id, job.id, chapter_index, reason, unit.id);
        record.superseded_unit = slot.map(|s| s.content_unit);
        record.previous_ref = slot.map(|s| s.content_ref.clone());
        record.base_generation = slot.map(|s| s.generation);
        self.tracker.create_regeneration(record)?;

        let unit_id = unit.id;
        info!(
            job_id = %job.id,
            regeneration_id = %id,
            unit_id = %unit_id,
            chapter_index,
            phase = %job.phase,
            "Chapter regeneration requested"
        );
        self.tracker.emit(
            &job.id,
            EventType::RegenerationRequested,
            json!({
                "regeneration_id": id,
                "chapter_index": chapter_index,
                "unit_id": unit_id,
                "reason": reason,
            }),
        );
        schedule_units(&self.tracker, &self.queue, vec![unit], None)?;
        Ok(unit_id)
    }

    /// Advance a regeneration after one of its units finished.
    pub fn on_outcome(&self, id: &RegenerationId, outcome: &UnitOutcome) -> Result<(), EngineError> {
        let record = self.tracker.load_regeneration(id)?;
        if record.is_terminal() {
            debug!(regeneration_id = %id, unit_id = %outcome.unit().id, "Outcome for finished regeneration ignored");
            return Ok(());
        }
        match outcome {
            UnitOutcome::Succeeded(unit) => self.advance(record, unit),
            UnitOutcome::Failed(unit) => {
                let detail = apply::failure_detail(unit);
                self.fail(&record, detail)
            }
            UnitOutcome::Aborted(_) => {
                let detail = ErrorDetail::new(ErrorClass::Cancelled, record.stage, "regeneration aborted")
                    .for_chapter(record.chapter_index);
                self.fail(&record, detail)
            }
        }
    }

    fn advance(&self, record: RegenerationRecord, unit: &Unit) -> Result<(), EngineError> {
        let job = self.tracker.load_job(&record.job_id)?;
        let track = UnitTrack::Regeneration(record.id);
        let index = record.chapter_index;

        match unit.artifact.as_ref() {
            Some(UnitArtifact::Chapter(output)) => {
                let (record, _) = self.tracker.update_regeneration(&record.id, |r| {
                    r.candidate_unit = Some(unit.id);
                    r.candidate_ref = Some(output.result_ref.clone());
                    r.assessment_ref = None;
                    r.quality_score = None;
                    r.stage = Phase::Assessment;
                    Ok(())
                })?;
                let content = ChapterContent {
                    chapter_index: index,
                    content_ref: output.result_ref.clone(),
                    assessment_ref: None,
                };
                let units = plan::assessment_units(&job, vec![content], FanOut::PerChapter, &self.config, Priority::Urgent)
                    .into_iter()
                    .map(|u| u.on_track(track).in_round(record.round))
                    .collect();
                schedule_units(&self.tracker, &self.queue, units, None)?;
            }
            Some(UnitArtifact::Assessment(output)) => {
                let (record, _) = self.tracker.update_regeneration(&record.id, |r| {
                    r.assessment_ref = Some(output.result_ref.clone());
                    r.stage = Phase::Validation;
                    Ok(())
                })?;
                let content_ref = record.candidate_ref.clone().ok_or_else(|| {
                    EngineError::InvalidState(format!("regeneration {} has no candidate content", record.id))
                })?;
                let content = ChapterContent {
                    chapter_index: index,
                    content_ref,
                    assessment_ref: record.assessment_ref.clone(),
                };
                let units = plan::validation_units(&job, vec![content], FanOut::PerChapter, &self.config, Priority::Urgent)
                    .into_iter()
                    .map(|u| u.on_track(track).in_round(record.round))
                    .collect();
                schedule_units(&self.tracker, &self.queue, units, None)?;
            }
            Some(UnitArtifact::Validation(output)) => {
                let threshold = self.config.quality_threshold;
                let verdict = output.verdicts.iter().find(|v| v.chapter_index == index);
                let score = verdict.map(|v| v.score);
                let passed = verdict.map(|v| v.passed && v.score >= threshold).unwrap_or(false);
                let (record, _) = self.tracker.update_regeneration(&record.id, |r| {
                    r.quality_score = score;
                    Ok(())
                })?;

                if passed {
                    return self.complete(record, true);
                }
                if record.round >= self.config.max_quality_rounds {
                    warn!(
                        job_id = %record.job_id,
                        regeneration_id = %record.id,
                        chapter_index = index,
                        score = ?score,
                        "Regenerated chapter accepted below threshold"
                    );
                    return self.complete(record, false);
                }

                let (record, _) = self.tracker.update_regeneration(&record.id, |r| {
                    r.round += 1;
                    r.stage = Phase::Content;
                    Ok(())
                })?;
                let previous = match (record.candidate_ref.clone(), record.candidate_unit) {
                    (Some(content_ref), Some(unit_id)) => Some((content_ref, unit_id)),
                    _ => None,
                };
                let reason = match score {
                    Some(score) => format!("{} (quality score {score:.2} below threshold {threshold:.2})", record.reason),
                    None => format!("{} (no quality verdict)", record.reason),
                };
                info!(
                    job_id = %record.job_id,
                    regeneration_id = %record.id,
                    chapter_index = index,
                    round = record.round,
                    "Regenerated chapter below threshold, reworking"
                );
                let unit = plan::chapter_unit(&job, index, record.round, Some(reason), previous, &self.config, Priority::Urgent)?
                    .on_track(track)
                    .in_round(record.round);
                schedule_units(&self.tracker, &self.queue, vec![unit], None)?;
            }
            _ => {
                return Err(EngineError::InvalidState(format!(
                    "unexpected {} unit {} in regeneration {}",
                    unit.kind, unit.id, record.id
                )))
            }
        }
        Ok(())
    }

    /// Swap the candidate into the job's chapter slot, if the slot has not moved on.
    fn complete(&self, record: RegenerationRecord, quality_passed: bool) -> Result<(), EngineError> {
        let (Some(content_ref), Some(content_unit)) = (record.candidate_ref.clone(), record.candidate_unit) else {
            return Err(EngineError::InvalidState(format!(
                "regeneration {} has no candidate content",
                record.id
            )));
        };
        let slot = ChapterSlot {
            chapter_index: record.chapter_index,
            content_ref,
            content_unit,
            assessment_ref: record.assessment_ref.clone(),
            quality_score: record.quality_score,
            quality_passed: Some(quality_passed),
            generation: 0,
            updated_at: Utc::now(),
        };

        match self.tracker.swap_chapter(&record.job_id, slot, record.base_generation) {
            Ok(job) => {
                let generation = job.chapters.get(&record.chapter_index).map(|s| s.generation);
                self.tracker.update_regeneration(&record.id, |r| {
                    r.status = RegenerationStatus::Completed;
                    Ok(())
                })?;
                self.in_flight.lock().remove(&(record.job_id, record.chapter_index));
                info!(
                    job_id = %record.job_id,
                    regeneration_id = %record.id,
                    chapter_index = record.chapter_index,
                    generation = ?generation,
                    quality_passed,
                    "Chapter regeneration completed"
                );
                self.tracker.emit(
                    &record.job_id,
                    EventType::RegenerationCompleted,
                    json!({
                        "regeneration_id": record.id,
                        "chapter_index": record.chapter_index,
                        "unit_id": content_unit,
                        "generation": generation,
                        "quality_passed": quality_passed,
                    }),
                );
                Ok(())
            }
            Err(EngineError::Conflict(message)) => {
                warn!(
                    job_id = %record.job_id,
                    regeneration_id = %record.id,
                    chapter_index = record.chapter_index,
                    "Chapter changed during regeneration, keeping current content"
                );
                let detail = ErrorDetail::new(ErrorClass::Fatal, record.stage, message)
                    .for_chapter(record.chapter_index);
                self.fail(&record, detail)
            }
            Err(err) => {
                self.in_flight.lock().remove(&(record.job_id, record.chapter_index));
                Err(err)
            }
        }
    }

    fn fail(&self, record: &RegenerationRecord, detail: ErrorDetail) -> Result<(), EngineError> {
        let result = self.tracker.update_regeneration(&record.id, |r| {
            r.status = RegenerationStatus::Failed;
            r.error_detail = Some(detail.clone());
            Ok(())
        });
        self.in_flight.lock().remove(&(record.job_id, record.chapter_index));
        result?;
        warn!(
            job_id = %record.job_id,
            regeneration_id = %record.id,
            chapter_index = record.chapter_index,
            class = %detail.class,
            "Chapter regeneration failed, previous content kept"
        );
        self.tracker.emit(
            &record.job_id,
            EventType::RegenerationFailed,
            json!({
                "regeneration_id": record.id,
                "chapter_index": record.chapter_index,
                "error_class": detail.class,
            }),
        );
        Ok(())
    }

    /// Fail every running regeneration of a job that is being cancelled or has failed.
    pub fn abandon_job(&self, job_id: &JobId, detail: ErrorDetail) -> Result<(), EngineError> {
        for record in self.tracker.list_regenerations(job_id)? {
            if record.is_terminal() {
                continue;
            }
            self.fail(&record, detail.clone().for_chapter(record.chapter_index))?;
        }
        Ok(())
    }
}
