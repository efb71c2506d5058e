//! Progress Tracker
//!
//! The single write path for job, unit and regeneration records. Every update reloads the
//! record, applies a closure and saves with the version it read; a version conflict reloads
//! and reapplies. Terminal jobs reject further updates except the regeneration pointer swap.

pub mod event;
pub mod progress;
pub mod sled_store;
pub mod store;

pub use event::{EventType, JobEvent};
pub use sled_store::SledRecordStore;
pub use store::{MemoryRecordStore, RecordStore};

use crate::error::{EngineError, UnitErrorCode};
use crate::job::{
    AdmissionState, ChapterSlot, ErrorDetail, Job, Phase, PhasePlan, Unit, UnitKind, UnitStatus,
    UnitTrack,
};
use crate::regeneration::{RegenerationRecord, RegenerationStatus};
use crate::types::{JobId, RegenerationId, ResultRef, UnitId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

const MAX_WRITE_ATTEMPTS: usize = 32;

pub struct ProgressTracker {
    store: Arc<dyn RecordStore>,
    plan: PhasePlan,
    /// Last event sequence per job, loaded lazily from the store. Each job has its own lock
    /// so appends for one job never wait on another job's store write.
    event_seq: Mutex<HashMap<JobId, Arc<Mutex<Option<u64>>>>>,
    job_changed: Notify,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn RecordStore>, plan: PhasePlan) -> Self {
        Self {
            store,
            plan,
            event_seq: Mutex::new(HashMap::new()),
            job_changed: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    /// Notified after every job write.
    pub fn job_changed(&self) -> &Notify {
        &self.job_changed
    }

    // --- jobs ---

    pub fn create_job(&self, mut job: Job) -> Result<Job, EngineError> {
        job.version = self.store.save_job(&job, 0)?;
        self.job_changed.notify_waiters();
        Ok(job)
    }

    pub fn load_job(&self, job_id: &JobId) -> Result<Job, EngineError> {
        self.store
            .load_job(job_id)?
            .ok_or(EngineError::JobNotFound(*job_id))
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self.store.list_jobs()?)
    }

    /// Apply `apply` to a non-terminal job and save it.
    pub fn update_job<F, R>(&self, job_id: &JobId, apply: F) -> Result<(Job, R), EngineError>
    where
        F: FnMut(&mut Job) -> Result<R, EngineError>,
    {
        self.write_job(job_id, false, apply)
    }

    /// Return the job's concurrency slot. Allowed on terminal jobs.
    pub fn release_admission(&self, job_id: &JobId) -> Result<Job, EngineError> {
        let (job, _) = self.write_job(job_id, true, |job| {
            job.admission = AdmissionState::Released;
            job.concurrency_slot = None;
            Ok(())
        })?;
        Ok(job)
    }

    /// Replace a chapter slot as one versioned write, only if the slot is still at
    /// `expected_generation`. Allowed on terminal jobs; phase and progress are untouched.
    pub fn swap_chapter(
        &self,
        job_id: &JobId,
        mut slot: ChapterSlot,
        expected_generation: Option<u32>,
    ) -> Result<Job, EngineError> {
        let (job, _) = self.write_job(job_id, true, |job| {
            let current = job.chapters.get(&slot.chapter_index).map(|s| s.generation);
            if current != expected_generation {
                return Err(EngineError::Conflict(format!(
                    "chapter {} changed while regenerating (generation {:?}, expected {:?})",
                    slot.chapter_index, current, expected_generation
                )));
            }
            slot.generation = current.map(|g| g + 1).unwrap_or(0);
            slot.updated_at = Utc::now();
            job.failed_chapters.remove(&slot.chapter_index);
            if slot.quality_passed == Some(true) {
                job.below_threshold_chapters.remove(&slot.chapter_index);
            } else {
                job.below_threshold_chapters.insert(slot.chapter_index);
            }
            job.chapters.insert(slot.chapter_index, slot.clone());
            Ok(())
        })?;
        Ok(job)
    }

    fn write_job<F, R>(&self, job_id: &JobId, allow_terminal: bool, mut apply: F) -> Result<(Job, R), EngineError>
    where
        F: FnMut(&mut Job) -> Result<R, EngineError>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.load_job(job_id)?;
            if current.is_terminal() && !allow_terminal {
                return Err(EngineError::JobFinalized(*job_id));
            }
            let mut next = current.clone();
            let result = apply(&mut next)?;
            next.touch();
            match self.store.save_job(&next, current.version) {
                Ok(version) => {
                    next.version = version;
                    self.job_changed.notify_waiters();
                    return Ok((next, result));
                }
                Err(err) if err.is_version_conflict() => {
                    debug!(job_id = %job_id, attempt, "Job version conflict, reapplying update");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "job {job_id} kept changing during {MAX_WRITE_ATTEMPTS} write attempts"
        )))
    }

    /// Recompute progress for `job` from its units and floor it at the reported value.
    pub fn refresh_progress(&self, job: &mut Job) -> Result<(), EngineError> {
        let units = self.store.list_units(&job.id)?;
        let computed = progress::compute_progress(&self.plan, job, &units);
        job.raise_progress(computed);
        Ok(())
    }

    // --- units ---

    pub fn create_unit(&self, mut unit: Unit) -> Result<Unit, EngineError> {
        unit.version = self.store.save_unit(&unit, 0)?;
        Ok(unit)
    }

    pub fn load_unit(&self, unit_id: &UnitId) -> Result<Unit, EngineError> {
        self.store
            .load_unit(unit_id)?
            .ok_or(EngineError::UnitNotFound(*unit_id))
    }

    pub fn list_units(&self, job_id: &JobId) -> Result<Vec<Unit>, EngineError> {
        Ok(self.store.list_units(job_id)?)
    }

    /// Apply `apply` to a unit that has not reached a terminal status.
    pub fn update_unit<F, R>(&self, unit_id: &UnitId, mut apply: F) -> Result<(Unit, R), EngineError>
    where
        F: FnMut(&mut Unit) -> Result<R, EngineError>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.load_unit(unit_id)?;
            if current.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "unit {unit_id} is already {:?}",
                    current.status
                )));
            }
            let mut next = current.clone();
            let result = apply(&mut next)?;
            next.updated_at = Utc::now();
            if next.is_terminal() && next.finished_at.is_none() {
                next.finished_at = Some(next.updated_at);
            }
            match self.store.save_unit(&next, current.version) {
                Ok(version) => {
                    next.version = version;
                    return Ok((next, result));
                }
                Err(err) if err.is_version_conflict() => {
                    debug!(unit_id = %unit_id, attempt, "Unit version conflict, reapplying update");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "unit {unit_id} kept changing during {MAX_WRITE_ATTEMPTS} write attempts"
        )))
    }

    // --- regenerations ---

    pub fn create_regeneration(&self, mut record: RegenerationRecord) -> Result<RegenerationRecord, EngineError> {
        record.version = self.store.save_regeneration(&record, 0)?;
        Ok(record)
    }

    pub fn load_regeneration(&self, id: &RegenerationId) -> Result<RegenerationRecord, EngineError> {
        self.store
            .load_regeneration(id)?
            .ok_or(EngineError::RegenerationNotFound(*id))
    }

    pub fn list_regenerations(&self, job_id: &JobId) -> Result<Vec<RegenerationRecord>, EngineError> {
        Ok(self.store.list_regenerations(job_id)?)
    }

    pub fn update_regeneration<F, R>(
        &self,
        id: &RegenerationId,
        mut apply: F,
    ) -> Result<(RegenerationRecord, R), EngineError>
    where
        F: FnMut(&mut RegenerationRecord) -> Result<R, EngineError>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.load_regeneration(id)?;
            if current.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "regeneration {id} already finished"
                )));
            }
            let mut next = current.clone();
            let result = apply(&mut next)?;
            if next.is_terminal() && next.finished_at.is_none() {
                next.finished_at = Some(Utc::now());
            }
            match self.store.save_regeneration(&next, current.version) {
                Ok(version) => {
                    next.version = version;
                    return Ok((next, result));
                }
                Err(err) if err.is_version_conflict() => {
                    debug!(regeneration_id = %id, attempt, "Regeneration version conflict, reapplying update");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(EngineError::Conflict(format!(
            "regeneration {id} kept changing during {MAX_WRITE_ATTEMPTS} write attempts"
        )))
    }

    // --- events ---

    pub fn append_event<T: Serialize>(
        &self,
        job_id: &JobId,
        event_type: EventType,
        data: T,
    ) -> Result<JobEvent, EngineError> {
        let data = serde_json::to_value(data)
            .map_err(|e| EngineError::Storage(crate::error::StorageError::Serialization(e.to_string())))?;
        let sequence = Arc::clone(self.event_seq.lock().entry(*job_id).or_default());
        let mut last = sequence.lock();
        let previous = match *last {
            Some(seq) => seq,
            None => self.store.last_event_seq(job_id)?,
        };
        let event = JobEvent::new(*job_id, previous + 1, event_type, data);
        self.store.append_event(&event)?;
        *last = Some(event.seq);
        Ok(event)
    }

    /// Record an event; failures are logged, never propagated.
    pub fn emit<T: Serialize>(&self, job_id: &JobId, event_type: EventType, data: T) {
        if let Err(err) = self.append_event(job_id, event_type, data) {
            warn!(job_id = %job_id, event = event_type.as_str(), error = %err, "Failed to record job event");
        }
    }

    pub fn events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, EngineError> {
        Ok(self.store.read_events(job_id, after_seq)?)
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        Ok(self.store.flush()?)
    }

    // --- reads ---

    /// Point-in-time report for a job. Side-effect free.
    pub fn report(&self, job_id: &JobId) -> Result<JobReport, EngineError> {
        let job = self.load_job(job_id)?;
        let units = self.store.list_units(job_id)?;
        let regenerations = self.store.list_regenerations(job_id)?;
        Ok(JobReport::build(&job, &units, &regenerations))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitSummary {
    pub unit_id: UnitId,
    pub kind: UnitKind,
    pub status: UnitStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub round: u32,
    pub track: UnitTrack,
    pub result_ref: Option<ResultRef>,
    /// Error code only; raw executor messages stay on the unit record
    pub last_error: Option<UnitErrorCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterState {
    Pending,
    Ready,
    /// Accepted below the quality threshold
    BelowThreshold,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterSummary {
    pub chapter_index: usize,
    pub title: String,
    pub state: ChapterState,
    pub content_ref: Option<ResultRef>,
    pub generation: Option<u32>,
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegenerationSummary {
    pub regeneration_id: RegenerationId,
    pub chapter_index: usize,
    pub status: RegenerationStatus,
    pub stage: Phase,
    pub unit_id: UnitId,
}

/// Status of one job as exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub course_id: String,
    pub phase: Phase,
    pub admission: AdmissionState,
    pub progress_percent: u8,
    pub round: u32,
    pub cancel_requested: bool,
    pub units: Vec<UnitSummary>,
    pub chapters: Vec<ChapterSummary>,
    pub regenerations: Vec<RegenerationSummary>,
    pub error_detail: Option<ErrorDetail>,
    pub degraded_chapters: Vec<usize>,
    pub export_ref: Option<ResultRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobReport {
    pub fn build(job: &Job, units: &[Unit], regenerations: &[RegenerationRecord]) -> Self {
        let chapter_indices: Vec<usize> = if job.outline.is_empty() {
            job.chapters.keys().copied().collect()
        } else {
            job.outline.iter().map(|c| c.index).collect()
        };
        let chapters = chapter_indices
            .into_iter()
            .map(|index| {
                let slot = job.chapters.get(&index);
                let state = if job.failed_chapters.contains(&index) && slot.is_none() {
                    ChapterState::Failed
                } else if job.below_threshold_chapters.contains(&index) && slot.is_some() {
                    ChapterState::BelowThreshold
                } else if slot.is_some() {
                    ChapterState::Ready
                } else {
                    ChapterState::Pending
                };
                ChapterSummary {
                    chapter_index: index,
                    title: job
                        .outline_for(index)
                        .map(|c| c.title.clone())
                        .unwrap_or_default(),
                    state,
                    content_ref: slot.map(|s| s.content_ref.clone()),
                    generation: slot.map(|s| s.generation),
                    quality_score: slot.and_then(|s| s.quality_score),
                }
            })
            .collect();

        let degraded_chapters: Vec<usize> = job
            .lost_chapters()
            .union(&job.below_threshold_chapters)
            .copied()
            .collect();

        Self {
            job_id: job.id,
            course_id: job.course_id.clone(),
            phase: job.phase,
            admission: job.admission,
            progress_percent: job.progress_percent,
            round: job.round,
            cancel_requested: job.cancel_requested,
            units: units
                .iter()
                .map(|u| UnitSummary {
                    unit_id: u.id,
                    kind: u.kind,
                    status: u.status,
                    attempt_count: u.attempt_count,
                    max_attempts: u.max_attempts,
                    round: u.round,
                    track: u.track,
                    result_ref: u.result_ref.clone(),
                    last_error: u.last_error.as_ref().map(|e| e.code),
                })
                .collect(),
            chapters,
            regenerations: regenerations
                .iter()
                .map(|r| RegenerationSummary {
                    regeneration_id: r.id,
                    chapter_index: r.chapter_index,
                    status: r.status,
                    stage: r.stage,
                    unit_id: r.unit_id,
                })
                .collect(),
            error_detail: job.error_detail.clone(),
            degraded_chapters,
            export_ref: job.export_ref.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }

    /// Units of one kind, oldest first.
    pub fn units_of(&self, kind: UnitKind) -> Vec<&UnitSummary> {
        self.units.iter().filter(|u| u.kind == kind).collect()
    }

    pub fn chapter(&self, chapter_index: usize) -> Option<&ChapterSummary> {
        self.chapters.iter().find(|c| c.chapter_index == chapter_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::{CourseSpec, Priority};
    use serde_json::json;
    use std::thread;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(
            Arc::new(MemoryRecordStore::new()),
            PhasePlan::from_config(&EngineConfig::default()),
        )
    }

    fn job() -> Job {
        Job::new(CourseSpec::new("c-1", "Rust", 3), Priority::Normal, false, Utc::now())
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let tracker = Arc::new(tracker());
        let job = tracker.create_job(job()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                let job_id = job.id;
                thread::spawn(move || {
                    tracker
                        .update_job(&job_id, |job| {
                            job.round_scope.insert(i);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stored = tracker.load_job(&job.id).unwrap();
        assert_eq!(stored.round_scope.len(), 8);
        assert_eq!(stored.version, 9);
    }

    #[test]
    fn terminal_job_rejects_updates_but_allows_swap() {
        let tracker = tracker();
        let job = tracker.create_job(job()).unwrap();
        tracker
            .update_job(&job.id, |job| {
                job.phase = Phase::Done;
                Ok(())
            })
            .unwrap();
        let err = tracker.update_job(&job.id, |_| Ok(())).unwrap_err();
        assert!(matches!(err, EngineError::JobFinalized(_)));

        let slot = ChapterSlot {
            chapter_index: 1,
            content_ref: ResultRef::new("content/1/v2"),
            content_unit: UnitId::new(),
            assessment_ref: None,
            quality_score: Some(0.8),
            quality_passed: Some(true),
            generation: 0,
            updated_at: Utc::now(),
        };
        let swapped = tracker.swap_chapter(&job.id, slot.clone(), None).unwrap();
        assert_eq!(swapped.phase, Phase::Done);
        assert_eq!(swapped.chapters[&1].generation, 0);

        // a second swap based on the stale generation loses
        assert!(matches!(
            tracker.swap_chapter(&job.id, slot, None),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn event_sequence_is_strictly_increasing() {
        let tracker = tracker();
        let job_id = JobId::new();
        for _ in 0..3 {
            tracker.emit(&job_id, EventType::UnitStarted, json!({}));
        }
        let events = tracker.events(&job_id, 0).unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_appends_keep_each_job_gapless() {
        let tracker = tracker();
        let jobs = [JobId::new(), JobId::new()];
        std::thread::scope(|scope| {
            for n in 0..8 {
                let tracker = &tracker;
                let job_id = jobs[n % 2];
                scope.spawn(move || {
                    for _ in 0..25 {
                        tracker.emit(&job_id, EventType::UnitSucceeded, json!({ "writer": n }));
                    }
                });
            }
        });
        for job_id in &jobs {
            let seqs: Vec<u64> = tracker.events(job_id, 0).unwrap().iter().map(|e| e.seq).collect();
            assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
        }
    }
}
