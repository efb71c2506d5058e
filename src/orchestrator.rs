//! Job Orchestrator
//!
//! Drives each job through Structure, Content, Assessment, Validation and Export. A phase is
//! decomposed into units, the units go to the work queue, and their terminal outcomes come
//! back over the pool's outcome channel. Once every unit of the phase (and quality round) is
//! terminal and applied, the tolerance policy decides whether the job advances, reworks
//! below-threshold chapters, finishes or fails.
//!
//! All work on one job runs under that job's lock; different jobs proceed in parallel.

pub mod apply;
pub mod locks;
pub mod plan;

pub use apply::Applied;
pub use locks::JobLocks;

use crate::admission::{Admission, AdmissionController};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorClass, UnitError, UnitErrorCode};
use crate::job::{
    AdmissionState, ErrorDetail, Job, Phase, TolerancePolicy, Unit, UnitStatus, UnitTrack,
};
use crate::pool::{unit_event, UnitOutcome};
use crate::queue::{QueueEntry, WorkQueue};
use crate::regeneration::RegenerationController;
use crate::tracker::event::PhaseEventData;
use crate::tracker::{EventType, ProgressTracker};
use crate::types::{CourseSpec, JobId, SubmitOptions, UnitId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Persist `units`, record their enqueue events and hand them to the queue.
pub(crate) fn schedule_units(
    tracker: &ProgressTracker,
    queue: &WorkQueue,
    units: Vec<Unit>,
    sla_deadline: Option<DateTime<Utc>>,
) -> Result<Vec<UnitId>, EngineError> {
    let mut scheduled = Vec::with_capacity(units.len());
    for unit in units {
        let unit = tracker.create_unit(unit)?;
        tracker.emit(&unit.job_id, EventType::UnitEnqueued, unit_event(&unit, None, None));
        if !queue.enqueue(QueueEntry::for_unit(&unit, sla_deadline)) {
            return Err(EngineError::QueueClosed);
        }
        scheduled.push(unit.id);
    }
    Ok(scheduled)
}

/// Remove every queued unit of `job_id` and mark it aborted.
pub(crate) fn abort_queued(tracker: &ProgressTracker, queue: &WorkQueue, job_id: &JobId) -> usize {
    let purged = queue.purge_job(job_id);
    let mut aborted = 0;
    for entry in &purged {
        let result = tracker.update_unit(&entry.unit_id, |unit| {
            unit.status = UnitStatus::Aborted;
            unit.last_error = Some(UnitError::fatal(UnitErrorCode::Cancelled, "job stopped"));
            Ok(())
        });
        match result {
            Ok((unit, _)) => {
                tracker.emit(job_id, EventType::UnitAborted, unit_event(&unit, None, None));
                aborted += 1;
            }
            Err(err) => {
                debug!(unit_id = %entry.unit_id, error = %err, "Queued unit already finished");
            }
        }
    }
    aborted
}

pub struct JobOrchestrator {
    config: EngineConfig,
    tracker: Arc<ProgressTracker>,
    queue: Arc<WorkQueue>,
    admission: Arc<AdmissionController>,
    locks: Arc<JobLocks>,
    regeneration: Arc<RegenerationController>,
    this: Weak<JobOrchestrator>,
}

impl JobOrchestrator {
    pub fn new(
        config: EngineConfig,
        tracker: Arc<ProgressTracker>,
        queue: Arc<WorkQueue>,
        admission: Arc<AdmissionController>,
        regeneration: Arc<RegenerationController>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            tracker,
            queue,
            admission,
            locks: Arc::new(JobLocks::new()),
            regeneration,
            this: this.clone(),
        })
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    // --- public operations ---

    /// Accept a course spec. The job starts immediately if a concurrency slot is free,
    /// otherwise it waits in admission.
    pub async fn submit(&self, spec: CourseSpec, options: SubmitOptions) -> Result<JobId, EngineError> {
        spec.validate(self.config.max_chapters)
            .map_err(EngineError::InvalidCourseSpec)?;

        let sla_budget = self.config.sla_target() * spec.chapter_count as u32;
        let sla_deadline = Utc::now()
            + chrono::Duration::from_std(sla_budget).unwrap_or_else(|_| chrono::Duration::zero());
        let allow_partial = options
            .allow_partial
            .unwrap_or(self.config.allow_partial_on_cancel);
        let job = self
            .tracker
            .create_job(Job::new(spec, options.priority, allow_partial, sla_deadline))?;

        info!(
            job_id = %job.id,
            course_id = %job.course_id,
            chapters = job.spec.chapter_count,
            priority = ?job.priority,
            "Job submitted"
        );
        self.tracker.emit(
            &job.id,
            EventType::JobSubmitted,
            json!({
                "course_id": job.course_id,
                "chapter_count": job.spec.chapter_count,
                "priority": job.priority,
            }),
        );

        match self.admission.request(job.id, job.priority) {
            Admission::Admitted { slot } => self.activate(job.id, slot).await?,
            Admission::Queued { position } => {
                info!(job_id = %job.id, position, "Concurrency budget exhausted, job pending admission");
            }
        }
        Ok(job.id)
    }

    /// Request cooperative cancellation. Queued units are dropped; running units finish
    /// their current attempt. Cancelling a finished job is a no-op.
    pub async fn cancel(&self, job_id: &JobId) -> Result<(), EngineError> {
        let _guard = self.locks.lock(job_id).await;
        let job = self.tracker.load_job(job_id)?;
        if job.is_terminal() {
            debug!(job_id = %job_id, phase = %job.phase, "Cancel on finished job ignored");
            return Ok(());
        }
        if !job.cancel_requested {
            let (job, _) = self.tracker.update_job(job_id, |job| {
                job.cancel_requested = true;
                Ok(())
            })?;
            info!(job_id = %job_id, phase = %job.phase, "Cancellation requested");
            self.tracker
                .emit(job_id, EventType::CancelRequested, json!({ "phase": job.phase }));
        }

        if job.admission == AdmissionState::Pending && self.admission.withdraw(job_id) {
            debug!(job_id = %job_id, "Withdrew pending job from admission");
        }
        let aborted = abort_queued(&self.tracker, &self.queue, job_id);
        if aborted > 0 {
            debug!(job_id = %job_id, aborted, "Dropped queued units of cancelled job");
        }
        self.regeneration.abandon_job(
            job_id,
            ErrorDetail::new(ErrorClass::Cancelled, job.phase, "job cancelled"),
        )?;
        self.settle_cancelled(job_id)
    }

    /// Regenerate one chapter. See [`RegenerationController::request`].
    pub async fn request_regeneration(
        &self,
        job_id: &JobId,
        chapter_index: usize,
        reason: &str,
    ) -> Result<UnitId, EngineError> {
        let _guard = self.locks.lock(job_id).await;
        let (_, unit_id) = self.regeneration.request(job_id, chapter_index, reason)?;
        Ok(unit_id)
    }

    /// Forward pool outcomes to per-job handlers until the channel closes.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut outcomes: mpsc::UnboundedReceiver<UnitOutcome>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut handlers: Vec<JoinHandle<()>> = Vec::new();
            while let Some(outcome) = outcomes.recv().await {
                handlers.retain(|handle| !handle.is_finished());
                let handler = Arc::clone(&this);
                handlers.push(tokio::spawn(async move {
                    handler.handle_outcome(outcome).await;
                }));
            }
            // channel closed: the pool has stopped, finish applying what it delivered
            for result in join_all(handlers).await {
                if let Err(err) = result {
                    warn!(error = %err, "Outcome handler ended abnormally");
                }
            }
            debug!("Outcome dispatcher stopped");
        })
    }

    pub async fn handle_outcome(&self, outcome: UnitOutcome) {
        let unit = outcome.unit();
        let job_id = unit.job_id;
        let guard = self.locks.lock(&job_id).await;
        let result = match unit.track {
            UnitTrack::Main => self.on_main_outcome(unit),
            UnitTrack::Regeneration(id) => self
                .regeneration
                .on_outcome(&id, &outcome)
                .and_then(|_| self.settle_cancelled(&job_id)),
        };
        if let Err(err) = result {
            error!(
                job_id = %job_id,
                unit_id = %unit.id,
                kind = %unit.kind,
                error = %err,
                "Failed to apply unit outcome"
            );
        }
        drop(guard);
        if self.tracker.load_job(&job_id).map(|j| j.is_terminal()).unwrap_or(false) {
            self.locks.release_idle(&job_id);
        }
    }

    // --- admission ---

    async fn activate(&self, job_id: JobId, slot: usize) -> Result<(), EngineError> {
        let _guard = self.locks.lock(&job_id).await;
        let job = self.tracker.load_job(&job_id)?;
        if job.is_terminal() || job.cancel_requested {
            // cancelled while waiting; hand the slot on
            self.admit_next(&job_id);
            return Ok(());
        }
        self.tracker.update_job(&job_id, |job| {
            job.admission = AdmissionState::Active;
            job.concurrency_slot = Some(slot);
            Ok(())
        })?;
        info!(job_id = %job_id, slot, "Job admitted");
        self.tracker
            .emit(&job_id, EventType::JobAdmitted, json!({ "slot": slot }));
        self.start_phase(&job_id, Phase::Structure, 0, BTreeSet::new())
    }

    fn admit_next(&self, job_id: &JobId) {
        for (next, slot) in self.admission.release(job_id) {
            let Some(this) = self.this.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(err) = this.activate(next, slot).await {
                    error!(job_id = %next, error = %err, "Failed to start admitted job");
                }
            });
        }
    }

    // --- state machine ---

    fn tolerance(&self, phase: Phase) -> TolerancePolicy {
        self.tracker
            .plan()
            .definition(phase)
            .map(|d| d.tolerance)
            .unwrap_or(TolerancePolicy::Zero)
    }

    fn on_main_outcome(&self, unit: &Unit) -> Result<(), EngineError> {
        let current = self.tracker.load_job(&unit.job_id)?;
        if current.is_terminal() {
            debug!(job_id = %unit.job_id, unit_id = %unit.id, "Outcome for finished job ignored");
            return Ok(());
        }
        if unit.kind.phase() != current.phase || unit.round != current.round {
            warn!(
                job_id = %unit.job_id,
                unit_id = %unit.id,
                kind = %unit.kind,
                phase = %current.phase,
                "Outcome from a previous phase ignored"
            );
            return Ok(());
        }

        let threshold = self.config.quality_threshold;
        let tolerate_assessment = matches!(self.tolerance(Phase::Assessment), TolerancePolicy::Fraction(_));
        let (job, applied) = self.tracker.update_job(&unit.job_id, |job| {
            let applied = apply::apply_unit(job, unit, threshold, tolerate_assessment);
            self.tracker.refresh_progress(job)?;
            Ok(applied)
        })?;

        match applied {
            Applied::Recorded => {}
            Applied::Stale => {
                debug!(job_id = %job.id, unit_id = %unit.id, "Outcome already applied or superseded");
            }
            Applied::JobFailed(detail) => return self.fail_job(&job, detail),
            Applied::ChapterLost(index) => {
                let total = job.chapter_count();
                let allowed = self.tolerance(job.phase).allowed_failures(total);
                let lost = job.lost_chapters().len();
                if lost > allowed {
                    let detail = ErrorDetail::new(
                        ErrorClass::ToleranceExceeded,
                        job.phase,
                        format!("{lost} of {total} chapters failed, at most {allowed} tolerated"),
                    )
                    .for_chapter(index);
                    return self.fail_job(&job, detail);
                }
                warn!(
                    job_id = %job.id,
                    chapter_index = index,
                    phase = %job.phase,
                    lost,
                    allowed,
                    "Chapter failure tolerated, job will finish degraded"
                );
                self.tracker.emit(
                    &job.id,
                    EventType::ChapterTolerated,
                    json!({ "chapter_index": index, "phase": job.phase, "lost": lost, "allowed": allowed }),
                );
            }
            Applied::ReworkKept(index) => {
                warn!(
                    job_id = %job.id,
                    chapter_index = index,
                    round = job.round,
                    "Rework failed, keeping previous chapter content"
                );
            }
        }

        if job.cancel_requested {
            return self.settle_cancelled(&job.id);
        }
        if !self.phase_settled(&job)? {
            return Ok(());
        }
        self.complete_phase(job)
    }

    /// Every main-track unit of the current phase and round is terminal and applied.
    fn phase_settled(&self, job: &Job) -> Result<bool, EngineError> {
        let units = self.tracker.list_units(&job.id)?;
        let mut current = units.iter().filter(|u| {
            u.track == UnitTrack::Main && u.kind.phase() == job.phase && u.round == job.round
        });
        Ok(current.all(|u| u.is_terminal() && job.settled_units.contains(&u.id)))
    }

    fn complete_phase(&self, job: Job) -> Result<(), EngineError> {
        info!(job_id = %job.id, phase = %job.phase, round = job.round, "Phase complete");
        match job.phase {
            Phase::Structure => {
                let scope = job.outline.iter().map(|c| c.index).collect();
                self.start_phase(&job.id, Phase::Content, job.round, scope)
            }
            Phase::Content => self.start_phase(&job.id, Phase::Assessment, job.round, job.round_scope.clone()),
            Phase::Assessment => self.start_phase(&job.id, Phase::Validation, job.round, job.round_scope.clone()),
            Phase::Validation => {
                let flagged: BTreeSet<usize> = job
                    .round_scope
                    .iter()
                    .copied()
                    .filter(|index| {
                        job.chapters
                            .get(index)
                            .map(|slot| slot.quality_passed != Some(true))
                            .unwrap_or(false)
                    })
                    .collect();
                if flagged.is_empty() {
                    return self.start_export(&job);
                }
                if job.round < self.config.max_quality_rounds {
                    let round = job.round + 1;
                    info!(
                        job_id = %job.id,
                        round,
                        chapters = ?flagged,
                        "Quality below threshold, reworking chapters"
                    );
                    self.tracker.emit(
                        &job.id,
                        EventType::QualityReworkStarted,
                        json!({ "round": round, "chapters": flagged }),
                    );
                    return self.start_phase(&job.id, Phase::Content, round, flagged);
                }
                warn!(
                    job_id = %job.id,
                    chapters = ?flagged,
                    rounds = job.round,
                    "Quality rounds exhausted, accepting chapters below threshold"
                );
                let (job, _) = self.tracker.update_job(&job.id, |job| {
                    job.below_threshold_chapters.extend(flagged.iter().copied());
                    if job.error_detail.is_none() {
                        job.error_detail = Some(ErrorDetail::new(
                            ErrorClass::QualityBelowThreshold,
                            Phase::Validation,
                            format!("{} chapters accepted below the quality threshold", flagged.len()),
                        ));
                    }
                    Ok(())
                })?;
                self.start_export(&job)
            }
            Phase::Export => {
                let phase = if job.is_degraded() { Phase::Degraded } else { Phase::Done };
                self.finalize(&job.id, phase, None)
            }
            Phase::Done | Phase::Failed | Phase::Degraded => Ok(()),
        }
    }

    fn start_export(&self, job: &Job) -> Result<(), EngineError> {
        if job.chapters.is_empty() {
            let detail = ErrorDetail::new(
                ErrorClass::ToleranceExceeded,
                Phase::Export,
                "no chapter content left to export",
            );
            return self.fail_job(job, detail);
        }
        self.start_phase(&job.id, Phase::Export, job.round, BTreeSet::new())
    }

    fn start_phase(&self, job_id: &JobId, phase: Phase, round: u32, scope: BTreeSet<usize>) -> Result<(), EngineError> {
        let (job, _) = self.tracker.update_job(job_id, |job| {
            job.phase = phase;
            job.round = round;
            job.round_scope = scope.clone();
            job.settled_units.clear();
            self.tracker.refresh_progress(job)
        })?;
        if job.cancel_requested {
            return self.settle_cancelled(job_id);
        }

        let units = plan::phase_units(&job, &self.config)?;
        info!(
            job_id = %job_id,
            phase = %phase,
            round,
            units = units.len(),
            progress = job.progress_percent,
            "Phase started"
        );
        self.tracker.emit(
            job_id,
            EventType::PhaseStarted,
            PhaseEventData {
                phase: phase.to_string(),
                round,
                units: units.len(),
            },
        );
        if units.is_empty() {
            return self.complete_phase(job);
        }
        schedule_units(&self.tracker, &self.queue, units, Some(job.sla_deadline))?;
        Ok(())
    }

    fn fail_job(&self, job: &Job, detail: ErrorDetail) -> Result<(), EngineError> {
        error!(
            job_id = %job.id,
            phase = %job.phase,
            class = %detail.class,
            chapter_index = ?detail.chapter_index,
            "Job failed"
        );
        abort_queued(&self.tracker, &self.queue, &job.id);
        self.regeneration.abandon_job(&job.id, detail.clone())?;
        self.finalize(&job.id, Phase::Failed, Some(detail))
    }

    /// Finish a cancelled job once none of its units is still queued or running.
    fn settle_cancelled(&self, job_id: &JobId) -> Result<(), EngineError> {
        let job = self.tracker.load_job(job_id)?;
        if job.is_terminal() || !job.cancel_requested {
            return Ok(());
        }
        let in_flight = self
            .tracker
            .list_units(job_id)?
            .iter()
            .filter(|u| !u.is_terminal())
            .count();
        if in_flight > 0 {
            debug!(job_id = %job_id, in_flight, "Cancelled job waiting for in-flight units");
            return Ok(());
        }
        let phase = if job.allow_partial && !job.chapters.is_empty() {
            Phase::Degraded
        } else {
            Phase::Failed
        };
        let detail = ErrorDetail::new(ErrorClass::Cancelled, job.phase, "cancelled by request");
        self.finalize(job_id, phase, Some(detail))
    }

    fn finalize(&self, job_id: &JobId, phase: Phase, detail: Option<ErrorDetail>) -> Result<(), EngineError> {
        let (job, _) = self.tracker.update_job(job_id, |job| {
            job.phase = phase;
            if detail.is_some() {
                job.error_detail = detail.clone();
            }
            job.finished_at = Some(Utc::now());
            self.tracker.refresh_progress(job)
        })?;
        self.tracker.release_admission(job_id)?;
        self.admit_next(job_id);

        if phase == Phase::Done {
            info!(job_id = %job_id, progress = job.progress_percent, "Job done");
        } else {
            let lost = job.lost_chapters();
            warn!(
                job_id = %job_id,
                phase = %phase,
                progress = job.progress_percent,
                lost_chapters = ?lost,
                below_threshold = ?job.below_threshold_chapters,
                "Job finished incomplete"
            );
        }
        self.tracker.emit(
            job_id,
            EventType::JobFinished,
            json!({
                "phase": phase,
                "progress_percent": job.progress_percent,
                "error_class": job.error_detail.as_ref().map(|d| d.class),
            }),
        );
        if let Err(err) = self.tracker.flush() {
            warn!(job_id = %job_id, error = %err, "Failed to flush records");
        }
        Ok(())
    }
}
