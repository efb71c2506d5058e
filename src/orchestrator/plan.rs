//! Unit planning: decompose a job's current phase into units.
//!
//! Pure functions over the job record. The orchestrator and the regeneration controller both
//! build their units here so requests are shaped the same way on either track.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{
    AssessmentRequest, ChapterContent, ChapterRequest, ExportRequest, StructureRequest,
    ValidationRequest,
};
use crate::job::{FanOut, Job, Phase, Unit, UnitClass, UnitInput, UnitKind};
use crate::types::{Priority, ResultRef, UnitId};
use std::time::Duration;

/// Per-attempt time budget for a unit class.
pub fn time_budget(config: &EngineConfig, class: UnitClass) -> Duration {
    let ms = match class {
        UnitClass::Structure => config.structure_time_budget_ms,
        UnitClass::Chapter => config.chapter_time_budget_ms,
        UnitClass::Assessment => config.assessment_time_budget_ms,
        UnitClass::Validation => config.validation_time_budget_ms,
        UnitClass::Export => config.export_time_budget_ms,
    };
    Duration::from_millis(ms)
}

fn new_unit(job: &Job, kind: UnitKind, input: UnitInput, config: &EngineConfig, priority: Priority) -> Unit {
    Unit::new(
        job.id,
        kind,
        input,
        config.max_attempts,
        time_budget(config, kind.class()),
        priority,
    )
}

pub fn structure_unit(job: &Job, config: &EngineConfig) -> Unit {
    new_unit(
        job,
        UnitKind::Structure,
        UnitInput::Structure(StructureRequest {
            job_id: job.id,
            spec: job.spec.clone(),
        }),
        config,
        job.priority,
    )
}

/// Content unit for one chapter. `previous` is the content being rewritten and the unit
/// that produced it, if any.
pub fn chapter_unit(
    job: &Job,
    chapter_index: usize,
    round: u32,
    reason: Option<String>,
    previous: Option<(ResultRef, UnitId)>,
    config: &EngineConfig,
    priority: Priority,
) -> Result<Unit, EngineError> {
    let outline = job
        .outline_for(chapter_index)
        .cloned()
        .ok_or(EngineError::ChapterNotAddressable {
            job_id: job.id,
            chapter_index,
        })?;
    let structure_ref = job.structure_ref.clone().ok_or_else(|| {
        EngineError::InvalidState(format!("job {} has no structure yet", job.id))
    })?;
    let unit = new_unit(
        job,
        UnitKind::Chapter(chapter_index),
        UnitInput::Chapter(ChapterRequest {
            job_id: job.id,
            spec: job.spec.clone(),
            outline,
            structure_ref,
            round,
            reason,
            previous_ref: previous.as_ref().map(|(content_ref, _)| content_ref.clone()),
        }),
        config,
        priority,
    );
    Ok(unit.superseding(previous.map(|(_, unit_id)| unit_id)))
}

pub fn assessment_units(
    job: &Job,
    chapters: Vec<ChapterContent>,
    fan_out: FanOut,
    config: &EngineConfig,
    priority: Priority,
) -> Vec<Unit> {
    split(chapters, fan_out)
        .into_iter()
        .map(|chapters| {
            new_unit(
                job,
                UnitKind::Assessment,
                UnitInput::Assessment(AssessmentRequest {
                    job_id: job.id,
                    spec: job.spec.clone(),
                    chapters,
                }),
                config,
                priority,
            )
        })
        .collect()
}

pub fn validation_units(
    job: &Job,
    chapters: Vec<ChapterContent>,
    fan_out: FanOut,
    config: &EngineConfig,
    priority: Priority,
) -> Vec<Unit> {
    split(chapters, fan_out)
        .into_iter()
        .map(|chapters| {
            new_unit(
                job,
                UnitKind::Validation,
                UnitInput::Validation(ValidationRequest {
                    job_id: job.id,
                    spec: job.spec.clone(),
                    chapters,
                    threshold: config.quality_threshold,
                }),
                config,
                priority,
            )
        })
        .collect()
}

pub fn export_unit(job: &Job, config: &EngineConfig) -> Unit {
    new_unit(
        job,
        UnitKind::Export,
        UnitInput::Export(ExportRequest {
            job_id: job.id,
            course_id: job.course_id.clone(),
            structure_ref: job.structure_ref.clone(),
            chapters: job.chapter_contents(job.chapters.keys().copied()),
        }),
        config,
        job.priority,
    )
}

fn split(chapters: Vec<ChapterContent>, fan_out: FanOut) -> Vec<Vec<ChapterContent>> {
    if chapters.is_empty() {
        return Vec::new();
    }
    match fan_out {
        FanOut::Single => vec![chapters],
        FanOut::PerChapter => chapters.into_iter().map(|c| vec![c]).collect(),
    }
}

/// Main-track units for the job's current phase, round and round scope.
///
/// An empty result means the phase has nothing to do for this round.
pub fn phase_units(job: &Job, config: &EngineConfig) -> Result<Vec<Unit>, EngineError> {
    let units = match job.phase {
        Phase::Structure => vec![structure_unit(job, config)],
        Phase::Content => job
            .round_scope
            .iter()
            .map(|index| {
                let previous = job.chapters.get(index);
                let reason = previous.filter(|_| job.round > 0).map(|slot| match slot.quality_score {
                    Some(score) => format!("quality score {score:.2} below threshold {:.2}", config.quality_threshold),
                    None => "quality below threshold".to_string(),
                });
                let previous = previous.map(|slot| (slot.content_ref.clone(), slot.content_unit));
                chapter_unit(job, *index, job.round, reason, previous, config, job.priority)
            })
            .collect::<Result<Vec<_>, _>>()?,
        Phase::Assessment => assessment_units(
            job,
            job.chapter_contents(job.round_scope.iter().copied()),
            config.assessment_fanout,
            config,
            job.priority,
        ),
        Phase::Validation => validation_units(
            job,
            job.chapter_contents(job.round_scope.iter().copied()),
            config.validation_fanout,
            config,
            job.priority,
        ),
        Phase::Export => vec![export_unit(job, config)],
        Phase::Done | Phase::Failed | Phase::Degraded => Vec::new(),
    };
    Ok(units.into_iter().map(|unit| unit.in_round(job.round)).collect())
}
