//! Fold one terminal main-track unit into its job record.

use crate::error::{ErrorClass, UnitError, UnitErrorCode};
use crate::job::{ChapterSlot, ErrorDetail, Job, Unit, UnitArtifact, UnitInput, UnitKind, UnitStatus};
use chrono::Utc;

/// What applying a unit outcome did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Recorded,
    /// The chapter lost its content or assessment; counts against the tolerance
    ChapterLost(usize),
    /// A rework attempt failed; the chapter keeps its previous content below threshold
    ReworkKept(usize),
    /// A zero-tolerance unit failed
    JobFailed(ErrorDetail),
    /// Already applied, or the content it refers to was replaced meanwhile
    Stale,
}

/// Classified detail for a failed unit. Carries the error code only, never the raw message.
pub fn failure_detail(unit: &Unit) -> ErrorDetail {
    let fallback = UnitError::fatal(UnitErrorCode::Cancelled, "aborted");
    let error = unit.last_error.as_ref().unwrap_or(&fallback);
    let class = ErrorClass::from_unit_error(error);
    let message = format!(
        "{} unit failed after {} of {} attempts ({})",
        unit.kind,
        unit.attempt_count,
        unit.max_attempts,
        error.code.as_str()
    );
    let detail = ErrorDetail::new(class, unit.kind.phase(), message);
    match unit.kind.chapter_index() {
        Some(index) => detail.for_chapter(index),
        None => detail,
    }
}

/// Apply `unit` to `job`. Deterministic, so the tracker may reapply it on a version conflict.
///
/// `tolerate_assessment` is true when assessment runs per chapter and its failures count
/// against the chapter tolerance instead of failing the job.
pub fn apply_unit(job: &mut Job, unit: &Unit, quality_threshold: f64, tolerate_assessment: bool) -> Applied {
    if !job.settled_units.insert(unit.id) {
        return Applied::Stale;
    }
    match unit.status {
        UnitStatus::Succeeded => apply_success(job, unit, quality_threshold),
        UnitStatus::Failed => apply_failure(job, unit, tolerate_assessment),
        // aborted units only exist once the job is being cancelled or failed
        UnitStatus::Aborted => Applied::Recorded,
        UnitStatus::Pending | UnitStatus::Running => {
            job.settled_units.remove(&unit.id);
            Applied::Stale
        }
    }
}

/// A rework planned against content that has since been replaced, e.g. by a regeneration swap.
/// The chapter leaves the round so later phases do not touch the newer content.
fn rework_superseded(job: &mut Job, unit: &Unit) -> bool {
    let UnitKind::Chapter(index) = unit.kind else {
        return false;
    };
    if unit.round == 0 {
        return false;
    }
    let current = job.chapters.get(&index).map(|slot| slot.content_unit);
    if current.is_some() && unit.supersedes != current {
        job.round_scope.remove(&index);
        return true;
    }
    false
}

fn apply_success(job: &mut Job, unit: &Unit, quality_threshold: f64) -> Applied {
    let Some(artifact) = unit.artifact.as_ref() else {
        return Applied::Stale;
    };
    if rework_superseded(job, unit) {
        return Applied::Stale;
    }
    match (unit.kind, artifact) {
        (UnitKind::Structure, UnitArtifact::Structure(output)) => {
            job.outline = output.chapters.clone();
            job.structure_ref = Some(output.result_ref.clone());
            Applied::Recorded
        }
        (UnitKind::Chapter(index), UnitArtifact::Chapter(output)) => {
            let generation = job
                .chapters
                .get(&index)
                .map(|slot| slot.generation + 1)
                .unwrap_or(0);
            job.chapters.insert(
                index,
                ChapterSlot {
                    chapter_index: index,
                    content_ref: output.result_ref.clone(),
                    content_unit: unit.id,
                    assessment_ref: None,
                    quality_score: None,
                    quality_passed: None,
                    generation,
                    updated_at: Utc::now(),
                },
            );
            job.failed_chapters.remove(&index);
            job.missing_assessments.remove(&index);
            Applied::Recorded
        }
        (UnitKind::Assessment, UnitArtifact::Assessment(output)) => {
            let UnitInput::Assessment(request) = &unit.input else {
                return Applied::Stale;
            };
            let mut applied = false;
            for content in &request.chapters {
                if let Some(slot) = job.chapters.get_mut(&content.chapter_index) {
                    if slot.content_ref == content.content_ref {
                        slot.assessment_ref = Some(output.result_ref.clone());
                        job.missing_assessments.remove(&content.chapter_index);
                        applied = true;
                    }
                }
            }
            if applied {
                Applied::Recorded
            } else {
                Applied::Stale
            }
        }
        (UnitKind::Validation, UnitArtifact::Validation(output)) => {
            let UnitInput::Validation(request) = &unit.input else {
                return Applied::Stale;
            };
            let mut applied = false;
            for verdict in &output.verdicts {
                let Some(content) = request
                    .chapters
                    .iter()
                    .find(|c| c.chapter_index == verdict.chapter_index)
                else {
                    continue;
                };
                if let Some(slot) = job.chapters.get_mut(&verdict.chapter_index) {
                    if slot.content_ref == content.content_ref {
                        slot.quality_score = Some(verdict.score);
                        slot.quality_passed = Some(verdict.passed && verdict.score >= quality_threshold);
                        applied = true;
                    }
                }
            }
            if applied {
                Applied::Recorded
            } else {
                Applied::Stale
            }
        }
        (UnitKind::Export, UnitArtifact::Export(output)) => {
            job.export_ref = Some(output.result_ref.clone());
            Applied::Recorded
        }
        _ => Applied::Stale,
    }
}

fn apply_failure(job: &mut Job, unit: &Unit, tolerate_assessment: bool) -> Applied {
    if rework_superseded(job, unit) {
        return Applied::Stale;
    }
    let detail = failure_detail(unit);
    match unit.kind {
        UnitKind::Chapter(index) if unit.round == 0 => {
            job.failed_chapters.insert(index);
            job.round_scope.remove(&index);
            job.error_detail.get_or_insert(detail);
            Applied::ChapterLost(index)
        }
        UnitKind::Chapter(index) => {
            job.round_scope.remove(&index);
            if job.chapters.contains_key(&index) {
                job.below_threshold_chapters.insert(index);
                Applied::ReworkKept(index)
            } else {
                job.failed_chapters.insert(index);
                job.error_detail.get_or_insert(detail);
                Applied::ChapterLost(index)
            }
        }
        UnitKind::Assessment if tolerate_assessment => {
            let scope = unit.chapter_scope();
            for index in &scope {
                job.missing_assessments.insert(*index);
            }
            job.error_detail.get_or_insert(detail);
            match scope.first() {
                Some(index) => Applied::ChapterLost(*index),
                None => Applied::Recorded,
            }
        }
        UnitKind::Structure | UnitKind::Assessment | UnitKind::Validation | UnitKind::Export => {
            Applied::JobFailed(detail)
        }
    }
}
