//! Job record: one course-generation request and its pipeline state.

use crate::error::ErrorClass;
use crate::executor::ChapterContent;
use crate::types::{CourseSpec, JobId, Priority, ResultRef, UnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Pipeline phase of a job. Exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Structure,
    Content,
    Assessment,
    Validation,
    Export,
    Done,
    Failed,
    Degraded,
}

impl Phase {
    /// Working phases in pipeline order.
    pub const PIPELINE: [Phase; 5] = [
        Phase::Structure,
        Phase::Content,
        Phase::Assessment,
        Phase::Validation,
        Phase::Export,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Degraded)
    }

    /// Position in `PIPELINE`; terminal phases have none.
    pub fn pipeline_index(self) -> Option<usize> {
        Self::PIPELINE.iter().position(|p| *p == self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Structure => "structure",
            Phase::Content => "content",
            Phase::Assessment => "assessment",
            Phase::Validation => "validation",
            Phase::Export => "export",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Degraded => "degraded",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a job holds one of the global concurrency slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// Accepted, waiting for a slot
    Pending,
    Active,
    /// Slot returned after reaching a terminal phase
    Released,
}

/// One chapter as laid out by the structure phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub index: usize,
    pub title: String,
}

/// The current, reader-visible content of one chapter.
///
/// Replaced as a whole; a regeneration swaps in a new slot with a higher `generation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSlot {
    pub chapter_index: usize,
    pub content_ref: ResultRef,
    pub content_unit: UnitId,
    pub assessment_ref: Option<ResultRef>,
    pub quality_score: Option<f64>,
    pub quality_passed: Option<bool>,
    pub generation: u32,
    pub updated_at: DateTime<Utc>,
}

/// Classified failure surfaced on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub class: ErrorClass,
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_index: Option<usize>,
}

impl ErrorDetail {
    pub fn new(class: ErrorClass, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            class,
            phase,
            message: message.into(),
            chapter_index: None,
        }
    }

    pub fn for_chapter(mut self, chapter_index: usize) -> Self {
        self.chapter_index = Some(chapter_index);
        self
    }
}

/// Job record. Mutated only by the orchestrator, through the tracker's write path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub course_id: String,
    pub spec: CourseSpec,
    pub phase: Phase,
    /// 0-100, never decreases
    pub progress_percent: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub priority: Priority,
    pub admission: AdmissionState,
    /// Slot number held while active
    pub concurrency_slot: Option<usize>,
    pub error_detail: Option<ErrorDetail>,
    pub cancel_requested: bool,
    pub allow_partial: bool,
    pub sla_deadline: DateTime<Utc>,
    pub outline: Vec<ChapterOutline>,
    pub structure_ref: Option<ResultRef>,
    pub export_ref: Option<ResultRef>,
    pub chapters: BTreeMap<usize, ChapterSlot>,
    /// Chapters without usable content after exhausting retries
    pub failed_chapters: BTreeSet<usize>,
    /// Chapters accepted below the quality threshold
    pub below_threshold_chapters: BTreeSet<usize>,
    /// Chapters whose assessment failed after exhausting retries
    #[serde(default)]
    pub missing_assessments: BTreeSet<usize>,
    /// Quality rework round; 0 is the initial pass
    pub round: u32,
    /// Chapters worked on in the current round
    pub round_scope: BTreeSet<usize>,
    /// Units of the current phase whose outcome has been applied
    #[serde(default)]
    pub settled_units: BTreeSet<UnitId>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped by every save
    pub version: u64,
}

impl Job {
    pub fn new(spec: CourseSpec, priority: Priority, allow_partial: bool, sla_deadline: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            course_id: spec.course_id.clone(),
            spec,
            phase: Phase::Structure,
            progress_percent: 0,
            created_at: now,
            updated_at: now,
            priority,
            admission: AdmissionState::Pending,
            concurrency_slot: None,
            error_detail: None,
            cancel_requested: false,
            allow_partial,
            sla_deadline,
            outline: Vec::new(),
            structure_ref: None,
            export_ref: None,
            chapters: BTreeMap::new(),
            failed_chapters: BTreeSet::new(),
            below_threshold_chapters: BTreeSet::new(),
            missing_assessments: BTreeSet::new(),
            round: 0,
            round_scope: BTreeSet::new(),
            settled_units: BTreeSet::new(),
            finished_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn chapter_count(&self) -> usize {
        if self.outline.is_empty() {
            self.spec.chapter_count
        } else {
            self.outline.len()
        }
    }

    /// Some content was lost or accepted below threshold along the way.
    pub fn is_degraded(&self) -> bool {
        !self.failed_chapters.is_empty()
            || !self.below_threshold_chapters.is_empty()
            || !self.missing_assessments.is_empty()
    }

    /// Chapters counted against the content/assessment tolerance.
    pub fn lost_chapters(&self) -> BTreeSet<usize> {
        self.failed_chapters.union(&self.missing_assessments).copied().collect()
    }

    /// Current slots for `indices`, in chapter order, skipping chapters without content.
    pub fn chapter_contents(&self, indices: impl IntoIterator<Item = usize>) -> Vec<ChapterContent> {
        let mut indices: Vec<usize> = indices.into_iter().collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .filter_map(|index| self.chapters.get(&index))
            .map(|slot| ChapterContent {
                chapter_index: slot.chapter_index,
                content_ref: slot.content_ref.clone(),
                assessment_ref: slot.assessment_ref.clone(),
            })
            .collect()
    }

    pub fn outline_for(&self, chapter_index: usize) -> Option<&ChapterOutline> {
        self.outline.iter().find(|c| c.index == chapter_index)
    }

    /// Raise progress, never lower it.
    pub fn raise_progress(&mut self, computed: u8) {
        self.progress_percent = self.progress_percent.max(computed.min(100));
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
