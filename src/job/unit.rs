//! Unit record: one schedulable, retryable piece of work within a phase.

use crate::error::UnitError;
use crate::executor::{
    AssessmentOutput, AssessmentRequest, ChapterOutput, ChapterRequest, ExportOutput,
    ExportRequest, StructureOutput, StructureRequest, ValidationOutput, ValidationRequest,
};
use crate::job::record::Phase;
use crate::types::{JobId, Priority, RegenerationId, ResultRef, UnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a unit does. Chapter units carry their chapter index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Structure,
    Chapter(usize),
    Assessment,
    Validation,
    Export,
}

/// `UnitKind` without the chapter index; one queue partition per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitClass {
    Structure,
    Chapter,
    Assessment,
    Validation,
    Export,
}

impl UnitClass {
    pub const ALL: [UnitClass; 5] = [
        UnitClass::Structure,
        UnitClass::Chapter,
        UnitClass::Assessment,
        UnitClass::Validation,
        UnitClass::Export,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitClass::Structure => "structure",
            UnitClass::Chapter => "chapter",
            UnitClass::Assessment => "assessment",
            UnitClass::Validation => "validation",
            UnitClass::Export => "export",
        }
    }
}

impl UnitKind {
    pub fn class(self) -> UnitClass {
        match self {
            UnitKind::Structure => UnitClass::Structure,
            UnitKind::Chapter(_) => UnitClass::Chapter,
            UnitKind::Assessment => UnitClass::Assessment,
            UnitKind::Validation => UnitClass::Validation,
            UnitKind::Export => UnitClass::Export,
        }
    }

    /// Pipeline phase this kind of unit belongs to.
    pub fn phase(self) -> Phase {
        match self {
            UnitKind::Structure => Phase::Structure,
            UnitKind::Chapter(_) => Phase::Content,
            UnitKind::Assessment => Phase::Assessment,
            UnitKind::Validation => Phase::Validation,
            UnitKind::Export => Phase::Export,
        }
    }

    pub fn chapter_index(self) -> Option<usize> {
        match self {
            UnitKind::Chapter(index) => Some(index),
            _ => None,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Chapter(index) => write!(f, "chapter({index})"),
            other => f.write_str(other.class().as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Succeeded | UnitStatus::Failed | UnitStatus::Aborted)
    }
}

/// Whether a unit belongs to the main pipeline or to a chapter regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTrack {
    Main,
    Regeneration(RegenerationId),
}

impl UnitTrack {
    pub fn regeneration_id(self) -> Option<RegenerationId> {
        match self {
            UnitTrack::Main => None,
            UnitTrack::Regeneration(id) => Some(id),
        }
    }
}

/// Typed executor request carried by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitInput {
    Structure(StructureRequest),
    Chapter(ChapterRequest),
    Assessment(AssessmentRequest),
    Validation(ValidationRequest),
    Export(ExportRequest),
}

/// Typed executor output recorded on a succeeded unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitArtifact {
    Structure(StructureOutput),
    Chapter(ChapterOutput),
    Assessment(AssessmentOutput),
    Validation(ValidationOutput),
    Export(ExportOutput),
}

impl UnitArtifact {
    pub fn result_ref(&self) -> &ResultRef {
        match self {
            UnitArtifact::Structure(out) => &out.result_ref,
            UnitArtifact::Chapter(out) => &out.result_ref,
            UnitArtifact::Assessment(out) => &out.result_ref,
            UnitArtifact::Validation(out) => &out.result_ref,
            UnitArtifact::Export(out) => &out.result_ref,
        }
    }
}

/// Unit record. `attempt_count` counts started attempts and never exceeds `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub job_id: JobId,
    pub kind: UnitKind,
    pub status: UnitStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub time_budget_ms: u64,
    pub priority: Priority,
    pub input: UnitInput,
    /// Set once on success, never rewritten
    pub result_ref: Option<ResultRef>,
    pub artifact: Option<UnitArtifact>,
    pub last_error: Option<UnitError>,
    pub track: UnitTrack,
    /// Quality round the unit was planned in
    pub round: u32,
    /// Unit whose result this one replaces
    pub supersedes: Option<UnitId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Unit {
    pub fn new(
        job_id: JobId,
        kind: UnitKind,
        input: UnitInput,
        max_attempts: u32,
        time_budget: Duration,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::new(),
            job_id,
            kind,
            status: UnitStatus::Pending,
            attempt_count: 0,
            max_attempts,
            time_budget_ms: time_budget.as_millis() as u64,
            priority,
            input,
            result_ref: None,
            artifact: None,
            last_error: None,
            track: UnitTrack::Main,
            round: 0,
            supersedes: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            version: 0,
        }
    }

    pub fn on_track(mut self, track: UnitTrack) -> Self {
        self.track = track;
        self
    }

    pub fn in_round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    pub fn superseding(mut self, previous: Option<UnitId>) -> Self {
        self.supersedes = previous;
        self
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Chapters this unit covers.
    pub fn chapter_scope(&self) -> Vec<usize> {
        match &self.input {
            UnitInput::Structure(_) => Vec::new(),
            UnitInput::Chapter(request) => vec![request.outline.index],
            UnitInput::Assessment(request) => request.chapters.iter().map(|c| c.chapter_index).collect(),
            UnitInput::Validation(request) => request.chapters.iter().map(|c| c.chapter_index).collect(),
            UnitInput::Export(request) => request.chapters.iter().map(|c| c.chapter_index).collect(),
        }
    }
}
