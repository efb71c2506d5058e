//! Regeneration request record.

use crate::job::{ErrorDetail, Phase};
use crate::types::{JobId, RegenerationId, ResultRef, UnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerationStatus {
    Running,
    /// New content swapped in
    Completed,
    /// Previous content kept
    Failed,
}

impl RegenerationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RegenerationStatus::Running)
    }
}

/// One targeted re-run of a chapter through Content, Assessment and Validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegenerationRecord {
    pub id: RegenerationId,
    pub job_id: JobId,
    pub chapter_index: usize,
    pub reason: String,
    pub status: RegenerationStatus,
    /// Sub-pipeline stage currently running
    pub stage: Phase,
    /// Superseding chapter unit created for the request
    pub unit_id: UnitId,
    /// Content unit whose result is being replaced, if the chapter had one
    pub superseded_unit: Option<UnitId>,
    pub previous_ref: Option<ResultRef>,
    /// Current candidate content, swapped in on completion
    pub candidate_unit: Option<UnitId>,
    pub candidate_ref: Option<ResultRef>,
    pub assessment_ref: Option<ResultRef>,
    pub quality_score: Option<f64>,
    /// Quality rework round within this regeneration
    pub round: u32,
    /// Slot generation observed when the request was accepted
    pub base_generation: Option<u32>,
    pub error_detail: Option<ErrorDetail>,
    pub requested_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl RegenerationRecord {
    pub fn new(
        id: RegenerationId,
        job_id: JobId,
        chapter_index: usize,
        reason: impl Into<String>,
        unit_id: UnitId,
    ) -> Self {
        Self {
            id,
            job_id,
            chapter_index,
            reason: reason.into(),
            status: RegenerationStatus::Running,
            stage: Phase::Content,
            unit_id,
            superseded_unit: None,
            previous_ref: None,
            candidate_unit: None,
            candidate_ref: None,
            assessment_ref: None,
            quality_score: None,
            round: 0,
            base_generation: None,
            error_detail: None,
            requested_at: Utc::now(),
            finished_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
