//! Unit Executors
//!
//! Typed contracts for the external collaborators that do the actual work: the structure and
//! chapter generators, the assessment builder, the quality validator and the export encoder.
//! Each executor takes a typed request plus a [`Deadline`] and returns a typed output or a
//! [`UnitError`] tagged `Retryable` or `Fatal`. The engine never looks inside a `ResultRef`.

pub mod simulated;
pub mod table;

pub use simulated::SimulatedExecutor;
pub use table::ExecutorTable;

use crate::error::{UnitError, UnitErrorCode};
use crate::job::ChapterOutline;
use crate::types::{CourseSpec, JobId, ResultRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Hard deadline for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    budget: Duration,
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            budget,
            expires_at: Instant::now() + budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureRequest {
    pub job_id: JobId,
    pub spec: CourseSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureOutput {
    pub result_ref: ResultRef,
    pub chapters: Vec<ChapterOutline>,
}

impl StructureOutput {
    /// A structure that does not match the requested chapter count is unusable; retrying
    /// the same spec will not fix it.
    pub fn check(&self, expected_chapters: usize) -> Result<(), UnitError> {
        if self.result_ref.is_empty() {
            return Err(UnitError::fatal(
                UnitErrorCode::MalformedOutput,
                "structure output has an empty result reference",
            ));
        }
        if self.chapters.is_empty() || self.chapters.len() != expected_chapters {
            return Err(UnitError::fatal(
                UnitErrorCode::MalformedOutput,
                format!(
                    "structure produced {} chapters, expected {}",
                    self.chapters.len(),
                    expected_chapters
                ),
            ));
        }
        for (position, chapter) in self.chapters.iter().enumerate() {
            if chapter.index != position {
                return Err(UnitError::fatal(
                    UnitErrorCode::MalformedOutput,
                    format!("chapter at position {} has index {}", position, chapter.index),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRequest {
    pub job_id: JobId,
    pub spec: CourseSpec,
    pub outline: ChapterOutline,
    pub structure_ref: ResultRef,
    /// Quality rework round, 0 for the first draft
    pub round: u32,
    /// Why the chapter is being rewritten (rework or user regeneration)
    pub reason: Option<String>,
    pub previous_ref: Option<ResultRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutput {
    pub result_ref: ResultRef,
    pub section_count: usize,
}

impl ChapterOutput {
    /// Malformed chapter content is worth another attempt.
    pub fn check(&self) -> Result<(), UnitError> {
        if self.result_ref.is_empty() || self.section_count == 0 {
            return Err(UnitError::retryable(
                UnitErrorCode::MalformedOutput,
                "chapter output is empty",
            ));
        }
        Ok(())
    }
}

/// Content pointer for one chapter handed to downstream phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterContent {
    pub chapter_index: usize,
    pub content_ref: ResultRef,
    pub assessment_ref: Option<ResultRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRequest {
    pub job_id: JobId,
    pub spec: CourseSpec,
    pub chapters: Vec<ChapterContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentOutput {
    pub result_ref: ResultRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub job_id: JobId,
    pub spec: CourseSpec,
    pub chapters: Vec<ChapterContent>,
    pub threshold: f64,
}

/// Validator verdict for one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterVerdict {
    pub chapter_index: usize,
    pub passed: bool,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub result_ref: ResultRef,
    pub verdicts: Vec<ChapterVerdict>,
}

impl ValidationOutput {
    /// Every requested chapter needs exactly one verdict with a score in [0, 1].
    pub fn check(&self, requested: &[usize]) -> Result<(), UnitError> {
        for index in requested {
            let count = self
                .verdicts
                .iter()
                .filter(|v| v.chapter_index == *index)
                .count();
            if count != 1 {
                return Err(UnitError::retryable(
                    UnitErrorCode::MalformedOutput,
                    format!("expected one verdict for chapter {index}, got {count}"),
                ));
            }
        }
        if let Some(bad) = self
            .verdicts
            .iter()
            .find(|v| !v.score.is_finite() || !(0.0..=1.0).contains(&v.score))
        {
            return Err(UnitError::retryable(
                UnitErrorCode::MalformedOutput,
                format!("chapter {} has out-of-range score {}", bad.chapter_index, bad.score),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub job_id: JobId,
    pub course_id: String,
    pub structure_ref: Option<ResultRef>,
    pub chapters: Vec<ChapterContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOutput {
    pub result_ref: ResultRef,
}

fn require_ref(result_ref: &ResultRef, what: &str) -> Result<(), UnitError> {
    if result_ref.is_empty() {
        return Err(UnitError::retryable(
            UnitErrorCode::MalformedOutput,
            format!("{what} output has an empty result reference"),
        ));
    }
    Ok(())
}

impl AssessmentOutput {
    pub fn check(&self) -> Result<(), UnitError> {
        require_ref(&self.result_ref, "assessment")
    }
}

impl ExportOutput {
    pub fn check(&self) -> Result<(), UnitError> {
        require_ref(&self.result_ref, "export")
    }
}

/// Produces the chapter outline of a course.
#[async_trait]
pub trait StructureExecutor: Send + Sync {
    async fn generate_structure(
        &self,
        request: StructureRequest,
        deadline: Deadline,
    ) -> Result<StructureOutput, UnitError>;
}

/// Writes the content of one chapter.
#[async_trait]
pub trait ChapterExecutor: Send + Sync {
    async fn generate_chapter(
        &self,
        request: ChapterRequest,
        deadline: Deadline,
    ) -> Result<ChapterOutput, UnitError>;
}

#[async_trait]
pub trait AssessmentExecutor: Send + Sync {
    async fn generate_assessment(
        &self,
        request: AssessmentRequest,
        deadline: Deadline,
    ) -> Result<AssessmentOutput, UnitError>;
}

/// Scores chapter quality; the engine only reads pass/fail and the score.
#[async_trait]
pub trait ValidationExecutor: Send + Sync {
    async fn validate(
        &self,
        request: ValidationRequest,
        deadline: Deadline,
    ) -> Result<ValidationOutput, UnitError>;
}

#[async_trait]
pub trait ExportExecutor: Send + Sync {
    async fn export(
        &self,
        request: ExportRequest,
        deadline: Deadline,
    ) -> Result<ExportOutput, UnitError>;
}
