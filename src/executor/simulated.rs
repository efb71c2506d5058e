//! Simulated executors for dry runs and fault injection.
//!
//! Produces synthetic result references after a configurable latency. Faults can be scripted
//! per stage or per chapter ("fail the first N calls"), and validation scores per chapter.

use super::{
    AssessmentExecutor, AssessmentOutput, AssessmentRequest, ChapterExecutor, ChapterOutput,
    ChapterRequest, ChapterVerdict, Deadline, ExportExecutor, ExportOutput, ExportRequest,
    StructureExecutor, StructureOutput, StructureRequest, ValidationExecutor, ValidationOutput,
    ValidationRequest,
};
use crate::error::{UnitError, UnitErrorCode};
use crate::job::{ChapterOutline, UnitClass};
use crate::retry::random_unit_interval;
use crate::types::{JobId, ResultRef};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

const DEFAULT_SCORE: f64 = 0.9;

#[derive(Debug, Clone)]
struct Fault {
    /// Number of leading calls that fail
    times: u32,
    error: UnitError,
}

type CallKey = (JobId, UnitClass, Option<usize>);

#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    latency: Duration,
    stage_latency: HashMap<UnitClass, Duration>,
    failure_rate: f64,
    stage_faults: HashMap<UnitClass, Fault>,
    chapter_faults: HashMap<usize, Fault>,
    scores: HashMap<usize, Vec<f64>>,
    structure_chapters: Option<usize>,
    calls: Mutex<HashMap<CallKey, u32>>,
    verdicts: Mutex<HashMap<(JobId, usize), VecDeque<f64>>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_stage_latency(mut self, class: UnitClass, latency: Duration) -> Self {
        self.stage_latency.insert(class, latency);
        self
    }

    /// Probability that any call fails with a retryable provider error.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Fail the first `times` calls of a stage, per job.
    pub fn fail_stage(mut self, class: UnitClass, times: u32, error: UnitError) -> Self {
        self.stage_faults.insert(class, Fault { times, error });
        self
    }

    /// Fail the first `times` content calls for one chapter, per job.
    pub fn fail_chapter(mut self, chapter_index: usize, times: u32, error: UnitError) -> Self {
        self.chapter_faults.insert(chapter_index, Fault { times, error });
        self
    }

    /// Successive validation scores for one chapter; the last one repeats.
    pub fn with_scores(mut self, chapter_index: usize, scores: Vec<f64>) -> Self {
        self.scores.insert(chapter_index, scores);
        self
    }

    /// Make the structure stage return this many chapters regardless of the requested count.
    pub fn with_structure_chapters(mut self, chapters: usize) -> Self {
        self.structure_chapters = Some(chapters);
        self
    }

    /// Calls made so far for a stage (and chapter) of one job.
    pub fn calls(&self, job_id: JobId, class: UnitClass, chapter_index: Option<usize>) -> u32 {
        self.calls
            .lock()
            .get(&(job_id, class, chapter_index))
            .copied()
            .unwrap_or(0)
    }

    async fn simulate(
        &self,
        job_id: JobId,
        class: UnitClass,
        chapter_index: Option<usize>,
        deadline: Deadline,
    ) -> Result<(), UnitError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry((job_id, class, chapter_index)).or_insert(0);
            *count += 1;
            *count
        };

        let latency = self.stage_latency.get(&class).copied().unwrap_or(self.latency);
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if deadline.is_expired() {
            return Err(UnitError::timeout(deadline.budget().as_millis()));
        }

        let scripted = chapter_index
            .filter(|_| class == UnitClass::Chapter)
            .and_then(|index| self.chapter_faults.get(&index))
            .or_else(|| self.stage_faults.get(&class));
        if let Some(fault) = scripted {
            if call <= fault.times {
                return Err(fault.error.clone());
            }
        }

        if self.failure_rate > 0.0 && random_unit_interval() < self.failure_rate {
            return Err(UnitError::retryable(
                UnitErrorCode::ProviderUnavailable,
                format!("simulated {} provider outage", class.as_str()),
            ));
        }
        Ok(())
    }

    fn next_score(&self, job_id: JobId, chapter_index: usize) -> f64 {
        let Some(script) = self.scores.get(&chapter_index) else {
            return DEFAULT_SCORE;
        };
        let mut verdicts = self.verdicts.lock();
        let queue = verdicts
            .entry((job_id, chapter_index))
            .or_insert_with(|| script.iter().copied().collect());
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(DEFAULT_SCORE)
        } else {
            queue.front().copied().unwrap_or(DEFAULT_SCORE)
        }
    }
}

fn synthetic_ref(job_id: JobId, what: &str) -> ResultRef {
    ResultRef::new(format!("sim://{job_id}/{what}/{}", Uuid::new_v4().simple()))
}

#[async_trait]
impl StructureExecutor for SimulatedExecutor {
    async fn generate_structure(
        &self,
        request: StructureRequest,
        deadline: Deadline,
    ) -> Result<StructureOutput, UnitError> {
        self.simulate(request.job_id, UnitClass::Structure, None, deadline)
            .await?;
        let count = self.structure_chapters.unwrap_or(request.spec.chapter_count);
        let chapters = (0..count)
            .map(|index| ChapterOutline {
                index,
                title: format!("{}: part {}", request.spec.domain, index + 1),
            })
            .collect();
        Ok(StructureOutput {
            result_ref: synthetic_ref(request.job_id, "structure"),
            chapters,
        })
    }
}

#[async_trait]
impl ChapterExecutor for SimulatedExecutor {
    async fn generate_chapter(
        &self,
        request: ChapterRequest,
        deadline: Deadline,
    ) -> Result<ChapterOutput, UnitError> {
        let index = request.outline.index;
        self.simulate(request.job_id, UnitClass::Chapter, Some(index), deadline)
            .await?;
        Ok(ChapterOutput {
            result_ref: synthetic_ref(request.job_id, &format!("chapter-{index}")),
            section_count: 3,
        })
    }
}

#[async_trait]
impl AssessmentExecutor for SimulatedExecutor {
    async fn generate_assessment(
        &self,
        request: AssessmentRequest,
        deadline: Deadline,
    ) -> Result<AssessmentOutput, UnitError> {
        let scope = match request.chapters.as_slice() {
            [single] => Some(single.chapter_index),
            _ => None,
        };
        self.simulate(request.job_id, UnitClass::Assessment, scope, deadline)
            .await?;
        Ok(AssessmentOutput {
            result_ref: synthetic_ref(request.job_id, "assessment"),
        })
    }
}

#[async_trait]
impl ValidationExecutor for SimulatedExecutor {
    async fn validate(
        &self,
        request: ValidationRequest,
        deadline: Deadline,
    ) -> Result<ValidationOutput, UnitError> {
        let scope = match request.chapters.as_slice() {
            [single] => Some(single.chapter_index),
            _ => None,
        };
        self.simulate(request.job_id, UnitClass::Validation, scope, deadline)
            .await?;
        let verdicts = request
            .chapters
            .iter()
            .map(|chapter| {
                let score = self.next_score(request.job_id, chapter.chapter_index);
                ChapterVerdict {
                    chapter_index: chapter.chapter_index,
                    passed: score >= request.threshold,
                    score,
                }
            })
            .collect();
        Ok(ValidationOutput {
            result_ref: synthetic_ref(request.job_id, "validation"),
            verdicts,
        })
    }
}

#[async_trait]
impl ExportExecutor for SimulatedExecutor {
    async fn export(
        &self,
        request: ExportRequest,
        deadline: Deadline,
    ) -> Result<ExportOutput, UnitError> {
        self.simulate(request.job_id, UnitClass::Export, None, deadline)
            .await?;
        Ok(ExportOutput {
            result_ref: synthetic_ref(request.job_id, "export"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CourseSpec;

    fn chapter_request(job_id: JobId, index: usize) -> ChapterRequest {
        ChapterRequest {
            job_id,
            spec: CourseSpec::new("c-1", "Rust", 5),
            outline: ChapterOutline {
                index,
                title: format!("Chapter {index}"),
            },
            structure_ref: ResultRef::new("structure"),
            round: 0,
            reason: None,
            previous_ref: None,
        }
    }

    #[tokio::test]
    async fn scripted_chapter_fault_fails_leading_calls_only() {
        let executor = SimulatedExecutor::new().fail_chapter(
            2,
            2,
            UnitError::retryable(UnitErrorCode::ProviderUnavailable, "down"),
        );
        let job_id = JobId::new();
        let deadline = || Deadline::after(Duration::from_secs(1));

        assert!(executor.generate_chapter(chapter_request(job_id, 2), deadline()).await.is_err());
        assert!(executor.generate_chapter(chapter_request(job_id, 2), deadline()).await.is_err());
        assert!(executor.generate_chapter(chapter_request(job_id, 2), deadline()).await.is_ok());
        assert!(executor.generate_chapter(chapter_request(job_id, 1), deadline()).await.is_ok());
        assert_eq!(executor.calls(job_id, UnitClass::Chapter, Some(2)), 3);
    }

    #[test]
    fn scores_advance_then_repeat() {
        let executor = SimulatedExecutor::new().with_scores(0, vec![0.4, 0.95]);
        let job_id = JobId::new();
        assert_eq!(executor.next_score(job_id, 0), 0.4);
        assert_eq!(executor.next_score(job_id, 0), 0.95);
        assert_eq!(executor.next_score(job_id, 0), 0.95);
        assert_eq!(executor.next_score(job_id, 1), DEFAULT_SCORE);
    }
}
