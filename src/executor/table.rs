//! Closed dispatch from `UnitKind` to one typed executor per kind.

use super::{
    AssessmentExecutor, ChapterExecutor, Deadline, ExportExecutor, StructureExecutor,
    ValidationExecutor,
};
use crate::error::{UnitError, UnitErrorCode};
use crate::job::{Unit, UnitArtifact, UnitInput, UnitKind};
use std::sync::Arc;

/// Executor per unit kind, fixed at engine construction.
#[derive(Clone)]
pub struct ExecutorTable {
    structure: Arc<dyn StructureExecutor>,
    chapter: Arc<dyn ChapterExecutor>,
    assessment: Arc<dyn AssessmentExecutor>,
    validation: Arc<dyn ValidationExecutor>,
    export: Arc<dyn ExportExecutor>,
}

impl ExecutorTable {
    pub fn new(
        structure: Arc<dyn StructureExecutor>,
        chapter: Arc<dyn ChapterExecutor>,
        assessment: Arc<dyn AssessmentExecutor>,
        validation: Arc<dyn ValidationExecutor>,
        export: Arc<dyn ExportExecutor>,
    ) -> Self {
        Self {
            structure,
            chapter,
            assessment,
            validation,
            export,
        }
    }

    /// One collaborator implementing every executor role.
    pub fn uniform<E>(executor: Arc<E>) -> Self
    where
        E: StructureExecutor
            + ChapterExecutor
            + AssessmentExecutor
            + ValidationExecutor
            + ExportExecutor
            + 'static,
    {
        Self {
            structure: executor.clone(),
            chapter: executor.clone(),
            assessment: executor.clone(),
            validation: executor.clone(),
            export: executor,
        }
    }

    /// Run one attempt of `unit` and check the output shape.
    ///
    /// A unit whose input does not match its kind can never succeed and fails fatally.
    pub async fn execute(&self, unit: &Unit, deadline: Deadline) -> Result<UnitArtifact, UnitError> {
        match (unit.kind, &unit.input) {
            (UnitKind::Structure, UnitInput::Structure(request)) => {
                let expected = request.spec.chapter_count;
                let output = self
                    .structure
                    .generate_structure(request.clone(), deadline)
                    .await?;
                output.check(expected)?;
                Ok(UnitArtifact::Structure(output))
            }
            (UnitKind::Chapter(index), UnitInput::Chapter(request)) if request.outline.index == index => {
                let output = self.chapter.generate_chapter(request.clone(), deadline).await?;
                output.check()?;
                Ok(UnitArtifact::Chapter(output))
            }
            (UnitKind::Assessment, UnitInput::Assessment(request)) => {
                let output = self
                    .assessment
                    .generate_assessment(request.clone(), deadline)
                    .await?;
                output.check()?;
                Ok(UnitArtifact::Assessment(output))
            }
            (UnitKind::Validation, UnitInput::Validation(request)) => {
                let requested: Vec<usize> = request.chapters.iter().map(|c| c.chapter_index).collect();
                let output = self.validation.validate(request.clone(), deadline).await?;
                output.check(&requested)?;
                Ok(UnitArtifact::Validation(output))
            }
            (UnitKind::Export, UnitInput::Export(request)) => {
                let output = self.export.export(request.clone(), deadline).await?;
                output.check()?;
                Ok(UnitArtifact::Export(output))
            }
            (kind, _) => Err(UnitError::fatal(
                UnitErrorCode::InvalidInput,
                format!("unit {} carries input for a different kind than {}", unit.id, kind),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::{SimulatedExecutor, StructureRequest};
    use crate::job::UnitKind;
    use crate::types::{CourseSpec, JobId, Priority};
    use std::time::Duration;

    fn structure_unit(job_id: JobId, kind: UnitKind) -> Unit {
        Unit::new(
            job_id,
            kind,
            UnitInput::Structure(StructureRequest {
                job_id,
                spec: CourseSpec::new("c-1", "Rust", 3),
            }),
            3,
            Duration::from_secs(1),
            Priority::Normal,
        )
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let table = ExecutorTable::uniform(Arc::new(SimulatedExecutor::new()));
        let unit = structure_unit(JobId::new(), UnitKind::Structure);
        let artifact = table
            .execute(&unit, Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap();
        match artifact {
            UnitArtifact::Structure(output) => assert_eq!(output.chapters.len(), 3),
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    #[tokio::test]
    async fn mismatched_input_is_fatal() {
        let table = ExecutorTable::uniform(Arc::new(SimulatedExecutor::new()));
        let unit = structure_unit(JobId::new(), UnitKind::Export);
        let err = table
            .execute(&unit, Deadline::after(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(err.code, UnitErrorCode::InvalidInput);
    }
}
