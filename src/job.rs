//! Job and Unit records
//!
//! The persisted state the orchestrator, worker pool and progress tracker share. Jobs hold
//! the per-course pipeline state; units are the schedulable pieces of work inside a phase.

pub mod phase;
pub mod record;
pub mod unit;

pub use phase::{FanOut, PhaseDefinition, PhasePlan, TolerancePolicy};
pub use record::{AdmissionState, ChapterOutline, ChapterSlot, ErrorDetail, Job, Phase};
pub use unit::{Unit, UnitArtifact, UnitClass, UnitInput, UnitKind, UnitStatus, UnitTrack};
