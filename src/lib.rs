//! Coursegen: Course Generation Job Orchestration
//!
//! Drives course generation jobs through structure, content, assessment, validation and
//! export phases on a shared worker pool, with retries, quality rework, per-chapter
//! regeneration and persisted progress.

pub mod admission;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod regeneration;
pub mod retry;
pub mod tracker;
pub mod types;

pub use engine::{CourseEngine, EngineBuilder};
pub use error::{EngineError, ErrorClass, UnitError, UnitErrorCode};
pub use job::{Job, Phase};
pub use tracker::{JobEvent, JobReport};
pub use types::{CourseSpec, JobId, Priority, SubmitOptions, UnitId};
