//! Error types for the course-generation engine.

use crate::types::{JobId, RegenerationId, UnitId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}

/// Engine-level errors returned by the public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("Regeneration not found: {0}")]
    RegenerationNotFound(RegenerationId),

    #[error("Invalid course spec: {0}")]
    InvalidCourseSpec(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Chapter {chapter_index} is not addressable in job {job_id}")]
    ChapterNotAddressable { job_id: JobId, chapter_index: usize },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job {0} has reached a terminal phase")]
    JobFinalized(JobId),

    #[error("Work queue is closed")]
    QueueClosed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

/// Retry eligibility of a unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Retryable,
    Fatal,
}

/// What went wrong during one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitErrorCode {
    Timeout,
    ProviderUnavailable,
    RateLimited,
    MalformedOutput,
    InvalidInput,
    EncoderFailure,
    Cancelled,
}

impl UnitErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitErrorCode::Timeout => "timeout",
            UnitErrorCode::ProviderUnavailable => "provider_unavailable",
            UnitErrorCode::RateLimited => "rate_limited",
            UnitErrorCode::MalformedOutput => "malformed_output",
            UnitErrorCode::InvalidInput => "invalid_input",
            UnitErrorCode::EncoderFailure => "encoder_failure",
            UnitErrorCode::Cancelled => "cancelled",
        }
    }
}

/// Structured failure returned by an executor. The kind alone decides retry eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{} {}: {message}", kind_label(.kind), .code.as_str())]
pub struct UnitError {
    pub kind: ErrorKind,
    pub code: UnitErrorCode,
    pub message: String,
}

fn kind_label(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Retryable => "retryable",
        ErrorKind::Fatal => "fatal",
    }
}

impl UnitError {
    pub fn retryable(code: UnitErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            code,
            message: message.into(),
        }
    }

    pub fn fatal(code: UnitErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            code,
            message: message.into(),
        }
    }

    pub fn timeout(budget_ms: u128) -> Self {
        Self::retryable(
            UnitErrorCode::Timeout,
            format!("attempt exceeded time budget of {budget_ms}ms"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Retryable
    }
}

/// Classification surfaced on a job. Raw executor messages never leave the unit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RetriesExhausted,
    Fatal,
    QualityBelowThreshold,
    ToleranceExceeded,
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::RetriesExhausted => "retries_exhausted",
            ErrorClass::Fatal => "fatal",
            ErrorClass::QualityBelowThreshold => "quality_below_threshold",
            ErrorClass::ToleranceExceeded => "tolerance_exceeded",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl ErrorClass {
    /// Class a job-level failure by the unit error that ended it.
    pub fn from_unit_error(error: &UnitError) -> Self {
        match (error.kind, error.code) {
            (_, UnitErrorCode::Cancelled) => ErrorClass::Cancelled,
            (ErrorKind::Retryable, _) => ErrorClass::RetriesExhausted,
            (ErrorKind::Fatal, _) => ErrorClass::Fatal,
        }
    }
}
