//! Append-only job event log schema.

use crate::types::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    JobSubmitted,
    JobAdmitted,
    PhaseStarted,
    UnitEnqueued,
    UnitStarted,
    UnitRetryScheduled,
    UnitSucceeded,
    UnitFailed,
    UnitAborted,
    ChapterTolerated,
    QualityReworkStarted,
    RegenerationRequested,
    RegenerationCompleted,
    RegenerationFailed,
    CancelRequested,
    JobFinished,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobSubmitted => "job_submitted",
            EventType::JobAdmitted => "job_admitted",
            EventType::PhaseStarted => "phase_started",
            EventType::UnitEnqueued => "unit_enqueued",
            EventType::UnitStarted => "unit_started",
            EventType::UnitRetryScheduled => "unit_retry_scheduled",
            EventType::UnitSucceeded => "unit_succeeded",
            EventType::UnitFailed => "unit_failed",
            EventType::UnitAborted => "unit_aborted",
            EventType::ChapterTolerated => "chapter_tolerated",
            EventType::QualityReworkStarted => "quality_rework_started",
            EventType::RegenerationRequested => "regeneration_requested",
            EventType::RegenerationCompleted => "regeneration_completed",
            EventType::RegenerationFailed => "regeneration_failed",
            EventType::CancelRequested => "cancel_requested",
            EventType::JobFinished => "job_finished",
        }
    }
}

/// One entry in a job's event log. `seq` starts at 1 and strictly increases per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl JobEvent {
    pub fn new(job_id: JobId, seq: u64, event_type: EventType, data: Value) -> Self {
        Self {
            job_id,
            seq,
            ts_ms: now_millis(),
            event_type: event_type.as_str().to_string(),
            data,
        }
    }

    pub fn is(&self, event_type: EventType) -> bool {
        self.event_type == event_type.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitEventData {
    pub unit_id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regeneration_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEventData {
    pub phase: String,
    pub round: u32,
    pub units: usize,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
