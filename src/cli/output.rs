//! CLI output: error mapping from engine errors to the CLI surface.

use crate::error::EngineError;

/// Map engine errors to a user-facing line. Record-level errors get a hint.
pub fn map_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<EngineError>() {
        Some(EngineError::JobNotFound(id)) => {
            format!("Job not found: {id}\n\nUse 'coursegen jobs' to list stored jobs.")
        }
        Some(EngineError::ConfigError(msg)) => format!("Configuration error: {msg}"),
        _ => format!("{e:#}"),
    }
}
