//! Configuration System
//!
//! Layered engine configuration: built-in defaults, a global file, workspace files and
//! `COURSEGEN__` environment overrides, merged with the `config` crate and validated before use.

use crate::error::EngineError;
use crate::job::FanOut;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoursegenConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Orchestration limits, budgets and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of jobs holding a concurrency slot at once
    #[serde(default = "default_global_concurrency_limit")]
    pub global_concurrency_limit: usize,

    /// Maximum chapter units of one job running in parallel
    #[serde(default = "default_per_job_fanout_limit")]
    pub per_job_fanout_limit: usize,

    /// Number of concurrent executors in the worker pool
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_structure_time_budget_ms")]
    pub structure_time_budget_ms: u64,

    #[serde(default = "default_chapter_time_budget_ms")]
    pub chapter_time_budget_ms: u64,

    #[serde(default = "default_assessment_time_budget_ms")]
    pub assessment_time_budget_ms: u64,

    #[serde(default = "default_validation_time_budget_ms")]
    pub validation_time_budget_ms: u64,

    #[serde(default = "default_export_time_budget_ms")]
    pub export_time_budget_ms: u64,

    /// Attempts per unit, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_delay_ms")]
    pub backoff_base_delay_ms: u64,

    /// Ceiling on the exponential part of the backoff delay
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,

    /// Jitter as a fraction of the computed delay (0.0-1.0)
    #[serde(default = "default_backoff_jitter_ratio")]
    pub backoff_jitter_ratio: f64,

    /// Fraction of chapters allowed to fail in Content/Assessment before the job fails
    #[serde(default = "default_degraded_tolerance_fraction")]
    pub degraded_tolerance_fraction: f64,

    /// Minimum validator score for a chapter to pass
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Validation -> Content rework rounds before accepting a degraded course
    #[serde(default = "default_max_quality_rounds")]
    pub max_quality_rounds: u32,

    #[serde(default = "default_fanout")]
    pub assessment_fanout: FanOut,

    #[serde(default = "default_fanout")]
    pub validation_fanout: FanOut,

    #[serde(default = "default_max_chapters")]
    pub max_chapters: usize,

    /// Per-chapter SLA target used to derive a job deadline
    #[serde(default = "default_sla_target_ms")]
    pub sla_target_ms: u64,

    /// Units of jobs whose deadline falls inside this window get a priority boost
    #[serde(default = "default_sla_boost_window_ms")]
    pub sla_boost_window_ms: u64,

    #[serde(default)]
    pub allow_partial_on_cancel: bool,

    /// Upper bound on a worker's idle wait between queue notifications
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
}

fn default_global_concurrency_limit() -> usize {
    100
}

fn default_per_job_fanout_limit() -> usize {
    4
}

fn default_worker_count() -> usize {
    16
}

fn default_structure_time_budget_ms() -> u64 {
    60_000
}

fn default_chapter_time_budget_ms() -> u64 {
    120_000
}

fn default_assessment_time_budget_ms() -> u64 {
    120_000
}

fn default_validation_time_budget_ms() -> u64 {
    60_000
}

fn default_export_time_budget_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_delay_ms() -> u64 {
    60_000
}

fn default_backoff_max_delay_ms() -> u64 {
    900_000
}

fn default_backoff_jitter_ratio() -> f64 {
    0.1
}

fn default_degraded_tolerance_fraction() -> f64 {
    0.2
}

fn default_quality_threshold() -> f64 {
    0.7
}

fn default_max_quality_rounds() -> u32 {
    3
}

fn default_fanout() -> FanOut {
    FanOut::PerChapter
}

fn default_max_chapters() -> usize {
    50
}

fn default_sla_target_ms() -> u64 {
    120_000
}

fn default_sla_boost_window_ms() -> u64 {
    60_000
}

fn default_idle_poll_interval_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_concurrency_limit: default_global_concurrency_limit(),
            per_job_fanout_limit: default_per_job_fanout_limit(),
            worker_count: default_worker_count(),
            structure_time_budget_ms: default_structure_time_budget_ms(),
            chapter_time_budget_ms: default_chapter_time_budget_ms(),
            assessment_time_budget_ms: default_assessment_time_budget_ms(),
            validation_time_budget_ms: default_validation_time_budget_ms(),
            export_time_budget_ms: default_export_time_budget_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_delay_ms: default_backoff_base_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
            backoff_jitter_ratio: default_backoff_jitter_ratio(),
            degraded_tolerance_fraction: default_degraded_tolerance_fraction(),
            quality_threshold: default_quality_threshold(),
            max_quality_rounds: default_max_quality_rounds(),
            assessment_fanout: default_fanout(),
            validation_fanout: default_fanout(),
            max_chapters: default_max_chapters(),
            sla_target_ms: default_sla_target_ms(),
            sla_boost_window_ms: default_sla_boost_window_ms(),
            allow_partial_on_cancel: false,
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn backoff_base_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_base_delay_ms)
    }

    pub fn backoff_max_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_max_delay_ms)
    }

    pub fn sla_target(&self) -> Duration {
        Duration::from_millis(self.sla_target_ms)
    }

    pub fn sla_boost_window(&self) -> Duration {
        Duration::from_millis(self.sla_boost_window_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    /// Validate engine configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let nonzero = [
            ("global_concurrency_limit", self.global_concurrency_limit as u64),
            ("per_job_fanout_limit", self.per_job_fanout_limit as u64),
            ("worker_count", self.worker_count as u64),
            ("max_attempts", self.max_attempts as u64),
            ("max_chapters", self.max_chapters as u64),
            ("structure_time_budget_ms", self.structure_time_budget_ms),
            ("chapter_time_budget_ms", self.chapter_time_budget_ms),
            ("assessment_time_budget_ms", self.assessment_time_budget_ms),
            ("validation_time_budget_ms", self.validation_time_budget_ms),
            ("export_time_budget_ms", self.export_time_budget_ms),
            ("idle_poll_interval_ms", self.idle_poll_interval_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                errors.push(ValidationError::Engine(field.to_string(), "must be greater than 0".to_string()));
            }
        }

        let fractions = [
            ("degraded_tolerance_fraction", self.degraded_tolerance_fraction),
            ("quality_threshold", self.quality_threshold),
            ("backoff_jitter_ratio", self.backoff_jitter_ratio),
        ];
        for (field, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                errors.push(ValidationError::Engine(
                    field.to_string(),
                    format!("must be within [0, 1], got {value}"),
                ));
            }
        }

        if self.backoff_max_delay_ms < self.backoff_base_delay_ms {
            errors.push(ValidationError::Engine(
                "backoff_max_delay_ms".to_string(),
                "must not be smaller than backoff_base_delay_ms".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sled,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Sled database directory; resolved under the user data dir when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sled
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

impl StorageConfig {
    /// Resolve the sled directory: explicit path, else `<data_dir>/coursegen/store`.
    pub fn resolved_path(&self) -> Result<PathBuf, EngineError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        directories::ProjectDirs::from("", "", "coursegen")
            .map(|dirs| dirs.data_dir().join("store"))
            .ok_or_else(|| {
                EngineError::ConfigError("Unable to determine a data directory for the store".to_string())
            })
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Engine(String, String),
    Storage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Engine(field, msg) => write!(f, "engine.{}: {}", field, msg),
            ValidationError::Storage(msg) => write!(f, "storage: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CoursegenConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = match self.engine.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        };

        if let Some(path) = &self.storage.path {
            if path.as_os_str().is_empty() {
                errors.push(ValidationError::Storage("path cannot be empty".to_string()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold all errors into one `EngineError`.
    pub fn validated(self) -> Result<Self, EngineError> {
        self.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            EngineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Serializes HOME / COURSEGEN_* mutations across tests in this module
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = CoursegenConfig::default();
        assert_eq!(config.engine.global_concurrency_limit, 100);
        assert_eq!(config.engine.chapter_time_budget_ms, 120_000);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.backoff_base_delay_ms, 60_000);
        assert!((config.engine.degraded_tolerance_fraction - 0.2).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CoursegenConfig::default();
        config.engine.max_attempts = 0;
        config.engine.degraded_tolerance_fraction = 1.5;
        config.engine.backoff_max_delay_ms = 10;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.to_string().contains("max_attempts")));
    }

    #[test]
    fn test_load_from_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("engine.toml");
        std::fs::write(
            &config_file,
            r#"
[engine]
global_concurrency_limit = 10
max_attempts = 5
validation_fanout = "single"

[storage]
backend = "memory"
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(&config_file).unwrap();
        assert_eq!(config.engine.global_concurrency_limit, 10);
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.engine.validation_fanout, FanOut::Single);
        // untouched fields keep their defaults
        assert_eq!(config.engine.chapter_time_budget_ms, 120_000);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_workspace_config_and_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let temp_dir = TempDir::new().unwrap();
        let workspace_root = temp_dir.path();
        let original_home = std::env::var("HOME").ok();
        std::env::set_var("HOME", workspace_root.join("no_home"));

        let config_dir = workspace_root.join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[engine]\nper_job_fanout_limit = 2\nworker_count = 8\n",
        )
        .unwrap();
        std::env::set_var("COURSEGEN__ENGINE__WORKER_COUNT", "3");

        let config = ConfigLoader::load(workspace_root).unwrap();
        assert_eq!(config.engine.per_job_fanout_limit, 2);
        assert_eq!(config.engine.worker_count, 3);

        std::env::remove_var("COURSEGEN__ENGINE__WORKER_COUNT");
        match original_home {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
    }

    #[test]
    fn test_default_config_serializes_to_toml() {
        let rendered = toml::to_string_pretty(&CoursegenConfig::default()).unwrap();
        assert!(rendered.contains("global_concurrency_limit = 100"));
    }
}
