//! CLI route: single route table and run context. Dispatches to the engine and presentation.

use crate::cli::parse::{Commands, OutputFormat};
use crate::cli::presentation::{
    format_events_json, format_events_text, format_jobs_text, format_report_json,
    format_report_text,
};
use crate::config::{ConfigLoader, CoursegenConfig};
use crate::engine::{open_store, CourseEngine};
use crate::executor::{ExecutorTable, SimulatedExecutor};
use crate::job::PhasePlan;
use crate::regeneration::RegenerationStatus;
use crate::tracker::{JobReport, ProgressTracker};
use crate::types::{CourseSpec, JobId, SubmitOptions};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Runtime context for CLI execution: workspace and loaded configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: CoursegenConfig,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self> {
        let config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?,
            None => ConfigLoader::load(&workspace_root).context("failed to load configuration")?,
        };
        let config = config.validated()?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn workspace_root(&self) -> &PathBuf {
        &self.workspace_root
    }

    pub fn config(&self) -> &CoursegenConfig {
        &self.config
    }

    pub async fn execute(&self, command: &Commands) -> Result<String> {
        match command {
            Commands::Run {
                course_id,
                domain,
                chapters,
                priority,
                allow_partial,
                failure_rate,
                latency_ms,
                regenerate,
                timeout_secs,
                format,
            } => {
                let executor = SimulatedExecutor::new()
                    .with_latency(Duration::from_millis(*latency_ms))
                    .with_failure_rate(*failure_rate);
                let engine = CourseEngine::open(&self.config, ExecutorTable::uniform(Arc::new(executor)))?;
                let result = self
                    .run_course(
                        &engine,
                        CourseSpec::new(course_id.as_str(), domain.as_str(), *chapters),
                        SubmitOptions {
                            priority: (*priority).into(),
                            allow_partial: Some(*allow_partial),
                        },
                        *regenerate,
                        Duration::from_secs(*timeout_secs),
                    )
                    .await;
                engine.shutdown().await?;
                let report = result?;
                Ok(render_report(&report, *format))
            }
            Commands::Status { job_id, format } => {
                let tracker = self.open_tracker()?;
                let report = tracker.report(&parse_job_id(job_id)?)?;
                Ok(render_report(&report, *format))
            }
            Commands::Events {
                job_id,
                after,
                format,
            } => {
                let tracker = self.open_tracker()?;
                let events = tracker.events(&parse_job_id(job_id)?, *after)?;
                Ok(match format {
                    OutputFormat::Text => format_events_text(&events),
                    OutputFormat::Json => format_events_json(&events),
                })
            }
            Commands::Jobs => {
                let tracker = self.open_tracker()?;
                let mut jobs = tracker.list_jobs()?;
                jobs.sort_by_key(|job| job.created_at);
                Ok(format_jobs_text(&jobs))
            }
        }
    }

    async fn run_course(
        &self,
        engine: &CourseEngine,
        spec: CourseSpec,
        options: SubmitOptions,
        regenerate: Option<usize>,
        timeout: Duration,
    ) -> Result<JobReport> {
        let deadline = Instant::now() + timeout;
        let job_id = engine.submit(spec, options).await?;
        info!(job_id = %job_id, "Job submitted");
        let report = engine.wait_for_terminal(&job_id, timeout).await?;

        let Some(chapter_index) = regenerate else {
            return Ok(report);
        };
        engine
            .request_regeneration(&job_id, chapter_index, "requested from the command line")
            .await?;
        loop {
            let report = engine.status(&job_id)?;
            if report
                .regenerations
                .iter()
                .all(|r| r.status != RegenerationStatus::Running)
            {
                return Ok(report);
            }
            if Instant::now() >= deadline {
                bail!("regeneration of chapter {chapter_index} did not finish in time");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn open_tracker(&self) -> Result<ProgressTracker> {
        let store = open_store(&self.config.storage)?;
        Ok(ProgressTracker::new(store, PhasePlan::from_config(&self.config.engine)))
    }
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    JobId::parse(raw).with_context(|| format!("invalid job id '{raw}'"))
}

fn render_report(report: &JobReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => format_report_text(report),
        OutputFormat::Json => format_report_json(report),
    }
}
