//! CLI parse: clap types for coursegen. No behavior; definitions only.

use crate::types::Priority;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Coursegen CLI - course generation job orchestration
#[derive(Parser)]
#[command(name = "coursegen")]
#[command(about = "Run and inspect course generation jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a course and run it to completion against simulated executors
    Run {
        /// Course identifier
        #[arg(long, default_value = "demo-course")]
        course_id: String,
        /// Subject domain of the course
        #[arg(long, default_value = "Rust programming")]
        domain: String,
        /// Number of chapters
        #[arg(long, default_value = "5")]
        chapters: usize,
        /// Job priority
        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,
        /// Accept partial results on cancellation
        #[arg(long)]
        allow_partial: bool,
        /// Probability that a simulated attempt fails with a retryable error
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,
        /// Simulated latency per attempt in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,
        /// Regenerate this chapter after the job finishes
        #[arg(long)]
        regenerate: Option<usize>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show the status of a stored job
    Status {
        /// Job id
        job_id: String,
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show the event log of a stored job
    Events {
        /// Job id
        job_id: String,
        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        after: u64,
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List stored jobs
    Jobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    Urgent,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
            PriorityArg::Urgent => Priority::Urgent,
        }
    }
}
