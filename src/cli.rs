//! CLI domain: parse, route, output, and presentation only.
//! No orchestration; the route table dispatches to the course engine and tracker.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, OutputFormat, PriorityArg};
pub use presentation::{
    format_events_json, format_events_text, format_jobs_text, format_report_json,
    format_report_text,
};
pub use route::RunContext;
