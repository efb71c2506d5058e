//! CLI presentation: text and json formatters for job reports, events and job lists.

use crate::job::Job;
use crate::tracker::{JobEvent, JobReport};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use serde::Serialize;
use serde_json::json;

/// snake_case label of a serde enum value.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "-".to_string(),
    }
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn format_report_text(report: &JobReport) -> String {
    let mut output = format!("Job: {}\n", report.job_id);
    output.push_str(&format!("Course: {}\n", report.course_id));
    output.push_str(&format!(
        "Phase: {} (round {}, admission {})\n",
        report.phase,
        report.round,
        label(&report.admission)
    ));
    output.push_str(&format!("Progress: {}%\n", report.progress_percent));
    if report.cancel_requested {
        output.push_str("Cancel requested: yes\n");
    }
    if let Some(detail) = &report.error_detail {
        output.push_str(&format!("Error: {} in {}: {}\n", detail.class, detail.phase, detail.message));
    }
    if !report.degraded_chapters.is_empty() {
        let list: Vec<String> = report.degraded_chapters.iter().map(|i| i.to_string()).collect();
        output.push_str(&format!("Degraded chapters: {}\n", list.join(", ")));
    }
    if let Some(export_ref) = &report.export_ref {
        output.push_str(&format!("Export: {}\n", export_ref.as_str()));
    }

    if !report.chapters.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["#", "Title", "State", "Generation", "Score"]);
        for chapter in &report.chapters {
            table.add_row(vec![
                chapter.chapter_index.to_string(),
                chapter.title.clone(),
                label(&chapter.state),
                or_dash(chapter.generation),
                or_dash(chapter.quality_score.map(|s| format!("{s:.2}"))),
            ]);
        }
        output.push_str(&format!("\nChapters:\n{table}\n"));
    }

    if !report.units.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Unit", "Kind", "Status", "Attempts", "Round", "Track", "Error"]);
        for unit in &report.units {
            let track = match &unit.track {
                crate::job::UnitTrack::Main => "main".to_string(),
                crate::job::UnitTrack::Regeneration(_) => "regeneration".to_string(),
            };
            table.add_row(vec![
                unit.unit_id.to_string(),
                unit.kind.to_string(),
                label(&unit.status),
                format!("{}/{}", unit.attempt_count, unit.max_attempts),
                unit.round.to_string(),
                track,
                or_dash(unit.last_error.map(|code| code.as_str())),
            ]);
        }
        output.push_str(&format!("\nUnits:\n{table}\n"));
    }

    if !report.regenerations.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Regeneration", "Chapter", "Status", "Stage"]);
        for regeneration in &report.regenerations {
            table.add_row(vec![
                regeneration.regeneration_id.to_string(),
                regeneration.chapter_index.to_string(),
                label(&regeneration.status),
                regeneration.stage.to_string(),
            ]);
        }
        output.push_str(&format!("\nRegenerations:\n{table}\n"));
    }
    output
}

pub fn format_report_json(report: &JobReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn format_events_text(events: &[JobEvent]) -> String {
    if events.is_empty() {
        return "No events recorded.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Seq", "Timestamp (ms)", "Type", "Data"]);
    for event in events {
        table.add_row(vec![
            event.seq.to_string(),
            event.ts_ms.to_string(),
            event.event_type.clone(),
            event.data.to_string(),
        ]);
    }
    table.to_string()
}

pub fn format_events_json(events: &[JobEvent]) -> String {
    let out = json!({ "events": events, "total": events.len() });
    serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
}

pub fn format_jobs_text(jobs: &[Job]) -> String {
    if jobs.is_empty() {
        return "No jobs found.\n\nUse 'coursegen run' to submit one.".to_string();
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Job", "Course", "Phase", "Progress", "Created"]);
    for job in jobs {
        table.add_row(vec![
            job.id.to_string(),
            job.course_id.clone(),
            job.phase.to_string(),
            format!("{}%", job.progress_percent),
            job.created_at.to_rfc3339(),
        ]);
    }
    format!("{table}\n\nTotal: {} job(s)", jobs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AdmissionState;
    use crate::types::CourseSpec;
    use chrono::Utc;

    #[test]
    fn report_text_lists_phase_and_progress() {
        let mut job = Job::new(CourseSpec::new("c-1", "Rust", 2), Default::default(), false, Utc::now());
        job.admission = AdmissionState::Active;
        job.progress_percent = 40;
        let report = JobReport::build(&job, &[], &[]);
        let text = format_report_text(&report);
        assert!(text.contains("Course: c-1"));
        assert!(text.contains("Progress: 40%"));
        assert!(text.contains("admission active"));
    }

    #[test]
    fn empty_job_list_has_hint() {
        assert!(format_jobs_text(&[]).contains("coursegen run"));
    }
}
