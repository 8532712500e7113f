use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Local};
use curriculum_core::diagnose::ContentSelection;
use curriculum_core::{
    ContentType, DiagnosticReport, HistoryEntry, JobId, JobStatus, JobUpdate, MonitorEvent, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Stream};

/// How a followed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Failed,
    Settled,
    Detached,
}

/// Progress bar for the primary job.
pub struct JobProgress {
    bar: ProgressBar,
}

impl JobProgress {
    pub fn new(job_id: &JobId) -> Self {
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        let bar = ProgressBar::new(100).with_style(style);
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!("job {} queued", job_id));
        Self { bar }
    }

    /// Render one monitor event. Returns the outcome once the job has finished.
    pub fn update(&self, event: &MonitorEvent) -> Option<Outcome> {
        match event {
            MonitorEvent::Progress {
                progress,
                stage,
                item,
                completed_stages,
                ..
            } => {
                self.bar.set_position(u64::from(*progress));
                self.bar
                    .set_message(progress_message(*stage, item.as_deref(), completed_stages));
                None
            }
            MonitorEvent::StatusChanged { status, .. } => {
                self.bar.set_message(status.label().to_string());
                None
            }
            MonitorEvent::Succeeded { job_id, course_id } => {
                self.bar.finish_and_clear();
                let course = course_id.as_deref().unwrap_or("unknown");
                println!(
                    "{} Curriculum job {} approved. Course {} is ready.",
                    "✓".if_supports_color(Stream::Stdout, |t| t.green()),
                    job_id,
                    course.if_supports_color(Stream::Stdout, |t| t.bold())
                );
                Some(Outcome::Approved)
            }
            MonitorEvent::Failed { job_id, detail } => {
                self.bar.abandon();
                eprintln!(
                    "{} Curriculum job {} failed:",
                    "✗".if_supports_color(Stream::Stderr, |t| t.red()),
                    job_id
                );
                eprintln!("{}", detail.if_supports_color(Stream::Stderr, |t| t.dimmed()));
                Some(Outcome::Failed)
            }
            MonitorEvent::Settled { job_id, status } => {
                self.bar.finish_and_clear();
                println!(
                    "Curriculum job {} is now {}; nothing left to follow.",
                    job_id,
                    status.label().if_supports_color(Stream::Stdout, |t| t.yellow())
                );
                Some(Outcome::Settled)
            }
        }
    }

    pub fn detach(&self, job_id: &JobId) {
        self.bar.abandon_with_message(format!("detached from job {}", job_id));
    }
}

fn progress_message(stage: Option<Stage>, item: Option<&str>, completed: &BTreeSet<Stage>) -> String {
    let stages: Vec<String> = Stage::ALL
        .iter()
        .map(|s| {
            if completed.contains(s) {
                format!("✓{}", s.label())
            } else if Some(*s) == stage {
                format!("▸{}", s.label())
            } else {
                format!("·{}", s.label())
            }
        })
        .collect();
    match item {
        Some(item) => format!("{}  {}", stages.join(" "), item),
        None => stages.join(" "),
    }
}

pub fn print_started(job_id: &JobId) {
    println!(
        "Started curriculum job {}",
        job_id.if_supports_color(Stream::Stdout, |t| t.bold())
    );
}

pub fn print_status(job_id: &JobId, update: &JobUpdate) {
    let status = update.status();
    let progress = update
        .progress()
        .map(|p| format!("{p}%"))
        .unwrap_or_else(|| "-".to_string());
    println!("{}  {}  {}", job_id, colored_status(status), progress);
    match update {
        JobUpdate::Processing {
            stage,
            item,
            completed_stages,
            ..
        } => println!("  {}", progress_message(*stage, item.as_deref(), completed_stages)),
        JobUpdate::Approved {
            course_id: Some(course),
            ..
        } => println!("  course {}", course),
        JobUpdate::Failed { detail } => println!("  {}", detail),
        _ => {}
    }
}

pub fn print_history(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("No uploads yet.");
        return;
    }
    println!(
        "{:<10} {:<32} {:<18} {:>5}  {:<16}  {}",
        "ID", "SOURCE", "STATUS", "PROG", "UPLOADED", "RESULT"
    );
    for entry in entries {
        let result = match (entry.error_detail(), &entry.created_course_id) {
            (Some(detail), _) => first_line(detail).to_string(),
            (None, Some(course)) => format!("course {}", course),
            (None, None) => String::new(),
        };
        println!(
            "{:<10} {:<32} {:<18} {:>4}%  {:<16}  {}",
            entry.id.as_str(),
            truncate(entry.display_name(), 32),
            colored_status(entry.status),
            entry.progress(),
            entry.uploaded_at.as_deref().map(format_timestamp).unwrap_or_default(),
            result
        );
    }
}

pub fn print_report(report: &DiagnosticReport, selection: &ContentSelection) {
    println!(
        "{}",
        report
            .course_title
            .as_deref()
            .unwrap_or("Untitled course")
            .if_supports_color(Stream::Stdout, |t| t.bold())
    );
    println!(
        "  {} files, {:.0}% estimated coverage",
        report.total_files, report.coverage_estimate
    );
    println!(
        "  {} modules, {} assignment references, {} page references",
        report.modules_found, report.assignment_refs_found, report.page_refs_found
    );
    for content_type in ContentType::ALL {
        let state = selection.state(content_type);
        let resource = report.resource(content_type);
        let mark = match (state.is_enabled(), state.checked) {
            (false, _) => "[-]",
            (true, true) => "[x]",
            (true, false) => "[ ]",
        };
        let support = if resource.extractable {
            "extractable now"
        } else {
            "not yet supported"
        };
        println!(
            "  {} {:<12} {:>4} found, {}",
            mark,
            content_type.label(),
            resource.found,
            support
        );
    }
}

fn colored_status(status: JobStatus) -> String {
    let label = format!("{:<18}", status.label());
    match status {
        JobStatus::Approved => label.if_supports_color(Stream::Stdout, |t| t.green()).to_string(),
        JobStatus::Error | JobStatus::Rejected => {
            label.if_supports_color(Stream::Stdout, |t| t.red()).to_string()
        }
        JobStatus::Processing | JobStatus::Pending => {
            label.if_supports_color(Stream::Stdout, |t| t.cyan()).to_string()
        }
        JobStatus::ReadyForReview | JobStatus::Unknown => {
            label.if_supports_color(Stream::Stdout, |t| t.yellow()).to_string()
        }
    }
}

/// Render an RFC 3339 timestamp in local time, or return it unchanged.
fn format_timestamp(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
