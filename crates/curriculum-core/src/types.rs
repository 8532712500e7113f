//! Job, history and diagnostic types shared by every component.
//!
//! The backend reports job state as loosely typed JSON. [`StatusPayload`] mirrors
//! that wire shape and is converted into [`JobUpdate`] as soon as it is received,
//! so monitoring code never inspects raw optional fields.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Opaque job identifier assigned by the backend on submission.
///
/// Accepted from the wire as either a JSON string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawId::deserialize(deserializer).map(|raw| JobId(raw.into_string()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

fn opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?.map(RawId::into_string))
}

fn opt_percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u8>, D::Error> {
    Ok(percent(Option::<f64>::deserialize(deserializer)?))
}

/// Clamp a reported percentage into `0..=100`.
fn percent(value: Option<f64>) -> Option<u8> {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 100.0).round() as u8)
}

/// Backend job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    ReadyForReview,
    Approved,
    Error,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::ReadyForReview => "Ready for review",
            Self::Approved => "Approved",
            Self::Error => "Error",
            Self::Rejected => "Rejected",
            Self::Unknown => "Unknown",
        }
    }

    /// `approved` and `error` end a monitoring session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Error)
    }
}

/// Pipeline stage labels reported by the backend (display only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Parse,
    Structure,
    Align,
    Generate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Parse, Stage::Structure, Stage::Align, Stage::Generate];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "parse" => Some(Self::Parse),
            "structure" => Some(Self::Structure),
            "align" => Some(Self::Align),
            "generate" => Some(Self::Generate),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Parse => "Parsing",
            Self::Structure => "Structuring",
            Self::Align => "Aligning",
            Self::Generate => "Generating",
        }
    }
}

/// Status response of `GET /upload/{id}/status`, as sent by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, rename = "currentStage")]
    pub current_stage: Option<String>,
    #[serde(default, rename = "currentItem")]
    pub current_item: Option<String>,
    #[serde(default)]
    pub stages: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub course_id: Option<String>,
}

/// One observation of a job's state, converted from [`StatusPayload`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Processing {
        progress: u8,
        stage: Option<Stage>,
        item: Option<String>,
        completed_stages: BTreeSet<Stage>,
    },
    Approved {
        course_id: Option<String>,
        progress: Option<u8>,
    },
    Failed {
        detail: String,
    },
    /// `pending`, `ready_for_review`, `rejected` or an unrecognized status.
    Waiting {
        status: JobStatus,
        progress: Option<u8>,
    },
}

impl JobUpdate {
    pub fn processing(progress: u8) -> Self {
        Self::Processing {
            progress,
            stage: None,
            item: None,
            completed_stages: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Processing { .. } => JobStatus::Processing,
            Self::Approved { .. } => JobStatus::Approved,
            Self::Failed { .. } => JobStatus::Error,
            Self::Waiting { status, .. } => *status,
        }
    }

    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::Processing { progress, .. } => Some(*progress),
            Self::Approved { progress, .. } | Self::Waiting { progress, .. } => *progress,
            Self::Failed { .. } => None,
        }
    }
}

impl From<StatusPayload> for JobUpdate {
    fn from(payload: StatusPayload) -> Self {
        let progress = percent(payload.progress);
        match payload.status {
            JobStatus::Processing => JobUpdate::Processing {
                progress: progress.unwrap_or(0),
                stage: payload.current_stage.as_deref().and_then(Stage::parse),
                item: payload.current_item.filter(|s| !s.trim().is_empty()),
                completed_stages: payload
                    .stages
                    .as_ref()
                    .map(completed_stages)
                    .unwrap_or_default(),
            },
            JobStatus::Approved => JobUpdate::Approved {
                course_id: payload.course_id,
                progress,
            },
            JobStatus::Error => JobUpdate::Failed {
                detail: payload
                    .error
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            },
            status => {
                if status == JobStatus::Unknown {
                    log::warn!("Unrecognized job status in status response");
                }
                JobUpdate::Waiting { status, progress }
            }
        }
    }
}

/// Extract the completed pipeline stages from the `stages` field.
///
/// Accepts either an array of stage names or an object keyed by stage name whose
/// values are `true`, a completion word, or an object with a `status`/`complete`
/// member.
fn completed_stages(value: &Value) -> BTreeSet<Stage> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(Stage::parse)
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| stage_marked_complete(v))
            .filter_map(|(k, _)| Stage::parse(k))
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn stage_marked_complete(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(
            s.to_ascii_lowercase().as_str(),
            "complete" | "completed" | "done"
        ),
        Value::Object(map) => {
            map.get("complete").is_some_and(stage_marked_complete)
                || map.get("completed").is_some_and(stage_marked_complete)
                || map.get("status").is_some_and(stage_marked_complete)
        }
        _ => false,
    }
}

/// Content categories found in a container archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Assignments,
    Pages,
    Discussions,
    Quizzes,
}

impl ContentType {
    pub const ALL: [ContentType; 4] = [
        ContentType::Assignments,
        ContentType::Pages,
        ContentType::Discussions,
        ContentType::Quizzes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assignments => "assignments",
            Self::Pages => "pages",
            Self::Discussions => "discussions",
            Self::Quizzes => "quizzes",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Assignments => "Assignments",
            Self::Pages => "Pages",
            Self::Discussions => "Discussions",
            Self::Quizzes => "Quizzes",
        }
    }
}

/// Items of one category discovered by the diagnostic pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawResourceCount")]
pub struct ResourceCount {
    pub found: u32,
    /// Whether the backend can already extract this category.
    pub extractable: bool,
}

#[derive(Deserialize)]
struct RawResourceCount {
    #[serde(default)]
    found: u32,
    #[serde(default)]
    extracted: Option<Flag>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Count(f64),
}

impl From<RawResourceCount> for ResourceCount {
    fn from(raw: RawResourceCount) -> Self {
        let extractable = match raw.extracted {
            Some(Flag::Bool(b)) => b,
            Some(Flag::Count(n)) => n > 0.0,
            None => false,
        };
        Self {
            found: raw.found,
            extractable,
        }
    }
}

/// Result of `POST /diagnose` for a container archive.
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticReport {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub course_title: Option<String>,
    #[serde(default)]
    pub total_files: u32,
    /// Predicted share of usable content, in percent.
    #[serde(default)]
    pub coverage_estimate: f64,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceCount>,
    #[serde(default)]
    pub modules_found: u32,
    #[serde(default)]
    pub assignment_refs_found: u32,
    #[serde(default)]
    pub page_refs_found: u32,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl DiagnosticReport {
    pub fn resource(&self, content_type: ContentType) -> ResourceCount {
        self.resources
            .iter()
            .find(|(k, _)| ContentType::parse(k) == Some(content_type))
            .map(|(_, v)| *v)
            .unwrap_or_default()
    }
}

/// One row of the organization's upload history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryEntry {
    pub id: JobId,
    #[serde(default)]
    pub original_filename: Option<String>,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "opt_percent")]
    pub progress_percent: Option<u8>,
    #[serde(default)]
    pub uploaded_at: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub created_course_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl HistoryEntry {
    pub fn display_name(&self) -> &str {
        self.original_filename
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("(pasted text)")
    }

    pub fn progress(&self) -> u8 {
        self.progress_percent.unwrap_or(0)
    }

    pub fn is_processing(&self) -> bool {
        self.status == JobStatus::Processing
    }

    /// Raw backend error text, only for rows in the `error` state.
    pub fn error_detail(&self) -> Option<&str> {
        if self.status != JobStatus::Error {
            return None;
        }
        Some(
            self.error_message
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or("Unknown error"),
        )
    }

    /// Whether a fresh status observation differs from what this row shows.
    pub fn differs_from(&self, update: &JobUpdate) -> bool {
        if update.status() != self.status {
            return true;
        }
        match update.progress() {
            Some(p) => p != self.progress(),
            None => false,
        }
    }
}
