use std::time::Duration;

pub mod api;
pub mod config;
pub mod console;
pub mod diagnose;
pub mod history;
pub mod monitor;
pub mod store;
pub mod submit;
pub mod task;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

// Re-export for convenience
pub use api::{ApiError, CurriculumApi, HttpApi};
pub use config::{ConfigError, ConfigFile};
pub use console::{ConsoleEvent, UploadConsole};
pub use diagnose::{ContentSelection, DiagnoseError};
pub use history::{HistoryEvent, HistoryList};
pub use monitor::{MonitorEvent, MonitorHandle, MonitorSession, ProgressMonitor};
pub use store::{MemoryStore, ResumeRecord, ResumeStore, SqliteStore, StoreError};
pub use submit::{SubmitError, UploadFile, UploadForm, UploadRequest, UploadSource, ValidationError};
pub use task::{Liveness, PollTask};
pub use types::{
    ContentType, DiagnosticReport, HistoryEntry, JobId, JobStatus, JobUpdate, Stage,
};

/// Configuration for the upload client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the admin API, e.g. `https://learn.example.org`.
    pub api_base: String,
    pub api_token: Option<String>,
    pub organization_id: String,
    pub poll_interval_secs: u64,
    pub history_poll_interval_secs: u64,
    /// Page size for the upload history.
    pub history_limit: usize,
    /// Key prefix for the per-organization resumability record.
    pub storage_prefix: String,
    pub transformation_level: String,
    pub preserve_structure: bool,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_token: None,
            organization_id: String::new(),
            poll_interval_secs: 2,
            history_poll_interval_secs: 5,
            history_limit: 10,
            storage_prefix: "curriculum_upload_job_".to_string(),
            transformation_level: "moderate".to_string(),
            preserve_structure: true,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn history_poll_interval(&self) -> Duration {
        Duration::from_secs(self.history_poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Storage key of the resumability record for this organization.
    pub fn resume_key(&self) -> String {
        format!("{}{}", self.storage_prefix, self.organization_id)
    }

    /// Check the fields that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base.trim().is_empty() {
            return Err(ConfigError::Missing("api_base"));
        }
        if self.organization_id.trim().is_empty() {
            return Err(ConfigError::Missing("organization_id"));
        }
        Ok(())
    }
}
