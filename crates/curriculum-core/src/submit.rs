//! Upload form, client-side validation and submission.
//!
//! Validation runs entirely before the network call; a rejected form is left
//! untouched so the user can fix it and retry. Only [`UploadForm::reset`] clears it.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::Config;
use crate::api::{ApiError, CurriculumApi};
use crate::diagnose::ContentSelection;
use crate::store::{ResumeRecord, ResumeStore};
use crate::types::{ContentType, JobId};

/// File extensions the backend pipeline accepts.
pub const ACCEPTED_EXTENSIONS: [&str; 5] = [".imscc", ".zip", ".pdf", ".docx", ".doc"];

/// Container archives, the only files the diagnostic pass understands.
pub const CONTAINER_EXTENSIONS: [&str; 2] = [".imscc", ".zip"];

/// Upload size limit (100 MB).
pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Shown when the backend rejects a submission without a message.
pub const SUBMIT_FALLBACK_MESSAGE: &str = "Failed to start curriculum processing.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unsupported file type \"{file_name}\". Accepted formats: .imscc, .zip, .pdf, .docx, .doc")]
    UnsupportedType { file_name: String },
    #[error("File is too large ({size_mb:.1}MB). Maximum size is 100MB.")]
    TooLarge { size: u64, size_mb: f64 },
    #[error("Please paste some curriculum text before submitting.")]
    EmptyText,
    #[error("Select a file or paste text to upload.")]
    NoInput,
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(#[from] ValidationError),
    /// The backend refused the job; `message` is its own text when it sent one.
    #[error("{message}")]
    Rejected {
        message: String,
        #[source]
        source: ApiError,
    },
}

impl SubmitError {
    fn from_api(err: ApiError) -> Self {
        let message = err
            .backend_message()
            .map(str::to_string)
            .unwrap_or_else(|| SUBMIT_FALLBACK_MESSAGE.to_string());
        SubmitError::Rejected {
            message,
            source: err,
        }
    }
}

/// A local file selected for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

impl UploadFile {
    pub fn new(path: impl Into<PathBuf>, file_name: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            file_name: file_name.into(),
            size,
        }
    }

    /// Describe the file at `path`, reading its size from the filesystem.
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            path,
            file_name,
            size,
        })
    }

    /// Lowercased extension including the dot, e.g. `.pdf`.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.file_name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(format!(".{}", ext.to_ascii_lowercase()))
    }

    pub fn is_container(&self) -> bool {
        self.extension()
            .is_some_and(|ext| CONTAINER_EXTENSIONS.contains(&ext.as_str()))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let accepted = self
            .extension()
            .is_some_and(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()));
        if !accepted {
            return Err(ValidationError::UnsupportedType {
                file_name: self.file_name.clone(),
            });
        }
        if self.size > MAX_UPLOAD_BYTES {
            return Err(ValidationError::TooLarge {
                size: self.size,
                size_mb: megabytes(self.size),
            });
        }
        Ok(())
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// What is being uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    File(UploadFile),
    Text(String),
}

/// A validated submission, ready for the start endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub source: UploadSource,
    pub title: Option<String>,
    pub learning_objectives: Vec<String>,
    /// Only present for container archives.
    pub content_types: Option<Vec<ContentType>>,
    pub transformation_level: String,
    pub preserve_structure: bool,
    pub organization_id: String,
}

impl UploadRequest {
    /// Objectives as the backend expects them: one per line.
    pub fn learning_objectives_text(&self) -> Option<String> {
        if self.learning_objectives.is_empty() {
            None
        } else {
            Some(self.learning_objectives.join("\n"))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputMode {
    #[default]
    File,
    Text,
}

/// Form state of the upload screen.
#[derive(Debug, Clone, Default)]
pub struct UploadForm {
    pub mode: InputMode,
    pub file: Option<UploadFile>,
    pub text: String,
    pub title: String,
    /// Free text, one objective per line.
    pub learning_objectives: String,
    /// Set by the diagnostic pass; `None` means the default categories.
    pub content_selection: Option<ContentSelection>,
}

impl UploadForm {
    pub fn for_file(file: UploadFile) -> Self {
        Self {
            mode: InputMode::File,
            file: Some(file),
            ..Self::default()
        }
    }

    pub fn for_text(text: impl Into<String>) -> Self {
        Self {
            mode: InputMode::Text,
            text: text.into(),
            ..Self::default()
        }
    }

    /// Choose a different file. Any diagnostic selection belonged to the old one.
    pub fn select_file(&mut self, file: UploadFile) {
        self.mode = InputMode::File;
        self.file = Some(file);
        self.content_selection = None;
    }

    /// Non-blank objective lines; each becomes one course project on the backend.
    pub fn objectives(&self) -> Vec<String> {
        self.learning_objectives
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn objective_count(&self) -> usize {
        self.objectives().len()
    }

    /// Categories to submit; only container archives carry a selection.
    pub fn content_types(&self) -> Option<Vec<ContentType>> {
        match (&self.mode, &self.file) {
            (InputMode::File, Some(file)) if file.is_container() => Some(
                self.content_selection
                    .clone()
                    .unwrap_or_default()
                    .selected(),
            ),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<UploadSource, ValidationError> {
        match self.mode {
            InputMode::File => {
                let file = self.file.as_ref().ok_or(ValidationError::NoInput)?;
                file.validate()?;
                Ok(UploadSource::File(file.clone()))
            }
            InputMode::Text => {
                if self.text.trim().is_empty() {
                    return Err(ValidationError::EmptyText);
                }
                Ok(UploadSource::Text(self.text.clone()))
            }
        }
    }

    pub fn to_request(&self, config: &Config) -> Result<UploadRequest, ValidationError> {
        let source = self.validate()?;
        let title = Some(self.title.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(UploadRequest {
            source,
            title,
            learning_objectives: self.objectives(),
            content_types: self.content_types(),
            transformation_level: config.transformation_level.clone(),
            preserve_structure: config.preserve_structure,
            organization_id: config.organization_id.clone(),
        })
    }

    /// Explicit, user-initiated reset of every field.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Validates a form, starts the job and records it for resumption.
pub struct SubmissionController<A, S: ?Sized> {
    api: Arc<A>,
    record: ResumeRecord<S>,
    config: Arc<Config>,
}

impl<A: CurriculumApi, S: ResumeStore + ?Sized> SubmissionController<A, S> {
    pub fn new(api: Arc<A>, record: ResumeRecord<S>, config: Arc<Config>) -> Self {
        Self {
            api,
            record,
            config,
        }
    }

    /// Submit `form`. Issues exactly one network call when the form is valid, none otherwise.
    pub async fn submit(&self, form: &UploadForm) -> Result<JobId, SubmitError> {
        let request = form.to_request(&self.config)?;
        match &request.source {
            UploadSource::File(file) => log::info!(
                "Submitting {} ({:.1}MB) for organization {}",
                file.file_name,
                megabytes(file.size),
                request.organization_id
            ),
            UploadSource::Text(text) => log::info!(
                "Submitting {} characters of pasted text for organization {}",
                text.chars().count(),
                request.organization_id
            ),
        }

        let job_id = self
            .api
            .start_upload(&request)
            .await
            .map_err(SubmitError::from_api)?;

        // The job is running server-side either way; losing the record only costs resumability.
        if let Err(e) = self.record.save(&job_id) {
            log::warn!("Could not persist resumability record for job {}: {}", job_id, e);
        }
        log::info!("Curriculum job {} started", job_id);
        Ok(job_id)
    }
}
