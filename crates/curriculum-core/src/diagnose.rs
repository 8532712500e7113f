//! Optional pre-submission analysis of container archives.
//!
//! The diagnostic pass is advisory: it estimates how much of an `.imscc`/`.zip`
//! the pipeline can use and lets the user deselect categories. Skipping it submits
//! the default categories.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::api::{ApiError, CurriculumApi};
use crate::submit::{UploadFile, ValidationError};
use crate::types::{ContentType, DiagnosticReport};

#[derive(Error, Debug)]
pub enum DiagnoseError {
    #[error("Diagnostics are only available for .imscc and .zip files, not \"{file_name}\"")]
    NotContainer { file_name: String },
    #[error("{0}")]
    Invalid(#[from] ValidationError),
    #[error("diagnostic request failed: {0}")]
    Api(#[from] ApiError),
}

/// Checkbox state of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryState {
    pub checked: bool,
    /// Items discovered by the diagnostic pass; `None` before it has run.
    pub found: Option<u32>,
    pub extractable: Option<bool>,
}

impl CategoryState {
    /// Categories with nothing discovered cannot be selected.
    pub fn is_enabled(&self) -> bool {
        self.found != Some(0)
    }
}

/// Discussions and quizzes are not extracted yet, so they start unchecked.
pub fn default_checked(content_type: ContentType) -> bool {
    matches!(content_type, ContentType::Assignments | ContentType::Pages)
}

/// Per-category selection, independent for each category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSelection {
    categories: BTreeMap<ContentType, CategoryState>,
}

impl Default for ContentSelection {
    fn default() -> Self {
        let categories = ContentType::ALL
            .into_iter()
            .map(|t| {
                (
                    t,
                    CategoryState {
                        checked: default_checked(t),
                        found: None,
                        extractable: None,
                    },
                )
            })
            .collect();
        Self { categories }
    }
}

impl ContentSelection {
    pub fn from_report(report: &DiagnosticReport) -> Self {
        let categories = ContentType::ALL
            .into_iter()
            .map(|t| {
                let resource = report.resource(t);
                (
                    t,
                    CategoryState {
                        checked: default_checked(t),
                        found: Some(resource.found),
                        extractable: Some(resource.extractable),
                    },
                )
            })
            .collect();
        Self { categories }
    }

    pub fn state(&self, content_type: ContentType) -> CategoryState {
        self.categories
            .get(&content_type)
            .copied()
            .unwrap_or(CategoryState {
                checked: false,
                found: None,
                extractable: None,
            })
    }

    pub fn set(&mut self, content_type: ContentType, checked: bool) {
        if let Some(state) = self.categories.get_mut(&content_type) {
            state.checked = checked;
        }
    }

    pub fn toggle(&mut self, content_type: ContentType) {
        if let Some(state) = self.categories.get_mut(&content_type) {
            state.checked = !state.checked;
        }
    }

    /// Checked categories that are enabled, in a stable order.
    pub fn selected(&self) -> Vec<ContentType> {
        self.categories
            .iter()
            .filter(|(_, s)| s.checked && s.is_enabled())
            .map(|(t, _)| *t)
            .collect()
    }
}

/// Run the diagnostic pass for `file`.
///
/// Non-container files are refused without a network call.
pub async fn run_diagnostic<A: CurriculumApi>(
    api: &A,
    file: &UploadFile,
) -> Result<DiagnosticReport, DiagnoseError> {
    if !file.is_container() {
        return Err(DiagnoseError::NotContainer {
            file_name: file.file_name.clone(),
        });
    }
    file.validate()?;

    let report = api.diagnose(file).await?;
    log::info!(
        "Diagnosed {}: {:.0}% estimated coverage, {} modules",
        file.file_name,
        report.coverage_estimate,
        report.modules_found
    );
    Ok(report)
}
