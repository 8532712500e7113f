//! Scripted in-memory backend for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::api::{ApiError, CurriculumApi};
use crate::submit::{UploadFile, UploadRequest};
use crate::types::{DiagnosticReport, HistoryEntry, JobId, JobStatus, JobUpdate};

/// One scripted status response.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Update(JobUpdate),
    /// Transient failure (network or 5xx).
    Fail,
}

pub(crate) fn processing(progress: u8) -> Step {
    Step::Update(JobUpdate::processing(progress))
}

pub(crate) fn approved(course_id: &str) -> Step {
    Step::Update(JobUpdate::Approved {
        course_id: Some(course_id.to_string()),
        progress: Some(100),
    })
}

pub(crate) fn failed(detail: &str) -> Step {
    Step::Update(JobUpdate::Failed {
        detail: detail.to_string(),
    })
}

pub(crate) fn entry(id: &str, status: JobStatus, progress: u8) -> HistoryEntry {
    HistoryEntry {
        id: JobId::new(id),
        original_filename: Some(format!("{id}.pdf")),
        status,
        progress_percent: Some(progress),
        uploaded_at: Some("2026-10-01T09:30:00Z".into()),
        created_course_id: None,
        error_message: None,
    }
}

type StartResult = Result<JobId, (Option<u16>, Option<String>)>;

/// Status scripts replay in order; the last step repeats forever.
pub(crate) struct MockApi {
    scripts: Mutex<HashMap<JobId, VecDeque<Step>>>,
    status_delay: Mutex<Option<Duration>>,
    start_result: Mutex<StartResult>,
    uploads: Mutex<VecDeque<Vec<HistoryEntry>>>,
    diagnostic: Mutex<Option<DiagnosticReport>>,
    last_request: Mutex<Option<UploadRequest>>,
    status_calls: Mutex<HashMap<JobId, usize>>,
    start_calls: AtomicUsize,
    list_calls: AtomicUsize,
    diagnose_calls: AtomicUsize,
}

impl MockApi {
    pub(crate) fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            status_delay: Mutex::new(None),
            start_result: Mutex::new(Ok(JobId::new("job-1"))),
            uploads: Mutex::new(VecDeque::new()),
            diagnostic: Mutex::new(None),
            last_request: Mutex::new(None),
            status_calls: Mutex::new(HashMap::new()),
            start_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            diagnose_calls: AtomicUsize::new(0),
        }
    }

    /// Replace the status script for `job`.
    pub(crate) fn script(&self, job: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(JobId::new(job), steps.into_iter().collect());
    }

    /// Delay every status response by `delay` (after the request is counted).
    pub(crate) fn set_status_delay(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_start_result(&self, result: Result<JobId, ApiError>) {
        *self.start_result.lock().unwrap() = result.map_err(|e| match e {
            ApiError::Rejected { status, message } => (status, message),
            _ => (None, None),
        });
    }

    /// Queue history pages; the last one repeats.
    pub(crate) fn push_uploads(&self, entries: Vec<HistoryEntry>) {
        self.uploads.lock().unwrap().push_back(entries);
    }

    pub(crate) fn set_diagnostic(&self, report: DiagnosticReport) {
        *self.diagnostic.lock().unwrap() = Some(report);
    }

    pub(crate) fn last_request(&self) -> Option<UploadRequest> {
        self.last_request.lock().unwrap().clone()
    }

    pub(crate) fn status_calls(&self, job: &str) -> usize {
        self.status_calls
            .lock()
            .unwrap()
            .get(&JobId::new(job))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn diagnose_calls(&self) -> usize {
        self.diagnose_calls.load(Ordering::SeqCst)
    }

    fn next_step(&self, job_id: &JobId) -> Option<Step> {
        *self
            .status_calls
            .lock()
            .unwrap()
            .entry(job_id.clone())
            .or_insert(0) += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts.get_mut(job_id)?;
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

impl CurriculumApi for MockApi {
    async fn diagnose(&self, _file: &UploadFile) -> Result<DiagnosticReport, ApiError> {
        self.diagnose_calls.fetch_add(1, Ordering::SeqCst);
        let report = self.diagnostic.lock().unwrap().clone();
        report.ok_or(ApiError::Rejected {
            status: Some(500),
            message: Some("no diagnostic scripted".into()),
        })
    }

    async fn start_upload(&self, request: &UploadRequest) -> Result<JobId, ApiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let result = self.start_result.lock().unwrap().clone();
        result.map_err(|(status, message)| ApiError::Rejected { status, message })
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobUpdate, ApiError> {
        let step = self.next_step(job_id);
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match step {
            Some(Step::Update(update)) => Ok(update),
            Some(Step::Fail) => Err(ApiError::Rejected {
                status: Some(503),
                message: None,
            }),
            None => Err(ApiError::Rejected {
                status: Some(404),
                message: Some(format!("unknown job {}", job_id)),
            }),
        }
    }

    async fn list_uploads(
        &self,
        _organization_id: &str,
        _limit: usize,
    ) -> Result<Vec<HistoryEntry>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut pages = self.uploads.lock().unwrap();
        let page = if pages.len() > 1 {
            pages.pop_front()
        } else {
            pages.front().cloned()
        };
        Ok(page.unwrap_or_default())
    }
}
