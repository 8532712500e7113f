//! The upload console: one organization's upload screen without the rendering.
//!
//! Owns at most one primary monitoring loop and one history poller. Events from
//! both arrive on a single channel and are filtered in [`UploadConsole::next_event`]:
//! monitor events for a job that is no longer active and history snapshots from an
//! older generation never reach the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::Config;
use crate::api::{ApiError, CurriculumApi};
use crate::diagnose::{self, ContentSelection, DiagnoseError};
use crate::history::{HistoryEvent, HistoryList, HistoryPoller};
use crate::monitor::{MonitorEvent, MonitorHandle, ProgressMonitor};
use crate::store::{ResumeRecord, ResumeStore, StoreError};
use crate::submit::{SubmissionController, SubmitError, UploadForm, ValidationError};
use crate::task::PollTask;
use crate::types::{DiagnosticReport, JobId, JobStatus, Stage};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    Monitor(MonitorEvent),
    History(HistoryEvent),
}

impl From<MonitorEvent> for ConsoleEvent {
    fn from(event: MonitorEvent) -> Self {
        Self::Monitor(event)
    }
}

impl From<HistoryEvent> for ConsoleEvent {
    fn from(event: HistoryEvent) -> Self {
        Self::History(event)
    }
}

/// What the progress panel shows for the primary job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub stage: Option<Stage>,
    pub item: Option<String>,
    pub completed_stages: BTreeSet<Stage>,
    pub course_id: Option<String>,
    pub error: Option<String>,
}

impl JobView {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Processing,
            progress: 0,
            stage: None,
            item: None,
            completed_stages: BTreeSet::new(),
            course_id: None,
            error: None,
        }
    }

    fn apply(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Progress {
                progress,
                stage,
                item,
                completed_stages,
                ..
            } => {
                self.progress = *progress;
                self.stage = *stage;
                self.item = item.clone();
                self.completed_stages = completed_stages.clone();
            }
            MonitorEvent::StatusChanged { status, .. } => self.status = *status,
            MonitorEvent::Succeeded { course_id, .. } => {
                self.status = JobStatus::Approved;
                self.course_id = course_id.clone();
            }
            MonitorEvent::Failed { detail, .. } => {
                self.status = JobStatus::Error;
                self.error = Some(detail.clone());
            }
            MonitorEvent::Settled { status, .. } => self.status = *status,
        }
    }
}

pub struct UploadConsole<A, S: ?Sized> {
    api: Arc<A>,
    config: Arc<Config>,
    record: ResumeRecord<S>,
    controller: SubmissionController<A, S>,
    monitor: ProgressMonitor<A, S>,
    poller: HistoryPoller<A>,
    tx: mpsc::UnboundedSender<ConsoleEvent>,
    rx: mpsc::UnboundedReceiver<ConsoleEvent>,
    active: Option<MonitorHandle<S>>,
    view: Option<JobView>,
    history: HistoryList,
    history_task: Option<PollTask>,
}

impl<A, S> UploadConsole<A, S>
where
    A: CurriculumApi,
    S: ResumeStore + ?Sized + 'static,
{
    pub fn new(api: Arc<A>, store: Arc<S>, config: Arc<Config>) -> Self {
        let record = ResumeRecord::new(store, config.resume_key());
        let controller = SubmissionController::new(api.clone(), record.clone(), config.clone());
        let monitor = ProgressMonitor::new(api.clone(), record.clone(), config.poll_interval());
        let poller = HistoryPoller::new(
            api.clone(),
            config.organization_id.clone(),
            config.history_limit,
            config.history_poll_interval(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            api,
            config,
            record,
            controller,
            monitor,
            poller,
            tx,
            rx,
            active: None,
            view: None,
            history: HistoryList::default(),
            history_task: None,
        }
    }

    /// Reattach to the organization's in-flight job, if any, and load the history.
    ///
    /// Returns the resumed job id. A failed history fetch is logged, not returned.
    pub async fn mount(&mut self) -> Result<Option<JobId>, StoreError> {
        let resumed = self.record.load()?;
        if let Some(job_id) = &resumed {
            log::info!(
                "Resuming curriculum job {} for organization {}",
                job_id,
                self.config.organization_id
            );
            self.start_monitoring(job_id.clone());
        }
        if let Err(e) = self.refresh_history().await {
            log::warn!("Could not load upload history: {}", e);
        }
        Ok(resumed)
    }

    /// Submit `form` and start monitoring the new job.
    ///
    /// The form is never modified here; a failed submission keeps every field.
    pub async fn submit(&mut self, form: &UploadForm) -> Result<JobId, SubmitError> {
        let job_id = self.controller.submit(form).await?;
        self.start_monitoring(job_id.clone());
        self.restart_history_poller();
        Ok(job_id)
    }

    /// Run the diagnostic pass for the form's file and store the resulting selection on it.
    pub async fn diagnose(&self, form: &mut UploadForm) -> Result<DiagnosticReport, DiagnoseError> {
        let file = form.file.as_ref().ok_or(ValidationError::NoInput)?;
        let report = diagnose::run_diagnostic(self.api.as_ref(), file).await?;
        form.content_selection = Some(ContentSelection::from_report(&report));
        Ok(report)
    }

    /// Start over: stop the primary loop, forget the job and clear the form.
    pub fn reset(&mut self, form: &mut UploadForm) -> Result<(), StoreError> {
        if let Some(handle) = self.active.take() {
            log::info!("Resetting; abandoning job {}", handle.job_id());
            handle.reset()?;
        }
        self.record.clear()?;
        self.view = None;
        form.reset();
        self.restart_history_poller();
        Ok(())
    }

    /// Fetch the history list and restart the secondary poller for it.
    pub async fn refresh_history(&mut self) -> Result<(), ApiError> {
        let entries = self
            .api
            .list_uploads(&self.config.organization_id, self.config.history_limit)
            .await?;
        let generation = self.history.replace(entries);
        log::debug!(
            "Loaded {} history entries (generation {})",
            self.history.entries().len(),
            generation
        );
        self.restart_history_poller();
        Ok(())
    }

    pub fn restart_history_poller(&mut self) {
        if let Some(task) = self.history_task.take() {
            task.cancel();
        }
        self.history.advance();
        self.history_task = self
            .poller
            .spawn(&self.history, self.active_job().cloned(), self.tx.clone());
    }

    /// Next event for the caller, or `None` once nothing is running.
    pub async fn next_event(&mut self) -> Option<ConsoleEvent> {
        loop {
            // Tasks send before they exit, so idleness observed first means nothing is in flight.
            let idle = self.is_idle();
            let event = match self.rx.try_recv() {
                Ok(event) => event,
                Err(_) if idle => return None,
                Err(_) => self.rx.recv().await?,
            };
            match event {
                ConsoleEvent::Monitor(event) => {
                    if self.active_job() != Some(event.job_id()) {
                        log::debug!("Dropping event for inactive job {}", event.job_id());
                        continue;
                    }
                    if let Some(view) = &mut self.view {
                        view.apply(&event);
                    }
                    if event.is_final() {
                        self.active = None;
                        if let Err(e) = self.refresh_history().await {
                            log::warn!("Could not refresh upload history: {}", e);
                        }
                    }
                    return Some(ConsoleEvent::Monitor(event));
                }
                ConsoleEvent::History(HistoryEvent::Refreshed {
                    generation,
                    entries,
                }) => {
                    if self.history.apply(generation, entries.clone()) {
                        return Some(ConsoleEvent::History(HistoryEvent::Refreshed {
                            generation,
                            entries,
                        }));
                    }
                }
                ConsoleEvent::History(HistoryEvent::Stopped { generation }) => {
                    if generation == self.history.generation() {
                        self.history_task = None;
                        return Some(ConsoleEvent::History(HistoryEvent::Stopped { generation }));
                    }
                }
            }
        }
    }

    /// Leave the screen: stop both loops but keep the record for a later resume.
    pub fn unmount(mut self) {
        if let Some(task) = self.history_task.take() {
            task.cancel();
        }
        if let Some(handle) = self.active.take() {
            log::info!("Detached from job {}; it can be resumed later", handle.job_id());
            handle.detach();
        }
    }

    pub fn active_job(&self) -> Option<&JobId> {
        self.active.as_ref().map(|h| h.job_id())
    }

    /// Last state of the primary job, kept after it finishes until the next submit or reset.
    pub fn view(&self) -> Option<&JobView> {
        self.view.as_ref()
    }

    pub fn history(&self) -> &HistoryList {
        &self.history
    }

    pub fn is_history_polling(&self) -> bool {
        self.history_task.as_ref().is_some_and(PollTask::is_running)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && !self.is_history_polling()
    }

    fn start_monitoring(&mut self, job_id: JobId) {
        if let Some(previous) = self.active.take() {
            log::debug!("Detaching from job {}", previous.job_id());
            previous.detach();
        }
        self.view = Some(JobView::new(job_id.clone()));
        self.active = Some(self.monitor.watch(job_id, self.tx.clone()));
    }
}
