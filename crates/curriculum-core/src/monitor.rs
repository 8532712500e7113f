//! Progress monitoring for one curriculum job.
//!
//! [`MonitorSession`] is the state machine (`idle → processing → approved | error`)
//! and owns everything that must not leak between sessions: the monotonic
//! progress tracker and the exactly-once notification guard.
//! [`ProgressMonitor`] drives a session from a cancellable polling loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::api::CurriculumApi;
use crate::store::{ResumeRecord, ResumeStore, StoreError};
use crate::task::{self, Liveness, PollTask};
use crate::types::{JobId, JobStatus, JobUpdate, Stage};

/// Events emitted by a monitoring session.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// New displayed progress. `progress` never decreases within a session.
    Progress {
        job_id: JobId,
        progress: u8,
        stage: Option<Stage>,
        item: Option<String>,
        completed_stages: BTreeSet<Stage>,
    },
    /// The job is queued or in a status this monitor does not drive.
    StatusChanged { job_id: JobId, status: JobStatus },
    /// One-time success notification.
    Succeeded {
        job_id: JobId,
        course_id: Option<String>,
    },
    /// One-time failure notification with the raw backend detail.
    Failed { job_id: JobId, detail: String },
    /// The job left processing for a review state; polling stops without a notification.
    Settled { job_id: JobId, status: JobStatus },
}

impl MonitorEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Progress { job_id, .. }
            | Self::StatusChanged { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Settled { job_id, .. } => job_id,
        }
    }

    /// Whether this event ends the session.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Settled { .. }
        )
    }
}

/// Phase of a monitoring session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorPhase {
    Idle,
    Processing,
    Approved { course_id: Option<String> },
    Failed { detail: String },
    Settled(JobStatus),
}

impl MonitorPhase {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Approved { .. } | Self::Failed { .. } | Self::Settled(_))
    }
}

/// Highest progress seen so far in a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    max: Option<u8>,
}

impl ProgressTracker {
    /// Record a reported value and return the value to display.
    pub fn observe(&mut self, reported: u8) -> u8 {
        let shown = self.max.map_or(reported, |m| m.max(reported));
        self.max = Some(shown);
        shown
    }

    pub fn reset(&mut self) {
        self.max = None;
    }
}

/// Client-side state of one monitored job.
#[derive(Debug, Clone)]
pub struct MonitorSession {
    job_id: JobId,
    phase: MonitorPhase,
    tracker: ProgressTracker,
    displayed: u8,
    stage: Option<Stage>,
    item: Option<String>,
    completed_stages: BTreeSet<Stage>,
    notified: bool,
}

impl MonitorSession {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            phase: MonitorPhase::Idle,
            tracker: ProgressTracker::default(),
            displayed: 0,
            stage: None,
            item: None,
            completed_stages: BTreeSet::new(),
            notified: false,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn phase(&self) -> &MonitorPhase {
        &self.phase
    }

    pub fn displayed_progress(&self) -> u8 {
        self.displayed
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_finished()
    }

    /// `idle → processing`, when polling starts.
    pub fn begin(&mut self) {
        if self.phase == MonitorPhase::Idle {
            self.phase = MonitorPhase::Processing;
        }
    }

    /// Apply one status observation and return the events it produces.
    ///
    /// Observations after the session has finished produce nothing.
    pub fn apply(&mut self, update: JobUpdate) -> Vec<MonitorEvent> {
        if self.phase.is_finished() {
            log::debug!("Ignoring status for finished job {}", self.job_id);
            return Vec::new();
        }

        match update {
            JobUpdate::Processing {
                progress,
                stage,
                item,
                completed_stages,
            } => {
                self.phase = MonitorPhase::Processing;
                self.displayed = self.tracker.observe(progress);
                if stage.is_some() {
                    self.stage = stage;
                }
                self.item = item;
                self.completed_stages.extend(completed_stages);
                vec![self.progress_event()]
            }
            JobUpdate::Approved {
                course_id,
                progress,
            } => {
                self.displayed = self.tracker.observe(progress.unwrap_or(100));
                self.completed_stages.extend(Stage::ALL);
                self.item = None;
                let mut events = vec![self.progress_event()];
                self.tracker.reset();
                self.phase = MonitorPhase::Approved {
                    course_id: course_id.clone(),
                };
                if self.take_notification() {
                    events.push(MonitorEvent::Succeeded {
                        job_id: self.job_id.clone(),
                        course_id,
                    });
                }
                events
            }
            JobUpdate::Failed { detail } => {
                self.tracker.reset();
                self.phase = MonitorPhase::Failed {
                    detail: detail.clone(),
                };
                if self.take_notification() {
                    vec![MonitorEvent::Failed {
                        job_id: self.job_id.clone(),
                        detail,
                    }]
                } else {
                    Vec::new()
                }
            }
            JobUpdate::Waiting { status, .. } => match status {
                JobStatus::ReadyForReview | JobStatus::Rejected => {
                    self.tracker.reset();
                    self.phase = MonitorPhase::Settled(status);
                    vec![MonitorEvent::Settled {
                        job_id: self.job_id.clone(),
                        status,
                    }]
                }
                _ => {
                    self.phase = MonitorPhase::Processing;
                    vec![MonitorEvent::StatusChanged {
                        job_id: self.job_id.clone(),
                        status,
                    }]
                }
            },
        }
    }

    fn take_notification(&mut self) -> bool {
        !std::mem::replace(&mut self.notified, true)
    }

    fn progress_event(&self) -> MonitorEvent {
        MonitorEvent::Progress {
            job_id: self.job_id.clone(),
            progress: self.displayed,
            stage: self.stage,
            item: self.item.clone(),
            completed_stages: self.completed_stages.clone(),
        }
    }
}

/// Starts polling loops for jobs and clears their records when they finish.
pub struct ProgressMonitor<A, S: ?Sized> {
    api: Arc<A>,
    record: ResumeRecord<S>,
    interval: Duration,
}

impl<A, S> ProgressMonitor<A, S>
where
    A: CurriculumApi,
    S: ResumeStore + ?Sized + 'static,
{
    pub fn new(api: Arc<A>, record: ResumeRecord<S>, interval: Duration) -> Self {
        Self {
            api,
            record,
            interval,
        }
    }

    /// Poll `job_id` until it finishes, sending events to `events`.
    ///
    /// The first poll is issued immediately, then one per interval.
    pub fn watch<E>(&self, job_id: JobId, events: mpsc::UnboundedSender<E>) -> MonitorHandle<S>
    where
        E: From<MonitorEvent> + Send + 'static,
    {
        let api = self.api.clone();
        let record = self.record.clone();
        let interval = self.interval;
        let id = job_id.clone();
        let task = PollTask::spawn(move |live| run_monitor(api, record, id, interval, events, live));
        MonitorHandle {
            job_id,
            task,
            record: self.record.clone(),
        }
    }
}

async fn run_monitor<A, S, E>(
    api: Arc<A>,
    record: ResumeRecord<S>,
    job_id: JobId,
    interval: Duration,
    events: mpsc::UnboundedSender<E>,
    live: Liveness,
) where
    A: CurriculumApi,
    S: ResumeStore + ?Sized,
    E: From<MonitorEvent> + Send,
{
    let mut session = MonitorSession::new(job_id.clone());
    session.begin();
    let mut ticker = task::ticker(interval);
    log::info!("Monitoring curriculum job {}", job_id);

    while live.tick(&mut ticker).await {
        let Some(result) = live.guard(api.job_status(&job_id)).await else {
            break;
        };
        let update = match result {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Status poll for job {} failed, retrying: {}", job_id, e);
                continue;
            }
        };
        log::debug!(
            "Job {} reported {} ({:?}%)",
            job_id,
            update.status().label(),
            update.progress()
        );

        let emitted = session.apply(update);
        if session.is_finished() {
            match record.clear_if(&job_id) {
                Ok(true) => log::debug!("Cleared resumability record for job {}", job_id),
                Ok(false) => {}
                Err(e) => log::warn!("Could not clear record for job {}: {}", job_id, e),
            }
            match session.phase() {
                MonitorPhase::Approved { course_id } => log::info!(
                    "Job {} approved (course {})",
                    job_id,
                    course_id.as_deref().unwrap_or("unknown")
                ),
                MonitorPhase::Failed { detail } => {
                    log::info!("Job {} failed: {}", job_id, detail)
                }
                phase => log::info!("Job {} settled in {:?}", job_id, phase),
            }
        }

        if !live.is_alive() {
            break;
        }
        for event in emitted {
            if events.send(E::from(event)).is_err() {
                return;
            }
        }
        if session.is_finished() {
            break;
        }
    }
}

/// Handle on a running monitoring loop.
///
/// Dropping the handle stops polling but keeps the resumability record, which is
/// what a page unload does. [`reset`](Self::reset) also forgets the job.
pub struct MonitorHandle<S: ?Sized> {
    job_id: JobId,
    task: PollTask,
    record: ResumeRecord<S>,
}

impl<S: ResumeStore + ?Sized> MonitorHandle<S> {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Stop polling; the job can still be resumed from its record.
    pub fn detach(self) {
        self.task.cancel();
    }

    /// User-initiated start over: stop polling and clear the record.
    pub fn reset(self) -> Result<(), StoreError> {
        self.task.cancel();
        self.record.clear_if(&self.job_id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockApi, Step, approved, failed, processing};
    use crate::store::MemoryStore;

    const KEY: &str = "curriculum_upload_job_org-1";

    fn displayed(events: &[MonitorEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    fn successes(events: &[MonitorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::Succeeded { .. }))
            .count()
    }

    fn session() -> MonitorSession {
        let mut s = MonitorSession::new(JobId::new("job-1"));
        s.begin();
        s
    }

    #[test]
    fn displayed_progress_is_running_maximum() {
        // Deterministic pseudo-random progress values.
        let mut seed: u32 = 0x2545_f491;
        let reported: Vec<u8> = (0..200)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((seed >> 16) % 101) as u8
            })
            .collect();

        let mut s = session();
        let mut events = Vec::new();
        for p in &reported {
            events.extend(s.apply(JobUpdate::processing(*p)));
        }

        let mut max = 0;
        let expected: Vec<u8> = reported
            .iter()
            .map(|p| {
                max = max.max(*p);
                max
            })
            .collect();
        assert_eq!(displayed(&events), expected);
    }

    #[test]
    fn backend_regression_is_clamped() {
        let mut s = session();
        let mut events = s.apply(JobUpdate::processing(50));
        events.extend(s.apply(JobUpdate::processing(30)));
        assert_eq!(displayed(&events), vec![50, 50]);
    }

    #[test]
    fn repeated_terminal_responses_notify_once() {
        let mut s = session();
        let approved = JobUpdate::Approved {
            course_id: Some("course-9".into()),
            progress: Some(100),
        };
        let mut events = s.apply(JobUpdate::processing(10));
        events.extend(s.apply(approved.clone()));
        events.extend(s.apply(approved.clone()));
        events.extend(s.apply(approved));
        assert_eq!(successes(&events), 1);
        assert_eq!(displayed(&events), vec![10, 100]);
        assert!(s.is_finished());
    }

    #[test]
    fn failure_notifies_once_with_raw_detail() {
        let mut s = session();
        let detail = "Traceback (most recent call last):\n  KeyError: 'modules'";
        let mut events = s.apply(JobUpdate::Failed {
            detail: detail.into(),
        });
        events.extend(s.apply(JobUpdate::Failed {
            detail: "again".into(),
        }));
        assert_eq!(
            events,
            vec![MonitorEvent::Failed {
                job_id: JobId::new("job-1"),
                detail: detail.into()
            }]
        );
    }

    #[test]
    fn stages_accumulate_and_approval_completes_all() {
        let mut s = session();
        s.apply(JobUpdate::Processing {
            progress: 20,
            stage: Some(Stage::Structure),
            item: Some("Module 1".into()),
            completed_stages: [Stage::Parse].into_iter().collect(),
        });
        let events = s.apply(JobUpdate::Processing {
            progress: 40,
            stage: None,
            item: None,
            completed_stages: BTreeSet::new(),
        });
        let MonitorEvent::Progress {
            stage,
            completed_stages,
            ..
        } = &events[0]
        else {
            panic!("expected progress");
        };
        assert_eq!(*stage, Some(Stage::Structure));
        assert!(completed_stages.contains(&Stage::Parse));

        let events = s.apply(JobUpdate::Approved {
            course_id: None,
            progress: None,
        });
        let MonitorEvent::Progress {
            progress,
            completed_stages,
            ..
        } = &events[0]
        else {
            panic!("expected progress");
        };
        assert_eq!(*progress, 100);
        assert_eq!(completed_stages.len(), Stage::ALL.len());
    }

    #[test]
    fn review_states_settle_without_notification() {
        let mut s = session();
        let events = s.apply(JobUpdate::Waiting {
            status: JobStatus::ReadyForReview,
            progress: Some(100),
        });
        assert!(matches!(events.as_slice(), [MonitorEvent::Settled { .. }]));
        assert!(s.is_finished());

        let mut s = session();
        let events = s.apply(JobUpdate::Waiting {
            status: JobStatus::Pending,
            progress: None,
        });
        assert!(matches!(
            events.as_slice(),
            [MonitorEvent::StatusChanged {
                status: JobStatus::Pending,
                ..
            }]
        ));
        assert!(!s.is_finished());
    }

    fn monitor(api: Arc<MockApi>, store: Arc<MemoryStore>) -> ProgressMonitor<MockApi, MemoryStore> {
        ProgressMonitor::new(api, ResumeRecord::new(store, KEY), Duration::from_secs(2))
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_approved_then_clears_record() {
        let api = Arc::new(MockApi::new());
        api.script("job-1", vec![processing(10), processing(45), approved("course-9")]);
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "job-1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = monitor(api.clone(), store.clone()).watch(JobId::new("job-1"), tx);
        let events = drain(&mut rx).await;

        assert_eq!(displayed(&events), vec![10, 45, 100]);
        assert_eq!(successes(&events), 1);
        assert!(matches!(
            events.last(),
            Some(MonitorEvent::Succeeded { course_id: Some(c), .. }) if c == "course-9"
        ));
        assert_eq!(store.get(KEY).unwrap(), None);
        assert_eq!(api.status_calls("job-1"), 3);
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failures_are_retried_silently() {
        let api = Arc::new(MockApi::new());
        api.script(
            "job-1",
            vec![Step::Fail, processing(20), Step::Fail, failed("pipeline crashed")],
        );
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "job-1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = monitor(api.clone(), store.clone()).watch(JobId::new("job-1"), tx);
        let events = drain(&mut rx).await;

        assert_eq!(
            events,
            vec![
                MonitorEvent::Progress {
                    job_id: JobId::new("job-1"),
                    progress: 20,
                    stage: None,
                    item: None,
                    completed_stages: BTreeSet::new(),
                },
                MonitorEvent::Failed {
                    job_id: JobId::new("job-1"),
                    detail: "pipeline crashed".into()
                },
            ]
        );
        assert_eq!(api.status_calls("job-1"), 4);
        assert_eq!(store.get(KEY).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_teardown_is_discarded() {
        let api = Arc::new(MockApi::new());
        api.script("job-1", vec![approved("course-9")]);
        api.set_status_delay(Duration::from_millis(50));
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "job-1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = monitor(api.clone(), store.clone()).watch(JobId::new("job-1"), tx);

        // The first poll is in flight; tear down before it answers.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.status_calls("job-1"), 1);
        handle.detach();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(drain(&mut rx).await.is_empty());
        // Detaching keeps the record so the job can be resumed.
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("job-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_stops_polling_and_clears_record() {
        let api = Arc::new(MockApi::new());
        api.script("job-1", vec![processing(10)]);
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "job-1").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = monitor(api.clone(), store.clone()).watch(JobId::new("job-1"), tx);
        assert!(matches!(rx.recv().await, Some(MonitorEvent::Progress { progress: 10, .. })));

        handle.reset().unwrap();
        let calls = api.status_calls("job-1");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(api.status_calls("job-1"), calls);
        assert!(drain(&mut rx).await.is_empty());
        assert_eq!(store.get(KEY).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn finishing_job_leaves_newer_record_alone() {
        let api = Arc::new(MockApi::new());
        api.script("job-1", vec![approved("course-1")]);
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "job-2").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = monitor(api, store.clone()).watch(JobId::new("job-1"), tx);
        drain(&mut rx).await;

        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("job-2"));
    }
}
