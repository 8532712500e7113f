//! Organization upload history and its secondary polling loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::api::CurriculumApi;
use crate::task::{Liveness, PollTask};
use crate::types::{HistoryEntry, JobId};

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    /// A fresh list fetched by the poller for snapshot `generation`.
    Refreshed {
        generation: u64,
        entries: Vec<HistoryEntry>,
    },
    /// The poller found nothing left to watch and exited.
    Stopped { generation: u64 },
}

impl HistoryEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Refreshed { generation, .. } | Self::Stopped { generation } => *generation,
        }
    }
}

/// Most recent uploads, tagged with a generation number.
///
/// Every explicit refresh bumps the generation; snapshots produced by a poller
/// that was started for an older generation are dropped.
#[derive(Debug, Clone, Default)]
pub struct HistoryList {
    entries: Vec<HistoryEntry>,
    generation: u64,
}

impl HistoryList {
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &JobId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Install a list from an explicit refresh. Returns the new generation.
    pub fn replace(&mut self, entries: Vec<HistoryEntry>) -> u64 {
        self.entries = entries;
        self.advance()
    }

    /// Start a new generation, orphaning snapshots from earlier pollers.
    pub fn advance(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Install a poller snapshot if it belongs to the current generation.
    pub fn apply(&mut self, generation: u64, entries: Vec<HistoryEntry>) -> bool {
        if generation != self.generation {
            log::debug!(
                "Dropping stale history snapshot (generation {} < {})",
                generation,
                self.generation
            );
            return false;
        }
        self.entries = entries;
        true
    }

    /// Entries still processing, other than `exclude`.
    pub fn processing_ids(&self, exclude: Option<&JobId>) -> Vec<JobId> {
        processing_ids(&self.entries, exclude)
    }
}

fn processing_ids(entries: &[HistoryEntry], exclude: Option<&JobId>) -> Vec<JobId> {
    entries
        .iter()
        .filter(|e| e.is_processing() && Some(&e.id) != exclude)
        .map(|e| e.id.clone())
        .collect()
}

/// Spawns the loop that watches processing rows other than the primary job.
pub struct HistoryPoller<A> {
    api: Arc<A>,
    organization_id: String,
    limit: usize,
    interval: Duration,
}

impl<A: CurriculumApi> HistoryPoller<A> {
    pub fn new(api: Arc<A>, organization_id: impl Into<String>, limit: usize, interval: Duration) -> Self {
        Self {
            api,
            organization_id: organization_id.into(),
            limit,
            interval,
        }
    }

    /// Start polling the current list. Returns `None` when nothing qualifies.
    pub fn spawn<E>(
        &self,
        list: &HistoryList,
        exclude: Option<JobId>,
        events: mpsc::UnboundedSender<E>,
    ) -> Option<PollTask>
    where
        E: From<HistoryEvent> + Send + 'static,
    {
        if list.processing_ids(exclude.as_ref()).is_empty() {
            return None;
        }
        let watch = Watch {
            api: self.api.clone(),
            organization_id: self.organization_id.clone(),
            limit: self.limit,
            interval: self.interval,
            generation: list.generation(),
            exclude,
        };
        let entries = list.entries().to_vec();
        Some(PollTask::spawn(move |live| watch.run(entries, events, live)))
    }
}

struct Watch<A> {
    api: Arc<A>,
    organization_id: String,
    limit: usize,
    interval: Duration,
    generation: u64,
    exclude: Option<JobId>,
}

impl<A: CurriculumApi> Watch<A> {
    async fn run<E>(self, mut entries: Vec<HistoryEntry>, events: mpsc::UnboundedSender<E>, live: Liveness)
    where
        E: From<HistoryEvent> + Send,
    {
        log::debug!("History poller started for generation {}", self.generation);
        loop {
            let candidates = processing_ids(&entries, self.exclude.as_ref());
            if candidates.is_empty() {
                break;
            }
            if !live.sleep(self.interval).await {
                return;
            }

            let Some(changed) = self.any_changed(&entries, &candidates, &live).await else {
                return;
            };
            if !changed {
                continue;
            }

            let Some(result) = live
                .guard(self.api.list_uploads(&self.organization_id, self.limit))
                .await
            else {
                return;
            };
            match result {
                Ok(fresh) => {
                    entries = fresh;
                    let event = HistoryEvent::Refreshed {
                        generation: self.generation,
                        entries: entries.clone(),
                    };
                    if events.send(E::from(event)).is_err() {
                        return;
                    }
                }
                Err(e) => log::warn!("History refresh failed, retrying: {}", e),
            }
        }

        log::debug!("History poller for generation {} has nothing left to watch", self.generation);
        let _ = events.send(E::from(HistoryEvent::Stopped {
            generation: self.generation,
        }));
    }

    /// Poll candidates one after another; `None` means cancelled.
    async fn any_changed(&self, entries: &[HistoryEntry], candidates: &[JobId], live: &Liveness) -> Option<bool> {
        for id in candidates {
            let result = live.guard(self.api.job_status(id)).await?;
            match result {
                Ok(update) => {
                    let stale = entries
                        .iter()
                        .find(|e| &e.id == id)
                        .is_none_or(|e| e.differs_from(&update));
                    if stale {
                        log::debug!("History entry {} changed to {}", id, update.status().label());
                        return Some(true);
                    }
                }
                Err(e) => log::warn!("Status poll for history entry {} failed: {}", id, e),
            }
        }
        Some(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockApi, Step, approved, entry, processing};
    use crate::types::JobStatus;

    fn list(entries: Vec<HistoryEntry>) -> HistoryList {
        let mut list = HistoryList::default();
        list.replace(entries);
        list
    }

    #[test]
    fn stale_snapshots_are_dropped() {
        let mut history = list(vec![entry("job-2", JobStatus::Processing, 10)]);
        let old = history.generation();
        history.replace(vec![entry("job-2", JobStatus::Processing, 30)]);

        assert!(!history.apply(old, vec![entry("job-2", JobStatus::Approved, 100)]));
        assert_eq!(history.entries()[0].progress(), 30);

        let current = history.generation();
        assert!(history.apply(current, vec![entry("job-2", JobStatus::Processing, 40)]));
        assert_eq!(history.entries()[0].progress(), 40);
    }

    #[test]
    fn primary_job_is_not_a_candidate() {
        let history = list(vec![
            entry("job-1", JobStatus::Processing, 10),
            entry("job-2", JobStatus::Processing, 50),
            entry("job-3", JobStatus::Approved, 100),
        ]);
        assert_eq!(
            history.processing_ids(Some(&JobId::new("job-1"))),
            vec![JobId::new("job-2")]
        );
    }

    #[test]
    fn no_poller_without_processing_rows() {
        let api = Arc::new(MockApi::new());
        let poller = HistoryPoller::new(api, "org-1", 10, Duration::from_secs(5));
        let history = list(vec![
            entry("job-1", JobStatus::Processing, 10),
            entry("job-3", JobStatus::Error, 0),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel::<HistoryEvent>();
        assert!(poller.spawn(&history, Some(JobId::new("job-1")), tx).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refetches_on_change_and_stops_when_settled() {
        let api = Arc::new(MockApi::new());
        api.script("job-2", vec![processing(20), processing(60), approved("course-2")]);
        api.push_uploads(vec![entry("job-2", JobStatus::Processing, 60)]);
        api.push_uploads(vec![entry("job-2", JobStatus::Approved, 100)]);

        let history = list(vec![entry("job-2", JobStatus::Processing, 20)]);
        let poller = HistoryPoller::new(api.clone(), "org-1", 10, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryEvent>();
        let task = poller.spawn(&history, None, tx).unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let generation = history.generation();
        assert_eq!(
            events,
            vec![
                HistoryEvent::Refreshed {
                    generation,
                    entries: vec![entry("job-2", JobStatus::Processing, 60)],
                },
                HistoryEvent::Refreshed {
                    generation,
                    entries: vec![entry("job-2", JobStatus::Approved, 100)],
                },
                HistoryEvent::Stopped { generation },
            ]
        );
        assert_eq!(api.status_calls("job-2"), 3);
        assert_eq!(api.list_calls(), 2);
        task.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_candidate_is_polled_each_tick() {
        let api = Arc::new(MockApi::new());
        api.script("job-2", vec![processing(20)]);
        api.script("job-3", vec![Step::Fail, processing(70)]);
        api.push_uploads(vec![
            entry("job-2", JobStatus::Processing, 20),
            entry("job-3", JobStatus::Processing, 70),
        ]);
        let history = list(vec![
            entry("job-2", JobStatus::Processing, 20),
            entry("job-3", JobStatus::Processing, 40),
        ]);
        let poller = HistoryPoller::new(api.clone(), "org-1", 10, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryEvent>();
        let task = poller.spawn(&history, None, tx).unwrap();

        // First tick: job-2 unchanged, job-3 fails; nothing to refetch.
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(api.status_calls("job-2"), 1);
        assert_eq!(api.status_calls("job-3"), 1);
        assert_eq!(api.list_calls(), 0);

        // Second tick: job-2 still unchanged, job-3 moved.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.status_calls("job-2"), 2);
        assert_eq!(api.status_calls("job-3"), 2);
        assert_eq!(api.list_calls(), 1);

        // Third tick: both match the refetched list.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.status_calls("job-2"), 3);
        assert_eq!(api.status_calls("job-3"), 3);
        assert_eq!(api.list_calls(), 1);

        drop(task);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![HistoryEvent::Refreshed {
                generation: history.generation(),
                entries: vec![
                    entry("job-2", JobStatus::Processing, 20),
                    entry("job-3", JobStatus::Processing, 70),
                ],
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_poller_stays_quiet() {
        let api = Arc::new(MockApi::new());
        api.script("job-2", vec![processing(20), processing(90)]);
        let history = list(vec![entry("job-2", JobStatus::Processing, 20)]);
        let poller = HistoryPoller::new(api.clone(), "org-1", 10, Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryEvent>();
        let task = poller.spawn(&history, None, tx).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(api.status_calls("job-2"), 1);
        drop(task);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(api.status_calls("job-2"), 1);
        assert_eq!(api.list_calls(), 0);
        assert!(rx.recv().await.is_none());
    }
}
