//! Cancellable timer-driven tasks.
//!
//! A [`PollTask`] owns one spawned polling loop. The loop receives a [`Liveness`]
//! token and must pass every suspension point through it, so once the task is
//! cancelled (explicitly or by dropping the handle) no late response can be
//! applied.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Liveness token handed to a polling loop.
#[derive(Debug, Clone)]
pub struct Liveness {
    token: CancellationToken,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once the owning task has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` unless the task is cancelled first.
    ///
    /// Returns `None` when cancelled, including when cancellation raced with a
    /// completed future: a result that arrives after teardown is discarded.
    pub async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        let out = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            out = fut => out,
        };
        self.is_alive().then_some(out)
    }

    /// Wait for the next tick. `false` means the task was cancelled.
    pub async fn tick(&self, interval: &mut Interval) -> bool {
        self.guard(interval.tick()).await.is_some()
    }

    /// Sleep for `duration`. `false` means the task was cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.guard(tokio::time::sleep(duration)).await.is_some()
    }
}

/// Handle on a spawned polling loop. Dropping the handle cancels the loop.
#[derive(Debug)]
pub struct PollTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PollTask {
    /// Start `body` on the runtime with a fresh liveness token.
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Liveness) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let liveness = Liveness {
            token: token.clone(),
        };
        let handle = tokio::spawn(body(liveness));
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Tear the loop down immediately. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the loop is still running (not finished and not cancelled).
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            token: self.token.clone(),
        }
    }

    /// Wait for the loop to exit on its own (or after [`cancel`](Self::cancel)).
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("polling task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Fixed-rate ticker that fires immediately and then every `period`.
///
/// Slow responses delay the next tick instead of producing a burst.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
