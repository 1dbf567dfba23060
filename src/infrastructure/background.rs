//! Fire-and-forget work that outlives the request
//!
//! Cache writes, log persistence and billing run after the client already has
//! its response. Tasks are tracked so shutdown can wait for them to drain.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Tracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count even if the task panics
struct InFlight(Arc<Tracker>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: Arc<Tracker>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` detached from the caller
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlight(self.tracker.clone());
        tokio::spawn(async move {
            let _guard = guard;
            task.await;
            debug!(task = name, "Background task finished");
        });
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no task is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.tracker.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
    ///
    /// Returns `false` when tasks were still running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            return true;
        }
        warn!(
            in_flight = self.in_flight(),
            "Background tasks still running at shutdown"
        );
        false
    }
}
