//! Job scheduling for reconciliation work
//!
//! Recurring loops and one-shot endpoint jobs share one task tracker so
//! shutdown can wait for all of them. One-shot jobs are tagged; a tag that is
//! still queued or running cannot be scheduled again.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job {0} is already scheduled")]
    AlreadyScheduled(String),

    #[error("Scheduler is shut down")]
    Closed,
}

/// Removes a job's tag once the job finishes, including by panic or abort
struct TagGuard {
    tags: Arc<Mutex<HashSet<String>>>,
    tag: String,
}

impl Drop for TagGuard {
    fn drop(&mut self) {
        if let Ok(mut tags) = self.tags.lock() {
            tags.remove(&self.tag);
        }
    }
}

pub struct JobScheduler {
    /// Tags of one-shot jobs that are queued or running
    in_flight: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl JobScheduler {
    /// Create a scheduler running at most `max_concurrent` one-shot jobs at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run a long-lived background job
    pub fn spawn<F>(&self, job: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(SchedulerError::Closed);
        }
        self.tracker.spawn(job);
        Ok(())
    }

    /// Run a one-shot job unless a job with the same tag is still pending
    pub fn spawn_once<F>(&self, tag: &str, job: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(SchedulerError::Closed);
        }

        {
            let mut tags = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !tags.insert(tag.to_string()) {
                return Err(SchedulerError::AlreadyScheduled(tag.to_string()));
            }
        }

        let guard = TagGuard {
            tags: self.in_flight.clone(),
            tag: tag.to_string(),
        };
        let permits = self.permits.clone();

        self.tracker.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });

        Ok(())
    }

    pub fn is_scheduled(&self, tag: &str) -> bool {
        self.in_flight
            .lock()
            .map(|tags| tags.contains(tag))
            .unwrap_or(false)
    }

    /// Number of one-shot jobs queued or running
    pub fn pending(&self) -> usize {
        self.in_flight.lock().map(|tags| tags.len()).unwrap_or(0)
    }

    /// Stop accepting jobs and wait for running ones
    ///
    /// Returns false if jobs were still running when `grace` expired.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        debug!(drained = drained, remaining = self.tracker.len(), "Scheduler stopped");
        drained
    }
}
