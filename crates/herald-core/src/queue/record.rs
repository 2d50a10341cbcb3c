//! Job record: queue-side metadata + the delivery job.

use super::{JobOptions, JobState};
use crate::domain::{DeliveryJob, JobId};

/// Metadata + payload for a job in the queue.
///
/// Design:
/// - This is the queue's single source of truth for job state.
/// - Queue structures (ready/scheduled/inflight) hold JobId only.
/// - All state transitions happen here.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub job: DeliveryJob,
    pub options: JobOptions,
    pub state: JobState,

    /// Number of times this job has been leased (including the current lease if Running).
    pub attempts: u32,

    /// Last error message (if any).
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn new(id: JobId, job: DeliveryJob, options: JobOptions) -> Self {
        Self {
            id,
            job,
            options,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
        }
    }

    /// Mark as running (increment attempts).
    pub fn start_attempt(&mut self) {
        self.state = JobState::Running;
        self.attempts += 1;
    }

    /// Does `attempt` identify the lease currently held on this record?
    pub fn holds_lease(&self, attempt: u32) -> bool {
        self.state == JobState::Running && self.attempts == attempt
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.options.max_attempts
    }

    /// Mark as succeeded.
    pub fn mark_succeeded(&mut self) {
        self.state = JobState::Succeeded;
    }

    /// Mark as dead (max attempts exhausted).
    pub fn mark_dead(&mut self, error: String) {
        self.state = JobState::Dead;
        self.last_error = Some(error);
    }

    /// Wait out the backoff; the queue keeps the deadline.
    pub fn schedule_retry(&mut self, error: String) {
        self.state = JobState::RetryScheduled;
        self.last_error = Some(error);
    }

    /// Move from RetryScheduled back to Queued.
    pub fn requeue(&mut self) {
        self.state = JobState::Queued;
    }
}
