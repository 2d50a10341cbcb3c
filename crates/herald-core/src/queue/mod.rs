//! Dispatch queue: job state, retry/backoff policy, and the in-memory and
//! SQLite implementations.
//!
//! The queue decouples the scheduler (producer) from the worker pool
//! (consumers). Delivery is at-least-once: a job is handed out again if its
//! lease fails or expires while attempts remain.

mod limiter;
mod memory;
mod record;
mod retry;
mod sqlite;
mod state;

pub use limiter::ThroughputLimiter;
pub use memory::InMemoryDispatchQueue;
pub use record::JobRecord;
pub use retry::BackoffPolicy;
pub use sqlite::SqliteDispatchQueue;
pub use state::JobState;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DeliveryJob, JobId};

/// Per-job options passed to `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    pub backoff: BackoffPolicy,

    /// Prune the record once the job succeeds.
    pub remove_on_success: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            remove_on_success: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    /// The lease expired (or was otherwise superseded) before the worker reported back.
    #[error("lease on {job_id} attempt {attempt} is no longer held")]
    LeaseLost { job_id: JobId, attempt: u32 },

    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

/// What the queue decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt will be handed out after `delay`.
    RetryScheduled { delay: Duration },
    /// Attempts exhausted; the job is dropped.
    Dead,
}

/// A leased job for processing.
/// The worker owns this lease and must either `ack` or `fail`.
///
/// Design intent:
/// - Queue manages state transitions (Queued -> Running -> ...).
/// - Worker executes side effects and reports the result.
/// - Dropping a lease without reporting leaves the job Running until the
///   visibility timeout expires, then it counts as a failed attempt.
#[async_trait]
pub trait JobLease: Send + Sync {
    fn job_id(&self) -> JobId;

    fn job(&self) -> &DeliveryJob;

    /// 1-indexed attempt number of this lease.
    fn attempt(&self) -> u32;

    fn max_attempts(&self) -> u32;

    /// No further attempt will follow if this one fails.
    fn is_final_attempt(&self) -> bool {
        self.attempt() >= self.max_attempts()
    }

    /// Mark success.
    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    /// Mark failure (queue decides retry/dead policy).
    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, QueueError>;
}

/// Dispatch queue port.
/// In-memory or a SQLite table; this trait is also the seam for an external broker.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Enqueue a new job.
    async fn enqueue(&self, job: DeliveryJob, options: JobOptions) -> Result<JobId, QueueError>;

    /// Lease one ready job (waits until available, or returns None once closed).
    async fn lease(&self) -> Option<Box<dyn JobLease>>;

    /// Stop handing out leases and wake every waiting `lease` call.
    async fn close(&self);

    async fn counts_by_state(&self) -> Result<QueueCounts, QueueError>;
}

/// Queue observability snapshot.
///
/// `succeeded` and `dead` are running totals; their records may already have
/// been pruned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub retry_scheduled: usize,
    pub succeeded: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Jobs that may still be handed to a worker.
    pub fn in_flight(&self) -> usize {
        self.queued + self.running + self.retry_scheduled
    }
}
